//! Container runtime abstraction.
//!
//! The launcher never links against a container engine; it drives one over
//! its CLI. [`ContainerRuntime`] is the seam: the orchestrator and the
//! session registry speak to it for image checks, liveness queries, and the
//! foreground run itself, which keeps both testable with an in-memory fake.
//!
//! [`build_run_args`] constructs the full `run` argument vector and is
//! exposed so tests can inspect the constructed command without a daemon.

mod cli;

pub use cli::CliRuntime;

use std::path::PathBuf;

use crate::error::RuntimeError;
use crate::session::MountSpec;

/// Longest accepted image reference.
const IMAGE_NAME_MAX: usize = 256;

/// A container image build request.
#[derive(Debug, Clone)]
pub struct ImageBuild {
    /// Build context directory.
    pub context_dir: PathBuf,
    /// Containerfile within (or outside of) the context.
    pub containerfile: PathBuf,
    /// Tag for the built image.
    pub tag: String,
    /// `--build-arg` key/value pairs.
    pub build_args: Vec<(String, String)>,
}

/// Everything needed to run one session container in the foreground.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Image reference (`repo:tag`).
    pub image: String,
    /// Container name; must be unique among running containers.
    pub container_name: String,
    /// Ordered bind mounts.
    pub mounts: Vec<MountSpec>,
    /// Environment variables set inside the container.
    pub env: Vec<(String, String)>,
    /// Capabilities added back on top of `--cap-drop ALL`.
    pub extra_caps: Vec<String>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Command and arguments; empty means the image default.
    pub command: Vec<String>,
    /// Allocate an interactive TTY.
    pub interactive: bool,
}

impl RunSpec {
    /// Creates a spec with the given image and container name, interactive
    /// by default and otherwise empty.
    #[must_use]
    pub fn new(image: impl Into<String>, container_name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            container_name: container_name.into(),
            mounts: Vec::new(),
            env: Vec::new(),
            extra_caps: Vec::new(),
            workdir: None,
            command: Vec::new(),
            interactive: true,
        }
    }

    /// Sets the bind mounts.
    #[must_use]
    pub fn with_mounts(mut self, mounts: Vec<MountSpec>) -> Self {
        self.mounts = mounts;
        self
    }

    /// Sets the container environment.
    #[must_use]
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Adds capabilities back on top of the dropped-all baseline.
    #[must_use]
    pub fn with_extra_caps(mut self, caps: Vec<String>) -> Self {
        self.extra_caps = caps;
        self
    }

    /// Sets the working directory inside the container.
    #[must_use]
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Sets the command run inside the container.
    #[must_use]
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Disables the interactive TTY (used by non-interactive callers).
    #[must_use]
    pub fn without_tty(mut self) -> Self {
        self.interactive = false;
        self
    }
}

/// Interface to a container engine.
pub trait ContainerRuntime {
    /// Engine name for logs (`docker`, `podman`).
    fn name(&self) -> &str;

    /// Whether the image reference exists locally.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError` if the query cannot be executed.
    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Builds an image.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::BuildFailed` if the build exits non-zero.
    fn build_image(&self, build: &ImageBuild) -> Result<(), RuntimeError>;

    /// Whether a container with exactly this name is currently running.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError` if the query cannot be executed.
    fn container_running(&self, container_name: &str) -> Result<bool, RuntimeError>;

    /// Runs the container in the foreground and returns its exit code.
    ///
    /// `on_started` fires once the container is observed running (or once
    /// it provably ran, for containers that exit faster than observation).
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::StartFailed` if the container never came up.
    fn run(&self, spec: &RunSpec, on_started: &mut dyn FnMut()) -> Result<i32, RuntimeError>;
}

/// Builds the full `run` argument vector for a spec.
///
/// Exposed for testing so the constructed command can be inspected without
/// actually invoking a runtime.
///
/// # Errors
///
/// Returns `RuntimeError::InvalidSpec` if any component fails validation.
pub fn build_run_args(spec: &RunSpec) -> Result<Vec<String>, RuntimeError> {
    validate_image_name(&spec.image)?;
    validate_container_name(&spec.container_name)?;

    let mut args = Vec::new();
    args.push("run".to_string());
    args.push("--rm".to_string());
    if spec.interactive {
        args.push("--interactive".to_string());
        args.push("--tty".to_string());
    }
    args.push("--name".to_string());
    args.push(spec.container_name.clone());

    args.push("--cap-drop".to_string());
    args.push("ALL".to_string());
    for cap in &spec.extra_caps {
        validate_capability(cap)?;
        args.push("--cap-add".to_string());
        args.push(cap.clone());
    }
    args.push("--security-opt".to_string());
    args.push("no-new-privileges".to_string());

    for mount in &spec.mounts {
        validate_mount_path(&mount.host)?;
        validate_mount_path(&mount.container)?;
        args.push("-v".to_string());
        args.push(mount.volume_arg());
    }

    for (key, val) in &spec.env {
        validate_env_var(key, val)?;
        args.push("-e".to_string());
        args.push(format!("{key}={val}"));
    }

    if let Some(workdir) = &spec.workdir {
        args.push("-w".to_string());
        args.push(workdir.clone());
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());

    Ok(args)
}

/// Validates an image reference.
///
/// Allowed characters: alphanumeric, hyphens, dots, colons, slashes,
/// underscores, and `@`. Covers references like `ubuntu:22.04` and
/// `ghcr.io/org/image:tag`.
pub fn validate_image_name(image: &str) -> Result<(), RuntimeError> {
    if image.is_empty() {
        return Err(RuntimeError::InvalidSpec {
            reason: "image reference cannot be empty".to_string(),
        });
    }

    if image.len() > IMAGE_NAME_MAX {
        return Err(RuntimeError::InvalidSpec {
            reason: format!("image reference exceeds {IMAGE_NAME_MAX} characters"),
        });
    }

    for ch in image.chars() {
        if !ch.is_ascii_alphanumeric()
            && ch != '-'
            && ch != '.'
            && ch != ':'
            && ch != '/'
            && ch != '_'
            && ch != '@'
        {
            return Err(RuntimeError::InvalidSpec {
                reason: format!("image reference contains invalid character {ch:?}"),
            });
        }
    }

    if image.starts_with('-') || image.starts_with('.') || image.starts_with(':') {
        return Err(RuntimeError::InvalidSpec {
            reason: format!("image reference cannot start with {:?}", &image[..1]),
        });
    }

    Ok(())
}

/// Validates a container name: leading alphanumeric, then alphanumerics,
/// underscores, dots, and hyphens.
fn validate_container_name(name: &str) -> Result<(), RuntimeError> {
    let mut chars = name.chars();
    let valid_first = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if valid_first && valid_rest {
        Ok(())
    } else {
        Err(RuntimeError::InvalidSpec {
            reason: format!("invalid container name {name:?}"),
        })
    }
}

/// Rejects mount paths that are relative or could smuggle extra arguments.
fn validate_mount_path(path: &std::path::Path) -> Result<(), RuntimeError> {
    let text = path.to_string_lossy();

    if !path.is_absolute() {
        return Err(RuntimeError::InvalidSpec {
            reason: format!("mount path is not absolute: {text}"),
        });
    }

    if text.contains('\0') || text.contains('\n') || text.contains('\r') || text.contains(':') {
        return Err(RuntimeError::InvalidSpec {
            reason: format!("mount path contains invalid character: {text:?}"),
        });
    }

    for component in path.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(RuntimeError::InvalidSpec {
                reason: format!("mount path contains '..' component: {text}"),
            });
        }
    }

    Ok(())
}

/// Validates a capability name (`NET_ADMIN` style).
fn validate_capability(cap: &str) -> Result<(), RuntimeError> {
    if !cap.is_empty() && cap.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
        Ok(())
    } else {
        Err(RuntimeError::InvalidSpec {
            reason: format!("invalid capability name {cap:?}"),
        })
    }
}

/// Validates an environment variable pair.
fn validate_env_var(key: &str, val: &str) -> Result<(), RuntimeError> {
    if key.is_empty()
        || key.contains('=')
        || key.contains('\0')
        || key.contains('\n')
        || val.contains('\0')
        || val.contains('\n')
    {
        return Err(RuntimeError::InvalidSpec {
            reason: format!("invalid environment variable {key:?}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> RunSpec {
        RunSpec::new("ghcr.io/ssm-dev/agent-sandbox:latest", "ssm-widget-abc123")
            .with_mounts(vec![
                MountSpec::read_write("/home/dev/widget", "/workspace"),
                MountSpec::read_only("/etc/hosts", "/etc/hosts.host"),
            ])
            .with_env(vec![("TERM".to_string(), "xterm-256color".to_string())])
            .with_workdir("/workspace")
            .with_command(vec!["agent".to_string()])
    }

    #[test]
    fn test_run_args_shape() {
        let args = build_run_args(&test_spec()).expect("build args");

        assert_eq!(args[0], "run");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"--interactive".to_string()));
        assert!(args.contains(&"--tty".to_string()));

        // Image comes before the command, command is last.
        let image_pos = args
            .iter()
            .position(|a| a == "ghcr.io/ssm-dev/agent-sandbox:latest")
            .expect("image present");
        assert_eq!(args[image_pos + 1], "agent");
        assert_eq!(args.len(), image_pos + 2);
    }

    #[test]
    fn test_run_args_caps_dropped_by_default() {
        let args = build_run_args(&test_spec()).expect("build args");

        let drop_pos = args.iter().position(|a| a == "--cap-drop").expect("drop");
        assert_eq!(args[drop_pos + 1], "ALL");
        assert!(!args.contains(&"--cap-add".to_string()));
        assert!(args.contains(&"no-new-privileges".to_string()));
    }

    #[test]
    fn test_run_args_firewall_caps_added() {
        let spec = test_spec()
            .with_extra_caps(vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()]);
        let args = build_run_args(&spec).expect("build args");

        let adds: Vec<&String> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "--cap-add")
            .map(|(i, _)| &args[i + 1])
            .collect();
        assert_eq!(adds, ["NET_ADMIN", "NET_RAW"]);
    }

    #[test]
    fn test_run_args_mounts_in_order() {
        let args = build_run_args(&test_spec()).expect("build args");

        let volumes: Vec<&String> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-v")
            .map(|(i, _)| &args[i + 1])
            .collect();
        assert_eq!(
            volumes,
            [
                "/home/dev/widget:/workspace:rw",
                "/etc/hosts:/etc/hosts.host:ro"
            ]
        );
    }

    #[test]
    fn test_run_args_non_interactive() {
        let args = build_run_args(&test_spec().without_tty()).expect("build args");
        assert!(!args.contains(&"--tty".to_string()));
    }

    #[test]
    fn test_image_name_validation() {
        assert!(validate_image_name("ubuntu:22.04").is_ok());
        assert!(validate_image_name("ghcr.io/org/image@sha256:abc").is_ok());
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("-leading-dash").is_err());
        assert!(validate_image_name("bad image").is_err());
        assert!(validate_image_name(&"x".repeat(300)).is_err());
    }

    #[test]
    fn test_container_name_validation() {
        assert!(validate_container_name("ssm-widget-1a2b").is_ok());
        assert!(validate_container_name("-bad").is_err());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("has space").is_err());
    }

    #[test]
    fn test_mount_path_validation() {
        let mut spec = test_spec();
        spec.mounts = vec![MountSpec::read_write("relative/path", "/workspace")];
        assert!(build_run_args(&spec).is_err());

        spec.mounts = vec![MountSpec::read_write("/ok/../sneaky", "/workspace")];
        assert!(build_run_args(&spec).is_err());

        spec.mounts = vec![MountSpec::read_write("/with:colon", "/workspace")];
        assert!(build_run_args(&spec).is_err());
    }

    #[test]
    fn test_env_validation() {
        let mut spec = test_spec();
        spec.env = vec![("BAD=KEY".to_string(), "v".to_string())];
        assert!(build_run_args(&spec).is_err());

        spec.env = vec![("OK_KEY".to_string(), "line\nbreak".to_string())];
        assert!(build_run_args(&spec).is_err());
    }
}
