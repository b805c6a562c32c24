//! Typed launch configuration: flags, config-root files, version resolution.
//!
//! Everything the orchestrator branches on is gathered here once, up front,
//! so the launch pipeline itself is a straight walk over a fixed structure.

use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ConfigError;
use crate::listfile;

/// Default image repository; the resolved version becomes its tag.
pub const DEFAULT_IMAGE_REPO: &str = "ghcr.io/ssm-dev/agent-sandbox";

/// The agent executable the sandbox image provides on PATH.
pub const AGENT_COMMAND: &str = "agent";

/// Tag given to locally built sandbox images.
pub const LOCAL_IMAGE: &str = "agent-sandbox:local";

/// Per-project pinned-version file, looked up in the workspace.
pub const PINNED_VERSION_FILE: &str = ".agent-version";

/// Version used when neither a flag nor a pinned file names one.
pub const DEFAULT_VERSION: &str = "latest";

/// Environment variables copied into the container when set on the host.
pub const PASSTHROUGH_ENV: [&str; 5] = [
    "AGENT_USE_VERTEX",
    "VERTEX_PROJECT_ID",
    "VERTEX_REGION",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "TERM",
];

/// Well-known files under the launcher's config root.
///
/// Nothing here touches the filesystem; existence checks belong to the
/// callers that care (the mount planner, the orchestrator's validations).
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    root: PathBuf,
}

impl ConfigPaths {
    /// Config paths rooted at an explicit directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Config paths at the conventional location:
    /// `$XDG_CONFIG_HOME/ssm`, else `~/.config/ssm`, else `/tmp/ssm-config`.
    #[must_use]
    pub fn discover() -> Self {
        let root = env::var("XDG_CONFIG_HOME")
            .map(|base| PathBuf::from(base).join("ssm"))
            .or_else(|_| {
                env::var("HOME").map(|home| PathBuf::from(home).join(".config").join("ssm"))
            })
            .unwrap_or_else(|_| PathBuf::from("/tmp/ssm-config"));
        Self::new(root)
    }

    /// The config root directory itself.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Domain allow-list consumed by firewall mode.
    #[must_use]
    pub fn allow_list(&self) -> PathBuf {
        self.root.join("allowed-domains.txt")
    }

    /// Extra OS packages baked into locally built images.
    #[must_use]
    pub fn packages_file(&self) -> PathBuf {
        self.root.join("packages.txt")
    }

    /// Build context directory for `--build`.
    #[must_use]
    pub fn build_context(&self) -> PathBuf {
        self.root.join("image")
    }

    /// The Containerfile inside the build context.
    #[must_use]
    pub fn containerfile(&self) -> PathBuf {
        self.build_context().join("Containerfile")
    }

    /// Shared agent configuration mounted read-only into every session.
    #[must_use]
    pub fn shared_dir(&self) -> PathBuf {
        self.root.join("shared")
    }

    /// Credential file mounted read-only when present.
    #[must_use]
    pub fn credentials_file(&self) -> PathBuf {
        self.root.join("credentials.json")
    }
}

/// A fully gathered launch request.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Explicit version from the command line, if any.
    pub agent_version: Option<String>,
    /// Run the locally built image instead of a registry tag.
    pub local: bool,
    /// Build the local image before launching.
    pub build: bool,
    /// Initialize the egress firewall inside the container.
    pub with_firewall: bool,
    /// Skip display-socket mounts.
    pub no_clipboard: bool,
    /// Alternate-backend mode; affects only the container environment.
    pub vertex_ai: bool,
    /// Arguments forwarded verbatim to the contained agent.
    pub agent_args: Vec<String>,
    /// Canonicalized working directory; the project identity derives from it.
    pub workspace: PathBuf,
    /// Config-root file locations.
    pub config: ConfigPaths,
    /// Root under which per-project state (registry, data dirs) lives.
    pub data_root: PathBuf,
}

/// Canonicalizes the current working directory.
pub fn current_workspace() -> Result<PathBuf, ConfigError> {
    env::current_dir()
        .and_then(|dir| dir.canonicalize())
        .map_err(|source| ConfigError::WorkingDirectory { source })
}

/// Whether the alternate-backend toggle is set on the host.
#[must_use]
pub fn vertex_enabled() -> bool {
    matches!(
        env::var("AGENT_USE_VERTEX").as_deref(),
        Ok("1") | Ok("true")
    )
}

/// Resolves the agent version: explicit flag, then the workspace's pinned
/// file, then [`DEFAULT_VERSION`]. The first present source wins.
pub fn resolve_version(
    flag: Option<&str>,
    workspace: &Path,
) -> Result<String, ConfigError> {
    if let Some(version) = flag {
        validate_version(version)?;
        debug!(version, "using version from flag");
        return Ok(version.to_string());
    }

    let pinned_file = workspace.join(PINNED_VERSION_FILE);
    let pinned = listfile::read_optional(&pinned_file).map_err(|source| {
        ConfigError::ListFileRead {
            path: pinned_file.clone(),
            source,
        }
    })?;
    if let Some(version) = pinned.first() {
        validate_version(version)?;
        debug!(version, file = %pinned_file.display(), "using pinned version");
        return Ok(version.clone());
    }

    Ok(DEFAULT_VERSION.to_string())
}

/// The image reference to run: the local tag when `--local` or `--build`
/// was given, otherwise the (possibly overridden) repository plus version.
#[must_use]
pub fn image_reference(options: &LaunchOptions, version: &str) -> String {
    if options.local || options.build {
        return LOCAL_IMAGE.to_string();
    }
    let repo = env::var("SSM_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE_REPO.to_string());
    format!("{repo}:{version}")
}

/// Host environment variables forwarded into the container, in
/// [`PASSTHROUGH_ENV`] order, unset ones omitted.
#[must_use]
pub fn passthrough_env() -> Vec<(String, String)> {
    PASSTHROUGH_ENV
        .iter()
        .filter_map(|key| env::var(key).ok().map(|val| ((*key).to_string(), val)))
        .collect()
}

/// Version tags share the image-tag charset: leading alphanumeric or
/// underscore, then alphanumerics, dots, underscores, and hyphens.
fn validate_version(version: &str) -> Result<(), ConfigError> {
    let mut chars = version.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid_first && valid_rest && version.len() <= 128 {
        Ok(())
    } else {
        Err(ConfigError::InvalidVersion {
            given: version.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use uuid::Uuid;

    use super::*;

    fn temp_workspace() -> PathBuf {
        let dir = std::env::temp_dir()
            .join("ssm-test-options")
            .join(Uuid::new_v4().to_string());
        fs::create_dir_all(&dir).expect("create temp workspace");
        dir
    }

    #[test]
    fn test_version_flag_wins_over_pinned_file() {
        let workspace = temp_workspace();
        fs::write(workspace.join(PINNED_VERSION_FILE), "1.2.3\n").expect("write pin");

        let version = resolve_version(Some("2.0.0"), &workspace).expect("resolve");
        assert_eq!(version, "2.0.0");
        let _ = fs::remove_dir_all(&workspace);
    }

    #[test]
    fn test_pinned_file_wins_over_default() {
        let workspace = temp_workspace();
        fs::write(
            workspace.join(PINNED_VERSION_FILE),
            "# pinned for this repo\n1.2.3\n",
        )
        .expect("write pin");

        let version = resolve_version(None, &workspace).expect("resolve");
        assert_eq!(version, "1.2.3");
        let _ = fs::remove_dir_all(&workspace);
    }

    #[test]
    fn test_default_version_without_sources() {
        let workspace = temp_workspace();
        let version = resolve_version(None, &workspace).expect("resolve");
        assert_eq!(version, DEFAULT_VERSION);
        let _ = fs::remove_dir_all(&workspace);
    }

    #[test]
    fn test_invalid_version_rejected() {
        let workspace = temp_workspace();
        assert!(resolve_version(Some("v 1"), &workspace).is_err());
        assert!(resolve_version(Some("-leading"), &workspace).is_err());
        assert!(resolve_version(Some(""), &workspace).is_err());
        assert!(resolve_version(Some("1.2.3-rc.1"), &workspace).is_ok());
        let _ = fs::remove_dir_all(&workspace);
    }

    #[test]
    fn test_config_paths_layout() {
        let config = ConfigPaths::new("/etc/ssm-test");
        assert_eq!(
            config.allow_list(),
            PathBuf::from("/etc/ssm-test/allowed-domains.txt")
        );
        assert_eq!(
            config.containerfile(),
            PathBuf::from("/etc/ssm-test/image/Containerfile")
        );
        assert_eq!(
            config.credentials_file(),
            PathBuf::from("/etc/ssm-test/credentials.json")
        );
    }
}
