//! Driving docker or podman over their command-line interfaces.

use std::env;
use std::io;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{build_run_args, validate_image_name, ContainerRuntime, ImageBuild, RunSpec};
use crate::error::RuntimeError;

/// Runtimes probed in order when `SSM_RUNTIME` is not set.
const DEFAULT_RUNTIMES: [&str; 2] = ["docker", "podman"];

/// How often the run loop checks whether the container has come up.
const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Client exit codes that mean the container never ran: 125 is a runtime
/// failure, 126 and 127 mean the command could not be invoked or found.
const START_FAILURE_CODES: [i32; 3] = [125, 126, 127];

/// A container engine reached through its CLI binary.
pub struct CliRuntime {
    binary: PathBuf,
    name: String,
}

impl CliRuntime {
    fn new(binary: PathBuf, name: String) -> Self {
        Self { binary, name }
    }

    /// Finds a usable container runtime.
    ///
    /// Honors `SSM_RUNTIME` as an override (a binary name or absolute
    /// path); otherwise probes docker then podman. A candidate counts only
    /// if its daemon answers an `info` query.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::NotFound` listing every candidate tried.
    pub fn detect() -> Result<Self, RuntimeError> {
        let candidates: Vec<String> = match env::var("SSM_RUNTIME") {
            Ok(val) if !val.is_empty() => vec![val],
            _ => DEFAULT_RUNTIMES.iter().map(|s| (*s).to_string()).collect(),
        };

        let mut tried = Vec::new();
        for candidate in &candidates {
            let binary = match which::which(candidate) {
                Ok(path) => path,
                Err(_) => {
                    debug!(candidate = %candidate, "runtime not on PATH");
                    tried.push(format!("{candidate}: not on PATH"));
                    continue;
                }
            };

            let name = binary
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(candidate)
                .to_string();
            let runtime = Self::new(binary, name);
            match runtime.check_daemon() {
                Ok(()) => {
                    info!(runtime = %runtime.name, binary = %runtime.binary.display(), "container runtime detected");
                    return Ok(runtime);
                }
                Err(err) => {
                    warn!(candidate = %candidate, error = %err, "runtime found but unusable");
                    tried.push(format!("{candidate}: {err}"));
                }
            }
        }

        Err(RuntimeError::NotFound {
            tried: tried.join("; "),
        })
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// Probes the daemon with an `info` query.
    fn check_daemon(&self) -> Result<(), RuntimeError> {
        let status = self
            .command()
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|err| RuntimeError::DaemonUnavailable {
                runtime: self.name.clone(),
                detail: format!("failed to invoke: {err}"),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::DaemonUnavailable {
                runtime: self.name.clone(),
                detail: "info query failed; daemon may be down".to_string(),
            })
        }
    }
}

impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        validate_image_name(image)?;
        let status = self
            .command()
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| RuntimeError::QueryFailed {
                context: format!("{} image inspect", self.name),
                source,
            })?;
        Ok(status.success())
    }

    #[instrument(skip(self, build), fields(runtime = %self.name, tag = %build.tag))]
    fn build_image(&self, build: &ImageBuild) -> Result<(), RuntimeError> {
        validate_image_name(&build.tag)?;
        info!(
            context = %build.context_dir.display(),
            containerfile = %build.containerfile.display(),
            "building sandbox image"
        );

        let mut cmd = self.command();
        cmd.arg("build")
            .arg("--tag")
            .arg(&build.tag)
            .arg("--file")
            .arg(&build.containerfile);
        for (key, val) in &build.build_args {
            cmd.arg("--build-arg").arg(format!("{key}={val}"));
        }
        cmd.arg(&build.context_dir);

        // Inherited stdio so build progress reaches the terminal.
        let status = cmd.status().map_err(|err| RuntimeError::BuildFailed {
            detail: format!("failed to invoke {}: {err}", self.name),
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::BuildFailed {
                detail: format!("{} build exited with {status}", self.name),
            })
        }
    }

    fn container_running(&self, container_name: &str) -> Result<bool, RuntimeError> {
        let output = self
            .command()
            .args([
                "ps",
                "--filter",
                &format!("name={container_name}"),
                "--format",
                "{{.Names}}",
            ])
            .output()
            .map_err(|source| RuntimeError::QueryFailed {
                context: format!("{} ps", self.name),
                source,
            })?;

        if !output.status.success() {
            return Err(RuntimeError::QueryFailed {
                context: format!("{} ps exited with {}", self.name, output.status),
                source: io::Error::new(io::ErrorKind::Other, "non-zero exit"),
            });
        }

        // The name filter matches substrings, so compare whole lines.
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(listing_contains(&stdout, container_name))
    }

    #[instrument(skip(self, spec, on_started), fields(runtime = %self.name, container = %spec.container_name))]
    fn run(&self, spec: &RunSpec, on_started: &mut dyn FnMut()) -> Result<i32, RuntimeError> {
        let args = build_run_args(spec)?;
        debug!(?args, "starting container");

        let mut child = self.command().args(&args).spawn().map_err(|err| {
            RuntimeError::StartFailed {
                container_name: spec.container_name.clone(),
                detail: format!("failed to invoke {}: {err}", self.name),
            }
        })?;

        // Poll until the runtime reports the container running. No upper
        // bound: a first run may spend minutes pulling the image.
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    // Exited before liveness was confirmed. Runtime-level
                    // codes mean it never ran; anything else is a container
                    // that ran and finished between polls.
                    let code = status_code(&status);
                    if is_start_failure(code) {
                        return Err(RuntimeError::StartFailed {
                            container_name: spec.container_name.clone(),
                            detail: format!("{} run exited with code {code}", self.name),
                        });
                    }
                    debug!(code, "container exited before liveness confirmation");
                    on_started();
                    return Ok(code);
                }
                Ok(None) => {}
                Err(source) => {
                    return Err(RuntimeError::QueryFailed {
                        context: format!("waiting for {} run", self.name),
                        source,
                    });
                }
            }

            match self.container_running(&spec.container_name) {
                Ok(true) => {
                    debug!("container is running");
                    on_started();
                    break;
                }
                Ok(false) => {}
                Err(err) => warn!(error = %err, "liveness poll failed; will retry"),
            }

            thread::sleep(LIVENESS_POLL_INTERVAL);
        }

        let status = child.wait().map_err(|source| RuntimeError::QueryFailed {
            context: format!("waiting for {} run", self.name),
            source,
        })?;
        let code = status_code(&status);
        debug!(code, "container exited");
        Ok(code)
    }
}

fn is_start_failure(code: i32) -> bool {
    START_FAILURE_CODES.contains(&code)
}

fn listing_contains(stdout: &str, container_name: &str) -> bool {
    stdout.lines().any(|line| line.trim() == container_name)
}

/// Exit code for a finished child, mapping signal death to `128 + signal`.
#[cfg(unix)]
fn status_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn status_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_failure_codes() {
        assert!(is_start_failure(125));
        assert!(is_start_failure(126));
        assert!(is_start_failure(127));
        assert!(!is_start_failure(0));
        assert!(!is_start_failure(1));
        assert!(!is_start_failure(3));
    }

    #[test]
    fn test_listing_requires_exact_name() {
        let listing = "ssm-widget-1a2b\nssm-widget-1a2b-extra\n";
        assert!(listing_contains(listing, "ssm-widget-1a2b"));
        assert!(listing_contains(listing, "ssm-widget-1a2b-extra"));
        assert!(!listing_contains(listing, "ssm-widget"));
        assert!(!listing_contains("", "ssm-widget-1a2b"));
    }

    #[cfg(unix)]
    #[test]
    fn test_status_code_mapping() {
        use std::os::unix::process::ExitStatusExt;

        // Raw wait status: exit code in the high byte, signal in the low.
        assert_eq!(status_code(&ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(status_code(&ExitStatus::from_raw(0)), 0);
        assert_eq!(status_code(&ExitStatus::from_raw(9)), 137);
    }
}
