//! Mount planning.
//!
//! [`plan_mounts`] is a pure function over a [`MountContext`] snapshot: it
//! checks which optional sources exist but never creates or modifies host
//! paths. The output order is fixed:
//!
//! 1. workspace (rw)
//! 2. project data directory (rw)
//! 3. shared agent config (ro, when present)
//! 4. credential file (ro, when present)
//! 5. display sockets (rw, when present and clipboard sharing is on)
//! 6. firewall support: launcher executable and allow-list (ro, firewall
//!    mode only)
//!
//! The `vertex_ai` and `local` flags are carried for completeness and never
//! alter the plan; they affect the environment and image choice upstream.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::MountError;
use crate::launch::options::ConfigPaths;
use crate::session::MountSpec;

/// Where the workspace lands inside the container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Where the project's persistent data lands inside the container.
pub const CONTAINER_PROJECT_DATA: &str = "/home/agent/.agent";

/// Where shared agent configuration lands inside the container.
pub const CONTAINER_SHARED_CONFIG: &str = "/home/agent/.agent-shared";

/// Where the credential file lands inside the container.
pub const CONTAINER_CREDENTIALS: &str = "/home/agent/.agent/credentials.json";

/// Where the launcher executable lands for the `init-firewall` persona.
pub const CONTAINER_LAUNCHER: &str = "/usr/local/bin/ssm";

/// Where the raw allow-list lands for the `init-firewall` persona.
pub const CONTAINER_ALLOW_LIST: &str = "/etc/ssm/allowed-domains.txt";

/// X11 socket directory, mounted at the same path on both sides.
pub const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// Container-side path for the host's Wayland socket.
pub const CONTAINER_WAYLAND_SOCKET: &str = "/run/wayland/wayland-0";

/// One display-socket candidate.
#[derive(Debug, Clone)]
pub struct DisplaySocket {
    /// Socket path on the host; skipped when absent.
    pub host: PathBuf,
    /// Where it lands inside the container.
    pub container: PathBuf,
}

/// Snapshot of every host path the planner may bind.
#[derive(Debug, Clone)]
pub struct MountContext {
    /// The project working directory.
    pub workspace: PathBuf,
    /// The project's persistent data directory.
    pub project_data: PathBuf,
    /// Shared agent configuration directory.
    pub shared_config: PathBuf,
    /// Credential file.
    pub credentials: PathBuf,
    /// Display-socket candidates.
    pub display_sockets: Vec<DisplaySocket>,
    /// The launcher's own executable.
    pub launcher_exe: PathBuf,
    /// The raw domain allow-list file.
    pub allow_list: PathBuf,
}

impl MountContext {
    /// Builds a context from the standard locations, with display-socket
    /// candidates taken from the host environment.
    #[must_use]
    pub fn discover(
        workspace: PathBuf,
        project_data: PathBuf,
        config: &ConfigPaths,
        launcher_exe: PathBuf,
    ) -> Self {
        Self {
            workspace,
            project_data,
            shared_config: config.shared_dir(),
            credentials: config.credentials_file(),
            display_sockets: display_socket_candidates(),
            launcher_exe,
            allow_list: config.allow_list(),
        }
    }
}

/// Flags the planner recognizes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountFlags {
    /// Drop display-socket mounts.
    pub no_clipboard: bool,
    /// Include the firewall support mounts.
    pub with_firewall: bool,
    /// Alternate-backend mode; no effect on mounts.
    pub vertex_ai: bool,
    /// Local image mode; no effect on mounts.
    pub local: bool,
}

/// Computes the ordered mount list for one session.
///
/// # Errors
///
/// Returns `MountError` if the workspace or project data directory is
/// missing or not absolute, or if firewall mode was requested without its
/// support files on disk.
pub fn plan_mounts(ctx: &MountContext, flags: &MountFlags) -> Result<Vec<MountSpec>, MountError> {
    require_dir(&ctx.workspace)?;
    require_dir(&ctx.project_data)?;

    let mut mounts = vec![
        MountSpec::read_write(&ctx.workspace, CONTAINER_WORKSPACE),
        MountSpec::read_write(&ctx.project_data, CONTAINER_PROJECT_DATA),
    ];

    if ctx.shared_config.is_dir() {
        mounts.push(MountSpec::read_only(&ctx.shared_config, CONTAINER_SHARED_CONFIG));
    }
    if ctx.credentials.is_file() {
        mounts.push(MountSpec::read_only(&ctx.credentials, CONTAINER_CREDENTIALS));
    }

    if !flags.no_clipboard {
        for socket in &ctx.display_sockets {
            if socket.host.exists() {
                mounts.push(MountSpec::read_write(&socket.host, &socket.container));
            }
        }
    }

    if flags.with_firewall {
        require_file(&ctx.launcher_exe)?;
        require_file(&ctx.allow_list)?;
        mounts.push(MountSpec::read_only(&ctx.launcher_exe, CONTAINER_LAUNCHER));
        mounts.push(MountSpec::read_only(&ctx.allow_list, CONTAINER_ALLOW_LIST));
    }

    Ok(mounts)
}

/// Display sockets the host might offer: the X11 socket directory, and the
/// Wayland socket named by `WAYLAND_DISPLAY` under `XDG_RUNTIME_DIR`.
#[must_use]
pub fn display_socket_candidates() -> Vec<DisplaySocket> {
    let mut sockets = vec![DisplaySocket {
        host: PathBuf::from(X11_SOCKET_DIR),
        container: PathBuf::from(X11_SOCKET_DIR),
    }];

    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        let display = env::var("WAYLAND_DISPLAY").unwrap_or_else(|_| "wayland-0".to_string());
        sockets.push(DisplaySocket {
            host: PathBuf::from(runtime_dir).join(display),
            container: PathBuf::from(CONTAINER_WAYLAND_SOCKET),
        });
    }

    sockets
}

fn require_dir(path: &Path) -> Result<(), MountError> {
    require_absolute(path)?;
    if path.is_dir() {
        Ok(())
    } else {
        Err(MountError::MissingSource {
            path: path.to_path_buf(),
        })
    }
}

fn require_file(path: &Path) -> Result<(), MountError> {
    require_absolute(path)?;
    if path.is_file() {
        Ok(())
    } else {
        Err(MountError::MissingSource {
            path: path.to_path_buf(),
        })
    }
}

fn require_absolute(path: &Path) -> Result<(), MountError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(MountError::InvalidPath {
            path: path.to_path_buf(),
            reason: "must be absolute".to_string(),
        })
    }
}
