//! Launch orchestration.
//!
//! One invocation walks a fixed pipeline:
//!
//! ```text
//! ParsingArgs ──▶ ResolvingVersion ──▶ Planning ──▶ Registering ──▶ Starting
//! ```
//!
//! Registration happens only after every fallible planning step has
//! succeeded, so an interrupted launch never leaves a half-planned entry
//! behind. A start failure flips the session to `Failed` and unregisters
//! it; normal completion records `Stopped` and forwards the container's
//! exit code. `--list-sessions` bypasses the pipeline with a read-only
//! registry query.
//!
//! ```no_run
//! use sandbox_session_manager::launch::{self, ConfigPaths, LaunchOptions};
//! use sandbox_session_manager::runtime::CliRuntime;
//! use sandbox_session_manager::session::default_data_root;
//!
//! # fn main() -> sandbox_session_manager::Result<()> {
//! let options = LaunchOptions {
//!     agent_version: None,
//!     local: false,
//!     build: false,
//!     with_firewall: true,
//!     no_clipboard: false,
//!     vertex_ai: false,
//!     agent_args: vec![],
//!     workspace: launch::current_workspace()?,
//!     config: ConfigPaths::discover(),
//!     data_root: default_data_root(),
//! };
//! let runtime = CliRuntime::detect()?;
//! let code = launch::launch(&options, &runtime)?;
//! std::process::exit(code);
//! # }
//! ```

mod mounts;
mod options;

pub use mounts::{
    display_socket_candidates, plan_mounts, DisplaySocket, MountContext, MountFlags,
    CONTAINER_ALLOW_LIST, CONTAINER_CREDENTIALS, CONTAINER_LAUNCHER, CONTAINER_PROJECT_DATA,
    CONTAINER_SHARED_CONFIG, CONTAINER_WAYLAND_SOCKET, CONTAINER_WORKSPACE, X11_SOCKET_DIR,
};
pub use options::{
    current_workspace, image_reference, passthrough_env, resolve_version, vertex_enabled,
    ConfigPaths, LaunchOptions, AGENT_COMMAND, DEFAULT_IMAGE_REPO, DEFAULT_VERSION, LOCAL_IMAGE,
    PASSTHROUGH_ENV, PINNED_VERSION_FILE,
};

use std::env;
use std::fmt;

use tracing::{debug, info, instrument, warn};

use crate::error::{ConfigError, Result};
use crate::listfile;
use crate::runtime::{ContainerRuntime, ImageBuild, RunSpec};
use crate::session::{ProjectKey, ProjectPaths, Registry, Session, SessionStatus};

/// Capabilities handed back to firewall-mode containers on top of the
/// dropped-all baseline.
const FIREWALL_CAPS: [&str; 2] = ["NET_ADMIN", "NET_RAW"];

/// Environment variable carrying the session ID into the container.
const SESSION_ID_ENV: &str = "SSM_SESSION_ID";

/// Phases of one launch invocation, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPhase {
    /// Flag validation against the config root and the runtime.
    ParsingArgs,
    /// Version precedence and image-reference resolution.
    ResolvingVersion,
    /// Project identity, mount planning, session minting.
    Planning,
    /// Session registry insertion.
    Registering,
    /// Foreground container run.
    Starting,
}

impl fmt::Display for LaunchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ParsingArgs => "parsing-args",
            Self::ResolvingVersion => "resolving-version",
            Self::Planning => "planning",
            Self::Registering => "registering",
            Self::Starting => "starting",
        };
        f.write_str(name)
    }
}

/// Runs one session to completion and returns the container's exit code.
///
/// # Errors
///
/// Configuration problems, duplicate sessions, and mount failures surface
/// before anything is registered. A runtime start failure unregisters the
/// session before propagating.
#[instrument(skip(options, runtime), fields(workspace = %options.workspace.display()))]
pub fn launch(options: &LaunchOptions, runtime: &dyn ContainerRuntime) -> Result<i32> {
    debug!(phase = %LaunchPhase::ParsingArgs, "validating request");
    validate(options, runtime)?;

    debug!(phase = %LaunchPhase::ResolvingVersion, "resolving image");
    let version = options::resolve_version(options.agent_version.as_deref(), &options.workspace)?;
    let image = options::image_reference(options, &version);
    info!(version, image, "image resolved");

    if options.build {
        build_local_image(options, runtime)?;
    }

    debug!(phase = %LaunchPhase::Planning, "planning session");
    let project_key = ProjectKey::derive(&options.workspace);
    let paths = ProjectPaths::new(&options.data_root, &project_key);
    paths.create_directories()?;

    let launcher_exe = env::current_exe()?;
    let ctx = MountContext::discover(
        options.workspace.clone(),
        paths.data_dir.clone(),
        &options.config,
        launcher_exe,
    );
    let flags = MountFlags {
        no_clipboard: options.no_clipboard,
        with_firewall: options.with_firewall,
        vertex_ai: options.vertex_ai,
        local: options.local,
    };
    let planned = plan_mounts(&ctx, &flags)?;

    let session = Session::new(project_key, planned);
    info!(session = %session.id, container = %session.container_name, "session planned");

    debug!(phase = %LaunchPhase::Registering, "registering session");
    let registry = Registry::new(paths);
    registry.register(&session, runtime)?;

    debug!(phase = %LaunchPhase::Starting, "starting container");
    let spec = run_spec(options, &session, &image);
    let session_id = session.id;
    let mut on_started = || {
        if let Err(err) = registry.set_status(session_id, SessionStatus::Running) {
            warn!(error = %err, "could not record running status");
        }
    };

    match runtime.run(&spec, &mut on_started) {
        Ok(code) => {
            if let Err(err) = registry.set_status(session_id, SessionStatus::Stopped) {
                warn!(error = %err, "could not record stopped status");
            }
            info!(code, "session finished");
            Ok(code)
        }
        Err(start_err) => {
            if let Err(err) = registry.set_status(session_id, SessionStatus::Failed) {
                warn!(error = %err, "could not record failed status");
            }
            if let Err(err) = registry.unregister(session_id) {
                warn!(error = %err, "could not unregister failed session");
            }
            Err(start_err.into())
        }
    }
}

/// Lists the current project's sessions, rendered as an aligned table.
///
/// # Errors
///
/// Returns registry filesystem errors; an absent project is not an error.
pub fn list_sessions(options: &LaunchOptions, runtime: &dyn ContainerRuntime) -> Result<String> {
    let project_key = ProjectKey::derive(&options.workspace);
    let paths = ProjectPaths::new(&options.data_root, &project_key);
    if !paths.exists() {
        return Ok(format!("No sessions for project {}\n", project_key.as_str()));
    }

    let registry = Registry::new(paths);
    let sessions = registry.list(runtime)?;
    if sessions.is_empty() {
        return Ok(format!("No sessions for project {}\n", project_key.as_str()));
    }
    Ok(render_session_table(&sessions))
}

/// Renders sessions as a padded table of container, status, start time,
/// and session ID.
#[must_use]
pub fn render_session_table(sessions: &[Session]) -> String {
    const HEADERS: [&str; 4] = ["CONTAINER", "STATUS", "STARTED", "SESSION"];

    let rows: Vec<[String; 4]> = sessions
        .iter()
        .map(|s| {
            [
                s.container_name.clone(),
                s.status.to_string(),
                s.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                s.id.to_string(),
            ]
        })
        .collect();

    let mut widths = [0usize; 4];
    for (i, header) in HEADERS.iter().enumerate() {
        widths[i] = rows
            .iter()
            .map(|row| row[i].len())
            .chain([header.len()])
            .max()
            .unwrap_or(header.len());
    }

    let mut out = String::new();
    render_row(&mut out, &HEADERS.map(String::from), &widths);
    for row in &rows {
        render_row(&mut out, row, &widths);
    }
    out
}

fn render_row(out: &mut String, row: &[String; 4], widths: &[usize; 4]) {
    for (i, cell) in row.iter().enumerate() {
        if i > 0 {
            out.push_str("  ");
        }
        out.push_str(cell);
        if i < row.len() - 1 {
            for _ in cell.len()..widths[i] {
                out.push(' ');
            }
        }
    }
    out.push('\n');
}

/// Flag validation that needs the config root or the runtime.
fn validate(options: &LaunchOptions, runtime: &dyn ContainerRuntime) -> Result<()> {
    if options.local && !options.build && !runtime.image_exists(options::LOCAL_IMAGE)? {
        return Err(ConfigError::LocalImageMissing {
            image: options::LOCAL_IMAGE.to_string(),
        }
        .into());
    }

    if options.with_firewall {
        let allow_list = options.config.allow_list();
        if !allow_list.is_file() {
            return Err(ConfigError::AllowListMissing { path: allow_list }.into());
        }
    }

    if options.build {
        let containerfile = options.config.containerfile();
        if !containerfile.is_file() {
            return Err(ConfigError::BuildContextMissing {
                path: containerfile,
            }
            .into());
        }
    }

    Ok(())
}

/// Builds the local sandbox image, passing the optional package list as a
/// build argument.
fn build_local_image(options: &LaunchOptions, runtime: &dyn ContainerRuntime) -> Result<()> {
    let packages_file = options.config.packages_file();
    let packages = listfile::read_optional(&packages_file).map_err(|source| {
        ConfigError::ListFileRead {
            path: packages_file,
            source,
        }
    })?;

    let mut build_args = Vec::new();
    if !packages.is_empty() {
        build_args.push(("EXTRA_PACKAGES".to_string(), packages.join(" ")));
    }

    let build = ImageBuild {
        context_dir: options.config.build_context(),
        containerfile: options.config.containerfile(),
        tag: options::LOCAL_IMAGE.to_string(),
        build_args,
    };
    runtime.build_image(&build)?;
    Ok(())
}

/// Assembles the run specification for a planned session.
fn run_spec(options: &LaunchOptions, session: &Session, image: &str) -> RunSpec {
    let mut container_env = options::passthrough_env();
    container_env.push((SESSION_ID_ENV.to_string(), session.id.to_string()));

    let mut spec = RunSpec::new(image, session.container_name.as_str())
        .with_mounts(session.mounts.clone())
        .with_env(container_env)
        .with_workdir(CONTAINER_WORKSPACE)
        .with_command(container_command(options));
    if options.with_firewall {
        spec = spec.with_extra_caps(FIREWALL_CAPS.iter().map(|c| (*c).to_string()).collect());
    }
    spec
}

/// The command run as the container's first process: the agent argv,
/// prefixed by the `init-firewall` persona when firewall mode is on.
fn container_command(options: &LaunchOptions) -> Vec<String> {
    let mut agent = vec![AGENT_COMMAND.to_string()];
    agent.extend(options.agent_args.iter().cloned());

    if !options.with_firewall {
        return agent;
    }

    let mut command = vec![
        CONTAINER_LAUNCHER.to_string(),
        "init-firewall".to_string(),
        "--allow-list".to_string(),
        CONTAINER_ALLOW_LIST.to_string(),
        "--".to_string(),
    ];
    command.extend(agent);
    command
}
