//! Error types for the sandbox session manager.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//! Every fatal error maps onto one of the documented process exit codes via
//! [`Error::exit_code`].

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Process exit codes.
pub mod exit_codes {
    /// Clean launch and clean agent exit.
    pub const SUCCESS: i32 = 0;
    /// Configuration or validation failure, nothing was started.
    pub const CONFIG: i32 = 1;
    /// The container runtime failed to start the session.
    pub const RUNTIME_START: i32 = 2;
    /// Firewall initialization failed before a safe policy was in place.
    pub const FIREWALL: i32 = 3;
}

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Bad flags, missing config inputs, or an unusable working directory
    #[error("Configuration error")]
    #[diagnostic(code(ssm::config))]
    Config(#[from] ConfigError),

    /// Session registry failure
    #[error("Session registry error")]
    #[diagnostic(code(ssm::registry))]
    Registry(#[from] RegistryError),

    /// Mount planning failure
    #[error("Mount planning failed")]
    #[diagnostic(code(ssm::mounts))]
    Mount(#[from] MountError),

    /// Container runtime failure
    #[error("Container runtime error")]
    #[diagnostic(code(ssm::runtime))]
    Runtime(#[from] RuntimeError),

    /// Firewall initialization failure
    #[error("Firewall initialization failed")]
    #[diagnostic(code(ssm::firewall))]
    Firewall(#[from] FirewallError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(ssm::io))]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps this error onto the process exit code contract:
    /// configuration and registry problems exit 1, runtime-start failures
    /// exit 2, fatal firewall failures exit 3.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Registry(_) | Self::Mount(_) | Self::Io(_) => {
                exit_codes::CONFIG
            }
            Self::Runtime(_) => exit_codes::RUNTIME_START,
            Self::Firewall(_) => exit_codes::FIREWALL,
        }
    }
}

/// Errors in flags, config files, or the launch environment.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// `--local` requested but no locally built image exists
    #[error("Local image {image} not found")]
    #[diagnostic(
        code(ssm::config::local_image),
        help("Build it first with --build, or drop --local to pull from the registry")
    )]
    LocalImageMissing { image: String },

    /// Firewall mode needs the allow-list file
    #[error("Domain allow-list not found: {path}")]
    #[diagnostic(
        code(ssm::config::allow_list),
        help("Create the file with one domain or CIDR per line; an empty file means DNS-only egress")
    )]
    AllowListMissing { path: PathBuf },

    /// `--build` needs a build context
    #[error("Image build context not found: {path}")]
    #[diagnostic(
        code(ssm::config::build_context),
        help("Place a Containerfile under the config root's image/ directory")
    )]
    BuildContextMissing { path: PathBuf },

    /// Version tags are restricted to a safe charset
    #[error("Invalid version tag: {given:?}")]
    #[diagnostic(
        code(ssm::config::version),
        help("Version tags may contain only letters, digits, '.', '_' and '-'")
    )]
    InvalidVersion { given: String },

    /// The working directory could not be resolved to an absolute path
    #[error("Cannot resolve working directory")]
    #[diagnostic(code(ssm::config::workdir))]
    WorkingDirectory {
        #[source]
        source: std::io::Error,
    },

    /// A newline-delimited config file could not be read
    #[error("Failed to read {path}")]
    #[diagnostic(code(ssm::config::read))]
    ListFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the per-project session registry.
#[derive(Error, Debug, Diagnostic)]
pub enum RegistryError {
    /// The container name is already registered and its container is live
    #[error("Session container {container_name} is already running")]
    #[diagnostic(
        code(ssm::registry::duplicate),
        help("Inspect active sessions with --list-sessions")
    )]
    DuplicateSession { container_name: String },

    /// The advisory lock could not be taken
    #[error("Failed to lock registry: {path}")]
    #[diagnostic(code(ssm::registry::lock))]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem failure while reading or writing registry state
    #[error("Registry I/O error: {context}")]
    #[diagnostic(code(ssm::registry::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from mount planning.
#[derive(Error, Debug, Diagnostic)]
pub enum MountError {
    /// A required mount source is absent
    #[error("Required mount source does not exist: {path}")]
    #[diagnostic(code(ssm::mounts::missing_source))]
    MissingSource { path: PathBuf },

    /// A mount path failed validation
    #[error("Invalid mount path {path}: {reason}")]
    #[diagnostic(code(ssm::mounts::invalid_path))]
    InvalidPath { path: PathBuf, reason: String },
}

/// Errors from the container runtime driver.
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    /// Neither docker nor podman was found on PATH
    #[error("No container runtime found (tried {tried})")]
    #[diagnostic(
        code(ssm::runtime::not_found),
        help("Install docker or podman, or point SSM_RUNTIME at one")
    )]
    NotFound { tried: String },

    /// The runtime binary exists but its daemon is not answering
    #[error("Container runtime {runtime} is not available: {detail}")]
    #[diagnostic(
        code(ssm::runtime::unavailable),
        help("Is the daemon running and accessible for your user?")
    )]
    DaemonUnavailable { runtime: String, detail: String },

    /// A run specification failed validation before any process was spawned
    #[error("Invalid run specification: {reason}")]
    #[diagnostic(code(ssm::runtime::spec))]
    InvalidSpec { reason: String },

    /// `--build` failed
    #[error("Image build failed: {detail}")]
    #[diagnostic(code(ssm::runtime::build))]
    BuildFailed { detail: String },

    /// The container never reached a running state
    #[error("Container {container_name} failed to start: {detail}")]
    #[diagnostic(code(ssm::runtime::start))]
    StartFailed {
        container_name: String,
        detail: String,
    },

    /// A runtime query (ps/inspect) could not be executed
    #[error("Runtime query failed: {context}")]
    #[diagnostic(code(ssm::runtime::query))]
    QueryFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Handing control to the agent process failed
    #[error("Failed to exec agent command {command:?}")]
    #[diagnostic(code(ssm::runtime::agent_exec))]
    AgentExec {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from firewall initialization.
///
/// Only the baseline steps (flush, allow-set creation, default-deny) raise
/// these; later steps degrade to logged warnings.
#[derive(Error, Debug, Diagnostic)]
pub enum FirewallError {
    /// A packet-filter tool is missing inside the container
    #[error("Required firewall tool not found: {tool}")]
    #[diagnostic(
        code(ssm::firewall::tool),
        help("The sandbox image must ship iptables and ipset for firewall mode")
    )]
    ToolMissing { tool: String },

    /// A baseline rule command failed; the policy state is undefined
    #[error("Firewall setup failed at step '{step}': {detail}")]
    #[diagnostic(
        code(ssm::firewall::fatal),
        help("Refusing to run the agent with an undefined network policy")
    )]
    Fatal { step: String, detail: String },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
