//! Session records persisted in the per-project registry.
//!
//! A record captures everything a later launcher invocation needs to reason
//! about a session it did not start: the container name to check liveness
//! against, the mounts it was given, and its last known status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::session::project::ProjectKey;

/// Unique identifier for a session.
pub type SessionId = Uuid;

/// Prefix for all container names managed by this tool.
pub const CONTAINER_NAME_PREFIX: &str = "ssm";

/// Status of a session in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Registered, container not yet observed running.
    #[default]
    Starting,
    /// Container observed running.
    Running,
    /// Container exited normally.
    Stopped,
    /// Container never reached a running state.
    Failed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Access mode for a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountMode {
    /// Read-only.
    #[serde(rename = "ro")]
    ReadOnly,
    /// Read-write.
    #[serde(rename = "rw")]
    ReadWrite,
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "ro"),
            Self::ReadWrite => write!(f, "rw"),
        }
    }
}

/// One host-path to container-path binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Absolute path on the host.
    pub host: PathBuf,
    /// Absolute path inside the container.
    pub container: PathBuf,
    /// Access mode.
    pub mode: MountMode,
}

impl MountSpec {
    /// Creates a read-only mount.
    #[must_use]
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            mode: MountMode::ReadOnly,
        }
    }

    /// Creates a read-write mount.
    #[must_use]
    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            mode: MountMode::ReadWrite,
        }
    }

    /// Formats this mount as a runtime volume argument (`host:container:mode`).
    #[must_use]
    pub fn volume_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host.display(),
            self.container.display(),
            self.mode
        )
    }
}

/// A registered sandbox session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier, minted at launch.
    pub id: SessionId,

    /// The project this session belongs to.
    pub project_key: ProjectKey,

    /// Container name, derived as `ssm-{projectKey}-{sessionID}`.
    pub container_name: String,

    /// When the session was registered.
    pub started_at: DateTime<Utc>,

    /// Ordered mount bindings the container was given.
    pub mounts: Vec<MountSpec>,

    /// Last known status.
    pub status: SessionStatus,
}

impl Session {
    /// Creates a fresh session record in `Starting` state with a new ID and
    /// the deterministic container name for that ID.
    #[must_use]
    pub fn new(project_key: ProjectKey, mounts: Vec<MountSpec>) -> Self {
        let id = Uuid::new_v4();
        let container_name = container_name_for(&project_key, id);
        Self {
            id,
            project_key,
            container_name,
            started_at: Utc::now(),
            mounts,
            status: SessionStatus::Starting,
        }
    }

    /// True for statuses whose container may still be alive.
    #[must_use]
    pub fn may_be_live(&self) -> bool {
        matches!(self.status, SessionStatus::Starting | SessionStatus::Running)
    }
}

/// Derives the container name for a project/session pair.
#[must_use]
pub fn container_name_for(key: &ProjectKey, id: SessionId) -> String {
    format!("{}-{}-{}", CONTAINER_NAME_PREFIX, key, id)
}
