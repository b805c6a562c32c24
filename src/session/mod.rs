//! Session tracking for concurrently active sandbox containers.
//!
//! Every launcher invocation is its own short-lived process; what ties them
//! together is per-project state on disk. A project (working directory
//! identity) owns a data directory shared by all of its sessions and a
//! registry file listing the sessions themselves. Containers are unique per
//! session; project data is deliberately shared.
//!
//! # Storage Layout
//!
//! ```text
//! {data_root}/projects/{project-key}/
//! ├── data/            # project state (history, todos), one per project
//! ├── sessions.json    # session registry, one record per session
//! └── sessions.lock    # advisory lock guarding registry mutations
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use sandbox_session_manager::session::{
//!     default_data_root, ProjectKey, ProjectPaths, Registry, Session,
//! };
//!
//! let key = ProjectKey::derive(Path::new("/home/dev/widget"));
//! let paths = ProjectPaths::new(&default_data_root(), &key);
//! paths.create_directories().unwrap();
//!
//! let registry = Registry::new(paths);
//! let session = Session::new(key, Vec::new());
//! // registry.register(&session, &runtime) with a ContainerRuntime in hand
//! ```

mod project;
mod record;
mod registry;

pub use project::{default_data_root, ProjectKey, ProjectPaths};
pub use record::{
    container_name_for, MountMode, MountSpec, Session, SessionId, SessionStatus,
    CONTAINER_NAME_PREFIX,
};
pub use registry::Registry;
