//! Sandbox Session Manager - session-aware container sandbox launcher.
//!
//! `ssm` turns a launch request into a running, isolated, network-
//! constrained container session: it derives a project identity from the
//! working directory, plans the mount set, records the session in a
//! per-project registry that is safe against concurrent launcher
//! invocations, and drives a container runtime (docker or podman) through
//! the foreground run. In firewall mode the same binary rides into the
//! container as its first process and installs a default-deny egress
//! policy opened only toward a resolved domain allow-list.
//!
//! # Module layout
//!
//! - [`session`]: project identity, session records, the registry
//! - [`launch`]: flag gathering, mount planning, the launch pipeline
//! - [`runtime`]: the docker/podman CLI driver behind a trait seam
//! - [`firewall`]: allow-list resolution, rule compilation and
//!   in-container application
//! - [`error`]: the error taxonomy and its exit-code mapping
//!
//! # Example
//!
//! ```no_run
//! use sandbox_session_manager::firewall::{init_firewall, InitFirewallOptions};
//!
//! fn main() -> sandbox_session_manager::Result<()> {
//!     // Inside the container, as its first process, before the agent
//!     // sees the network.
//!     init_firewall(&InitFirewallOptions {
//!         allow_list: "/etc/ssm/allowed-domains.txt".into(),
//!         skip_probes: false,
//!         command: vec!["agent".to_string()],
//!     })
//! }
//! ```

pub mod error;
pub mod firewall;
pub mod launch;
mod listfile;
pub mod runtime;
pub mod session;

// Re-export commonly used types
pub use error::{Error, Result};
pub use session::{Registry, Session, SessionStatus};
