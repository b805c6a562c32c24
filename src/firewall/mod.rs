//! In-container egress firewall.
//!
//! The `init-firewall` persona runs as the container's first process, with
//! `NET_ADMIN` and `NET_RAW`, before the agent sees the network:
//!
//! ```text
//! allow-list file ──▶ resolver ──▶ allow-set (CIDRs)
//!                                      │
//!                    host-bridge hint ─┤
//!                                      ▼
//!                                  compile ──▶ apply ──▶ probes ──▶ exec agent
//! ```
//!
//! Resolution happens entirely before the first rule is applied, so the
//! window between installing default-deny and its loopback and
//! established-state exceptions is a handful of process spawns with no
//! network waits in between.

mod allowlist;
mod apply;
mod rules;

pub use allowlist::{AllowListResolver, Cidr, CidrParseError, DEFAULT_PROVIDER_ENDPOINTS};
pub use apply::{detect_host_bridge, probe_tcp, FirewallTools, PROBE_TIMEOUT};
pub use rules::{
    bridge_network, compile, parse_default_gateway, RuleCommand, RuleStep, Tool, ALLOW_SET_NAME,
};

use std::path::PathBuf;

use tracing::{info, instrument, warn};

use crate::error::{ConfigError, Result, RuntimeError};
use crate::listfile;

/// Host probed after setup that must not be reachable.
const PROBE_DISALLOWED_HOST: &str = "example.com";

/// Port used by the reachability probes.
const PROBE_PORT: u16 = 443;

/// Arguments of the `init-firewall` persona.
#[derive(Debug, Clone)]
pub struct InitFirewallOptions {
    /// Path of the mounted allow-list file.
    pub allow_list: PathBuf,
    /// Skip the post-setup reachability probes.
    pub skip_probes: bool,
    /// Command to exec once the firewall stands; empty means set up the
    /// rules and return.
    pub command: Vec<String>,
}

/// Sets up the egress firewall, then replaces this process with the agent
/// command.
///
/// # Errors
///
/// A missing allow-list is a configuration error; missing tools or a
/// failing baseline rule are fatal firewall errors. Per-entry resolution
/// failures and post-baseline rule failures only log.
#[instrument(skip(options), fields(allow_list = %options.allow_list.display()))]
pub fn init_firewall(options: &InitFirewallOptions) -> Result<()> {
    let entries = match listfile::read(&options.allow_list) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::AllowListMissing {
                path: options.allow_list.clone(),
            }
            .into());
        }
        Err(source) => {
            return Err(ConfigError::ListFileRead {
                path: options.allow_list.clone(),
                source,
            }
            .into());
        }
    };
    info!(entries = entries.len(), "allow-list loaded");

    let allow = AllowListResolver::new().resolve(&entries);
    let tools = FirewallTools::discover()?;
    let bridge = detect_host_bridge();
    let commands = compile(&allow, bridge);
    apply::apply(&tools, &commands)?;

    if options.skip_probes {
        info!("reachability probes skipped");
    } else {
        run_probes(&entries);
    }

    if options.command.is_empty() {
        info!("no command given; firewall configured");
        return Ok(());
    }
    exec_agent(&options.command)
}

/// Post-setup diagnostics: a known-disallowed host must be unreachable and
/// the first allow-listed domain should answer. Outcomes are logged, never
/// fatal.
fn run_probes(entries: &[String]) {
    if probe_tcp(PROBE_DISALLOWED_HOST, PROBE_PORT) {
        warn!(
            host = PROBE_DISALLOWED_HOST,
            "disallowed host is reachable; egress filtering looks ineffective"
        );
    } else {
        info!(host = PROBE_DISALLOWED_HOST, "disallowed host blocked");
    }

    let Some(allowed) = entries.iter().find(|e| e.parse::<Cidr>().is_err()) else {
        info!("no domain entries to probe");
        return;
    };
    if probe_tcp(allowed, PROBE_PORT) {
        info!(host = %allowed, "allowed host reachable");
    } else {
        warn!(host = %allowed, "allowed host not reachable; the allow-set may be incomplete");
    }
}

/// Replaces this process with the agent command.
#[cfg(unix)]
fn exec_agent(command: &[String]) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let Some((program, args)) = command.split_first() else {
        return Ok(());
    };
    info!(command = %command.join(" "), "handing off to agent");

    // exec only returns on failure.
    let err = std::process::Command::new(program).args(args).exec();
    Err(RuntimeError::AgentExec {
        command: command.join(" "),
        source: err,
    }
    .into())
}

#[cfg(not(unix))]
fn exec_agent(command: &[String]) -> Result<()> {
    Err(RuntimeError::AgentExec {
        command: command.join(" "),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "exec handoff requires a unix host",
        ),
    }
    .into())
}
