//! Applying compiled rule sequences and probing the result.

use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::allowlist::Cidr;
use super::rules::{self, RuleCommand, Tool};
use crate::error::FirewallError;

/// Timeout for one reachability probe connection.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolved locations of the packet-filter binaries.
pub struct FirewallTools {
    iptables: PathBuf,
    ipset: PathBuf,
}

impl FirewallTools {
    /// Finds iptables and ipset on PATH.
    ///
    /// # Errors
    ///
    /// Returns `FirewallError::ToolMissing`. Without both tools no safe
    /// baseline can be installed, so discovery failure is fatal.
    pub fn discover() -> Result<Self, FirewallError> {
        Ok(Self {
            iptables: find_tool("iptables")?,
            ipset: find_tool("ipset")?,
        })
    }

    fn path_for(&self, tool: Tool) -> &Path {
        match tool {
            Tool::Iptables => &self.iptables,
            Tool::Ipset => &self.ipset,
        }
    }
}

fn find_tool(name: &str) -> Result<PathBuf, FirewallError> {
    which::which(name).map_err(|_| FirewallError::ToolMissing {
        tool: name.to_string(),
    })
}

/// Applies a compiled sequence in order.
///
/// The first failing baseline command aborts with `FirewallError::Fatal`;
/// failures after the baseline are logged and skipped, since they can only
/// widen an already-standing deny-all policy.
#[instrument(skip(tools, commands), fields(commands = commands.len()))]
pub fn apply(tools: &FirewallTools, commands: &[RuleCommand]) -> Result<(), FirewallError> {
    for command in commands {
        match run_rule(tools, command) {
            Ok(()) => {}
            Err(detail) if command.step.is_fatal() => {
                return Err(FirewallError::Fatal {
                    step: command.step.to_string(),
                    detail,
                });
            }
            Err(detail) => {
                warn!(step = %command.step, command = %command.render(), detail, "rule skipped");
            }
        }
    }
    info!("firewall rules applied");
    Ok(())
}

/// Runs one rule command, describing any failure.
fn run_rule(tools: &FirewallTools, command: &RuleCommand) -> Result<(), String> {
    debug!(command = %command.render(), "applying");
    let output = Command::new(tools.path_for(command.tool))
        .args(&command.args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| format!("failed to invoke: {err}"))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!("{}: {}", output.status, stderr.trim()))
    }
}

/// Detects the host bridge network by widening the default gateway to its
/// /24. No default route, or no `ip` binary, simply means no bridge rules.
#[must_use]
pub fn detect_host_bridge() -> Option<Cidr> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let gateway = rules::parse_default_gateway(&text)?;
    let bridge = rules::bridge_network(gateway)?;
    debug!(bridge = %bridge, "host bridge detected");
    Some(bridge)
}

/// Attempts a TCP connection to `host:port` within [`PROBE_TIMEOUT`].
///
/// Resolution failure counts as unreachable. With the reject-rest rule
/// answering ICMP instead of dropping, blocked targets fail immediately
/// rather than waiting out the timeout.
#[must_use]
pub fn probe_tcp(host: &str, port: u16) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn test_probe_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        assert!(probe_tcp("127.0.0.1", port));
    }

    #[test]
    fn test_probe_fails_on_closed_port() {
        // Bind to grab a free port, then close it again.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("local addr").port()
        };
        assert!(!probe_tcp("127.0.0.1", port));
    }

    #[test]
    fn test_probe_fails_on_unresolvable_host() {
        assert!(!probe_tcp("definitely-not-a-real-host.invalid", 443));
    }
}
