//! Packet-filter rule compilation.
//!
//! [`compile`] is the pure half of firewall setup: allow-set in, the exact
//! ordered command sequence out. Running the commands, and the split
//! between fatal baseline steps and best-effort additions, lives in the
//! apply half.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use super::allowlist::Cidr;

/// Name of the ipset holding the allow-set.
pub const ALLOW_SET_NAME: &str = "ssm-allowed";

/// Tables flushed before the baseline is installed.
const FLUSHED_TABLES: [&str; 3] = ["filter", "nat", "mangle"];

/// Chains forced to a deny default.
const DENIED_CHAINS: [&str; 3] = ["INPUT", "FORWARD", "OUTPUT"];

/// The step a compiled command belongs to, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStep {
    /// Flush filter, nat and mangle tables.
    Flush,
    /// Create (or re-create) and empty the allow-set.
    CreateSet,
    /// Default-deny policies on INPUT, FORWARD and OUTPUT.
    DefaultDeny,
    /// Loopback traffic, both directions.
    Loopback,
    /// Established and related conntrack state, both directions.
    Established,
    /// DNS egress over UDP and TCP port 53.
    Dns,
    /// The host bridge network, when detected.
    HostBridge,
    /// Allow-set population and its egress accept.
    AllowSet,
    /// Reject whatever remains, with an ICMP answer rather than a silent
    /// drop so blocked connections fail fast and visibly.
    RejectRest,
}

impl RuleStep {
    /// Whether a failure in this step leaves the policy state undefined.
    ///
    /// The baseline (flush, set creation, default-deny) must succeed;
    /// everything after it only ever adds exceptions to an already safe
    /// deny-all state.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Flush | Self::CreateSet | Self::DefaultDeny)
    }
}

impl fmt::Display for RuleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Flush => "flush",
            Self::CreateSet => "create-set",
            Self::DefaultDeny => "default-deny",
            Self::Loopback => "loopback",
            Self::Established => "established",
            Self::Dns => "dns",
            Self::HostBridge => "host-bridge",
            Self::AllowSet => "allow-set",
            Self::RejectRest => "reject-rest",
        };
        f.write_str(name)
    }
}

/// Which binary a compiled command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Iptables,
    Ipset,
}

/// One compiled packet-filter command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleCommand {
    /// The step this command belongs to.
    pub step: RuleStep,
    /// The binary to run.
    pub tool: Tool,
    /// Its arguments.
    pub args: Vec<String>,
}

impl RuleCommand {
    fn iptables<I, S>(step: RuleStep, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            step,
            tool: Tool::Iptables,
            args: args.into_iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    fn ipset<I, S>(step: RuleStep, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            step,
            tool: Tool::Ipset,
            args: args.into_iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    /// The command as one loggable line.
    #[must_use]
    pub fn render(&self) -> String {
        let tool = match self.tool {
            Tool::Iptables => "iptables",
            Tool::Ipset => "ipset",
        };
        format!("{tool} {}", self.args.join(" "))
    }
}

/// Compiles the full rule sequence for an allow-set and an optional host
/// bridge hint.
///
/// The order is fixed: flush, allow-set creation, default-deny, loopback,
/// established/related, DNS, host bridge (when hinted), allow-set
/// population and accept, reject-rest. Identical inputs compile to the
/// identical sequence, and the leading flush makes re-application converge
/// instead of accumulating duplicates.
#[must_use]
pub fn compile(allow: &BTreeSet<Cidr>, host_bridge: Option<Cidr>) -> Vec<RuleCommand> {
    let mut commands = Vec::new();

    for table in FLUSHED_TABLES {
        commands.push(RuleCommand::iptables(RuleStep::Flush, ["-t", table, "-F"]));
        commands.push(RuleCommand::iptables(RuleStep::Flush, ["-t", table, "-X"]));
    }

    commands.push(RuleCommand::ipset(
        RuleStep::CreateSet,
        ["create", ALLOW_SET_NAME, "hash:net", "-exist"],
    ));
    commands.push(RuleCommand::ipset(RuleStep::CreateSet, ["flush", ALLOW_SET_NAME]));

    for chain in DENIED_CHAINS {
        commands.push(RuleCommand::iptables(RuleStep::DefaultDeny, ["-P", chain, "DROP"]));
    }

    commands.push(RuleCommand::iptables(
        RuleStep::Loopback,
        ["-A", "INPUT", "-i", "lo", "-j", "ACCEPT"],
    ));
    commands.push(RuleCommand::iptables(
        RuleStep::Loopback,
        ["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"],
    ));

    commands.push(RuleCommand::iptables(
        RuleStep::Established,
        ["-A", "INPUT", "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
    ));
    commands.push(RuleCommand::iptables(
        RuleStep::Established,
        ["-A", "OUTPUT", "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
    ));

    commands.push(RuleCommand::iptables(
        RuleStep::Dns,
        ["-A", "OUTPUT", "-p", "udp", "--dport", "53", "-j", "ACCEPT"],
    ));
    commands.push(RuleCommand::iptables(
        RuleStep::Dns,
        ["-A", "OUTPUT", "-p", "tcp", "--dport", "53", "-j", "ACCEPT"],
    ));

    if let Some(bridge) = host_bridge {
        let range = bridge.to_string();
        commands.push(RuleCommand::iptables(
            RuleStep::HostBridge,
            ["-A", "INPUT", "-s", range.as_str(), "-j", "ACCEPT"],
        ));
        commands.push(RuleCommand::iptables(
            RuleStep::HostBridge,
            ["-A", "OUTPUT", "-d", range.as_str(), "-j", "ACCEPT"],
        ));
    }

    for cidr in allow {
        let range = cidr.to_string();
        commands.push(RuleCommand::ipset(
            RuleStep::AllowSet,
            ["add", ALLOW_SET_NAME, range.as_str(), "-exist"],
        ));
    }
    commands.push(RuleCommand::iptables(
        RuleStep::AllowSet,
        ["-A", "OUTPUT", "-m", "set", "--match-set", ALLOW_SET_NAME, "dst", "-j", "ACCEPT"],
    ));

    commands.push(RuleCommand::iptables(
        RuleStep::RejectRest,
        ["-A", "OUTPUT", "-j", "REJECT", "--reject-with", "icmp-port-unreachable"],
    ));

    commands
}

/// Extracts the default-gateway address from `ip route show default`
/// output.
#[must_use]
pub fn parse_default_gateway(route_output: &str) -> Option<Ipv4Addr> {
    for line in route_output.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("default") || tokens.next() != Some("via") {
            continue;
        }
        if let Some(addr) = tokens.next().and_then(|t| t.parse().ok()) {
            return Some(addr);
        }
    }
    None
}

/// Widens a gateway address to its surrounding /24.
#[must_use]
pub fn bridge_network(gateway: Ipv4Addr) -> Option<Cidr> {
    Cidr::new(gateway, 24).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_steps() {
        assert!(RuleStep::Flush.is_fatal());
        assert!(RuleStep::CreateSet.is_fatal());
        assert!(RuleStep::DefaultDeny.is_fatal());
        assert!(!RuleStep::Loopback.is_fatal());
        assert!(!RuleStep::AllowSet.is_fatal());
        assert!(!RuleStep::RejectRest.is_fatal());
    }

    #[test]
    fn test_compile_starts_with_flush_ends_with_reject() {
        let commands = compile(&BTreeSet::new(), None);
        assert_eq!(commands[0].step, RuleStep::Flush);
        assert_eq!(commands[0].render(), "iptables -t filter -F");
        let last = commands.last().expect("non-empty sequence");
        assert_eq!(last.step, RuleStep::RejectRest);
        assert!(last.render().contains("icmp-port-unreachable"));
    }

    #[test]
    fn test_parse_default_gateway() {
        let output = "default via 172.17.0.1 dev eth0\n172.17.0.0/16 dev eth0 scope link\n";
        assert_eq!(
            parse_default_gateway(output),
            Some(Ipv4Addr::new(172, 17, 0, 1))
        );

        assert_eq!(parse_default_gateway(""), None);
        assert_eq!(parse_default_gateway("172.17.0.0/16 dev eth0\n"), None);
        assert_eq!(parse_default_gateway("default dev tun0 scope link\n"), None);
    }

    #[test]
    fn test_bridge_network_masks_gateway() {
        let bridge = bridge_network(Ipv4Addr::new(172, 17, 0, 1)).expect("bridge");
        assert_eq!(bridge.to_string(), "172.17.0.0/24");
    }
}
