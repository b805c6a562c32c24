//! Domain allow-list resolution.
//!
//! Turns raw allow-list entries (domain names and literal CIDRs) into a
//! deduplicated set of IPv4 ranges. Resolution is single-shot: an
//! unresolvable domain or an unreachable provider endpoint costs a warning
//! and its own entries, never the batch. Ranges are recomputed on every
//! firewall initialization and never cached across runs.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Trusted provider endpoints whose published CIDR ranges join the set.
pub const DEFAULT_PROVIDER_ENDPOINTS: [&str; 1] = ["https://api.github.com/meta"];

/// Timeout for one provider metadata fetch.
const PROVIDER_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// A validated IPv4 network in CIDR form, host bits masked off at parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

/// Failure to parse a CIDR or address literal.
#[derive(Debug, Error)]
#[error("invalid CIDR: {0:?}")]
pub struct CidrParseError(String);

impl Cidr {
    /// Creates a network from an address and prefix length, masking host
    /// bits off the address.
    ///
    /// # Errors
    ///
    /// Returns `CidrParseError` for prefixes over 32.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, CidrParseError> {
        if prefix > 32 {
            return Err(CidrParseError(format!("{addr}/{prefix}")));
        }
        let mask: u32 = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        };
        Ok(Self {
            addr: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    /// A single-address `/32` network.
    #[must_use]
    pub fn host(addr: Ipv4Addr) -> Self {
        Self { addr, prefix: 32 }
    }

    /// The network address.
    #[must_use]
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// The prefix length.
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl FromStr for Cidr {
    type Err = CidrParseError;

    /// Parses `a.b.c.d/p`; a bare address is read as its `/32`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: Ipv4Addr = addr.parse().map_err(|_| CidrParseError(s.to_string()))?;
                let prefix: u8 = prefix.parse().map_err(|_| CidrParseError(s.to_string()))?;
                Self::new(addr, prefix)
            }
            None => {
                let addr: Ipv4Addr = s.parse().map_err(|_| CidrParseError(s.to_string()))?;
                Ok(Self::host(addr))
            }
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Resolves allow-list entries into network ranges.
#[derive(Debug, Clone)]
pub struct AllowListResolver {
    providers: Vec<String>,
}

impl Default for AllowListResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl AllowListResolver {
    /// Resolver with the default trusted-provider endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: DEFAULT_PROVIDER_ENDPOINTS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Replaces the provider endpoint list. Empty disables provider fetch.
    #[must_use]
    pub fn with_providers(mut self, providers: Vec<String>) -> Self {
        self.providers = providers;
        self
    }

    /// Resolves entries into a deduplicated CIDR set.
    ///
    /// Literal CIDRs and addresses pass straight through; everything else
    /// is treated as a domain name and resolved to `/32`s through the
    /// system resolver. Provider ranges are fetched afterwards. Every
    /// failure is per-entry: logged, skipped, and the batch continues.
    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    pub fn resolve(&self, entries: &[String]) -> BTreeSet<Cidr> {
        let mut ranges = BTreeSet::new();

        for entry in entries {
            if let Ok(cidr) = entry.parse::<Cidr>() {
                ranges.insert(cidr);
                continue;
            }
            match resolve_domain(entry) {
                Ok(addrs) if !addrs.is_empty() => {
                    debug!(domain = %entry, count = addrs.len(), "domain resolved");
                    ranges.extend(addrs.into_iter().map(Cidr::host));
                }
                Ok(_) => warn!(domain = %entry, "no IPv4 addresses; entry skipped"),
                Err(err) => warn!(domain = %entry, error = %err, "resolution failed; entry skipped"),
            }
        }

        for provider in &self.providers {
            match fetch_provider_ranges(provider) {
                Ok(found) => {
                    debug!(provider = %provider, count = found.len(), "provider ranges fetched");
                    ranges.extend(found);
                }
                Err(err) => {
                    warn!(provider = %provider, error = %err, "provider fetch failed; skipped");
                }
            }
        }

        info!(ranges = ranges.len(), "allow-set resolved");
        ranges
    }
}

/// Resolves one domain to its IPv4 addresses via the system resolver.
fn resolve_domain(domain: &str) -> std::io::Result<Vec<Ipv4Addr>> {
    let addrs = (domain, 0u16).to_socket_addrs()?;
    Ok(addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect())
}

/// Fetches one provider metadata document and harvests every IPv4 CIDR
/// found among its string values, wherever they sit in the document.
fn fetch_provider_ranges(endpoint: &str) -> Result<BTreeSet<Cidr>, ureq::Error> {
    let agent = ureq::AgentBuilder::new()
        .timeout(PROVIDER_FETCH_TIMEOUT)
        .build();
    let document: Value = agent.get(endpoint).call()?.into_json()?;

    let mut ranges = BTreeSet::new();
    collect_cidr_strings(&document, &mut ranges);
    Ok(ranges)
}

fn collect_cidr_strings(value: &Value, out: &mut BTreeSet<Cidr>) {
    match value {
        Value::String(text) => {
            if let Ok(cidr) = text.parse::<Cidr>() {
                out.insert(cidr);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_cidr_strings(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_cidr_strings(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_cidr_parse_and_display() {
        let cidr: Cidr = "140.82.112.0/20".parse().expect("parse");
        assert_eq!(cidr.prefix(), 20);
        assert_eq!(cidr.to_string(), "140.82.112.0/20");

        let host: Cidr = "1.2.3.4".parse().expect("bare address");
        assert_eq!(host.to_string(), "1.2.3.4/32");
    }

    #[test]
    fn test_cidr_masks_host_bits() {
        let cidr: Cidr = "10.0.5.77/24".parse().expect("parse");
        assert_eq!(cidr.addr(), Ipv4Addr::new(10, 0, 5, 0));

        let wide: Cidr = "192.168.1.1/0".parse().expect("parse");
        assert_eq!(wide.addr(), Ipv4Addr::new(0, 0, 0, 0));
    }

    #[test]
    fn test_cidr_rejects_garbage() {
        assert!("300.1.2.3/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("github.com".parse::<Cidr>().is_err());
        assert!("".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_literal_entries_pass_through() {
        let resolver = AllowListResolver::new().with_providers(vec![]);
        let entries = vec![
            "10.0.0.0/8".to_string(),
            "10.0.0.0/8".to_string(),
            "1.2.3.4".to_string(),
        ];
        let ranges = resolver.resolve(&entries);

        assert_eq!(ranges.len(), 2);
        assert!(ranges.contains(&"10.0.0.0/8".parse().expect("cidr")));
        assert!(ranges.contains(&Cidr::host(Ipv4Addr::new(1, 2, 3, 4))));
    }

    #[test]
    fn test_unresolvable_domain_skipped() {
        let resolver = AllowListResolver::new().with_providers(vec![]);
        let entries = vec![
            "definitely-not-a-real-host.invalid".to_string(),
            "172.16.0.0/12".to_string(),
        ];
        let ranges = resolver.resolve(&entries);

        assert_eq!(ranges.len(), 1);
        assert!(ranges.contains(&"172.16.0.0/12".parse().expect("cidr")));
    }

    #[test]
    fn test_localhost_resolves_to_loopback() {
        let resolver = AllowListResolver::new().with_providers(vec![]);
        let ranges = resolver.resolve(&["localhost".to_string()]);
        assert!(ranges.contains(&Cidr::host(Ipv4Addr::new(127, 0, 0, 1))));
    }

    #[test]
    fn test_unreachable_provider_degrades_to_empty() {
        // Port 9 (discard) on loopback refuses immediately.
        let resolver =
            AllowListResolver::new().with_providers(vec!["http://127.0.0.1:9/meta".to_string()]);
        let ranges = resolver.resolve(&[]);
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_cidr_harvest_walks_whole_document() {
        let document = json!({
            "hooks": ["192.30.252.0/22", "2a0a:a440::/29"],
            "nested": { "api": ["140.82.112.0/20"] },
            "verifiable_password_authentication": false,
            "note": "not an address"
        });

        let mut ranges = BTreeSet::new();
        collect_cidr_strings(&document, &mut ranges);

        assert_eq!(ranges.len(), 2);
        assert!(ranges.contains(&"192.30.252.0/22".parse().expect("cidr")));
        assert!(ranges.contains(&"140.82.112.0/20".parse().expect("cidr")));
    }
}
