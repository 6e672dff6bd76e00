use std::collections::BTreeMap;
use std::net::IpAddr;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;

use crate::models::ParseError;

/// Largest address count one target token may expand to. A /16 is the most
/// anyone reasonably sweeps in a single run of this tool.
const MAX_EXPANSION: usize = 65_536;

lazy_static! {
    static ref LAST_OCTET_RANGE: Regex =
        Regex::new(r"^(\d{1,3}\.\d{1,3}\.\d{1,3})\.(\d{1,3})-(\d{1,3})$").unwrap();
}

/// One concrete scan target: the address to probe plus the name it came
/// from, when the caller gave a name rather than an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub ip: IpAddr,
    pub hostname: Option<String>,
}

/// Outcome of target expression expansion. Unresolvable tokens are reported
/// alongside the usable targets so a multi-target run can proceed partially.
#[derive(Debug, Default)]
pub struct ExpandedTargets {
    pub targets: Vec<ResolvedTarget>,
    pub failures: Vec<String>,
}

/// DNS client shared by target resolution and host enrichment. Falls back to
/// public defaults when the system resolver configuration is unreadable.
pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn new() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!("[DNS] System resolver config unavailable ({}), using defaults", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        DnsResolver { inner }
    }

    /// Forward-resolve a hostname, preferring IPv4 because every scan
    /// technique here probes IPv4.
    pub async fn resolve_host(&self, name: &str) -> Result<IpAddr, ParseError> {
        let lookup = self
            .inner
            .lookup_ip(name)
            .await
            .map_err(|e| ParseError::Unresolvable(format!("{}: {}", name, e)))?;
        lookup
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| lookup.iter().next())
            .ok_or_else(|| ParseError::Unresolvable(format!("{}: no addresses", name)))
    }

    /// PTR names for an address, with trailing dots stripped. Empty on any
    /// failure; reverse DNS is enrichment, never a blocker.
    pub async fn reverse(&self, ip: IpAddr) -> Vec<String> {
        match self.inner.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .map(|name| name.to_utf8().trim_end_matches('.').to_string())
                .collect(),
            Err(e) => {
                debug!("[DNS] Reverse lookup for {} failed: {}", ip, e);
                Vec::new()
            }
        }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand one literal token: bare IP, CIDR block, or last-octet range.
/// Returns `None` when the token is none of these and must go to DNS.
pub fn expand_literal_token(token: &str) -> Option<Vec<IpAddr>> {
    if let Ok(ip) = token.parse::<IpAddr>() {
        return Some(vec![ip]);
    }

    if let Ok(net) = token.parse::<ipnet::IpNet>() {
        let mut out = Vec::new();
        for ip in net.hosts() {
            if out.len() >= MAX_EXPANSION {
                warn!(
                    "[Resolver] {} expands past {} hosts, truncating",
                    token, MAX_EXPANSION
                );
                break;
            }
            out.push(ip);
        }
        return Some(out);
    }

    if let Some(caps) = LAST_OCTET_RANGE.captures(token) {
        let base = &caps[1];
        let start: u32 = caps[2].parse().ok()?;
        let end: u32 = caps[3].parse().ok()?;
        let mut out = Vec::new();
        for octet in start..=end.min(255) {
            if let Ok(ip) = format!("{}.{}", base, octet).parse::<IpAddr>() {
                out.push(ip);
            }
        }
        return Some(out);
    }

    None
}

/// Expand a full target expression into sorted, deduplicated addresses.
///
/// Each comma-separated token is tried as an address literal, CIDR block, or
/// last-octet range before falling back to DNS. A hostname that fails to
/// resolve becomes a failure message for that token; the expression as a
/// whole only errors when nothing at all resolved.
pub async fn expand_targets(
    expr: &str,
    resolver: &DnsResolver,
) -> Result<ExpandedTargets, ParseError> {
    // Sorted map keyed by address gives dedup and ordering in one pass,
    // keeping the first hostname seen for an address.
    let mut by_ip: BTreeMap<IpAddr, Option<String>> = BTreeMap::new();
    let mut failures = Vec::new();

    for token in expr.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some(ips) = expand_literal_token(token) {
            if ips.is_empty() {
                failures.push(format!("'{}' expands to no addresses", token));
            }
            for ip in ips {
                by_ip.entry(ip).or_insert(None);
            }
            continue;
        }
        match resolver.resolve_host(token).await {
            Ok(ip) => {
                let entry = by_ip.entry(ip).or_insert(None);
                if entry.is_none() {
                    *entry = Some(token.to_string());
                }
            }
            Err(e) => failures.push(e.to_string()),
        }
    }

    if by_ip.is_empty() {
        let detail = if failures.is_empty() {
            expr.to_string()
        } else {
            failures.join("; ")
        };
        return Err(ParseError::Unresolvable(detail));
    }

    let targets = by_ip
        .into_iter()
        .map(|(ip, hostname)| ResolvedTarget { ip, hostname })
        .collect();
    Ok(ExpandedTargets { targets, failures })
}
