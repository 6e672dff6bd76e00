use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Hard ceiling on concurrent probe workers, regardless of caller request.
pub const MAX_WORKERS: usize = 500;

/// Scan techniques this engine can execute.
///
/// The order of fallback between them is fixed (see `capability::engine_chain`);
/// this enum only names the techniques.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Full TCP connect per port. Always available.
    Connect,
    /// Raw half-open (SYN) probe batch. Requires raw socket privilege.
    Syn,
    /// External masscan subprocess for very large port products.
    Masscan,
    /// External nmap subprocess with version detection.
    Nmap,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Connect => write!(f, "connect"),
            EngineKind::Syn => write!(f, "syn"),
            EngineKind::Masscan => write!(f, "masscan"),
            EngineKind::Nmap => write!(f, "nmap"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "connect" | "tcp" => Ok(EngineKind::Connect),
            "syn" | "half-open" => Ok(EngineKind::Syn),
            "masscan" | "external-fast" => Ok(EngineKind::Masscan),
            "nmap" | "external-integrated" => Ok(EngineKind::Nmap),
            _ => Err(format!("Unknown scan engine: {}", s)),
        }
    }
}

/// Caller preference for engine selection. `Auto` hands the decision to the
/// capability-aware heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePreference {
    Auto,
    Pinned(EngineKind),
}

impl FromStr for EnginePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            Ok(EnginePreference::Auto)
        } else {
            EngineKind::from_str(s).map(EnginePreference::Pinned)
        }
    }
}

/// Transport-level state of a single probed port.
///
/// `OpenFiltered` is the inherently ambiguous answer from a probe that got no
/// positive or negative signal where silence can mean either; it is never
/// collapsed into plain open or filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PortState {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "filtered")]
    Filtered,
    #[serde(rename = "open|filtered")]
    OpenFiltered,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed => write!(f, "closed"),
            PortState::Filtered => write!(f, "filtered"),
            PortState::OpenFiltered => write!(f, "open|filtered"),
            PortState::Error => write!(f, "error"),
        }
    }
}

impl FromStr for PortState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(PortState::Open),
            "closed" => Ok(PortState::Closed),
            "filtered" => Ok(PortState::Filtered),
            "open|filtered" | "openfiltered" => Ok(PortState::OpenFiltered),
            "error" => Ok(PortState::Error),
            _ => Err(format!("Unknown port state: {}", s)),
        }
    }
}

/// A CVE identifier attached to a service finding, with its reference URL.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VulnerabilityRecord {
    pub id: String,
    pub url: String,
}

/// Service identification attached to an open port.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceFinding {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    /// Identification confidence in [0, 100]. Only ever raised by later
    /// enrichment passes, never lowered.
    pub confidence: u8,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vulnerabilities: Vec<VulnerabilityRecord>,
}

impl ServiceFinding {
    pub fn new(name: String, confidence: u8) -> Self {
        ServiceFinding {
            name,
            version: None,
            banner: None,
            confidence,
            vulnerabilities: Vec::new(),
        }
    }

    /// Raise confidence to `value` if higher than the current score.
    pub fn raise_confidence(&mut self, value: u8) {
        if value > self.confidence {
            self.confidence = value.min(100);
        }
    }
}

/// TLS layer details for a port that completed a handshake. All fields are
/// best-effort.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TlsFinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub san: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint_sha256: Option<String>,
}

/// HTTP layer details for a web-capable port.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpFinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub technologies: Vec<String>,
}

/// One port's probe outcome, enriched in place by the detection pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub port: u16,
    pub protocol: &'static str,
    pub state: PortState,
    /// Which engine actually produced this result, not which was requested.
    pub engine: EngineKind,
    /// Seconds from probe emission to response, 0.0 when not observed.
    pub response_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_size: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceFinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsFinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpFinding>,
}

impl ProbeResult {
    pub fn new(port: u16, state: PortState, engine: EngineKind) -> Self {
        ProbeResult {
            port,
            protocol: "tcp",
            state,
            engine,
            response_time: 0.0,
            ttl: None,
            window_size: None,
            service: None,
            tls: None,
            http: None,
        }
    }
}

/// Sealed per-host report.
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_family: Option<String>,
    pub os_confidence: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    pub open_ports: Vec<ProbeResult>,
    pub closed_ports: Vec<u16>,
    pub filtered_ports: Vec<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse_dns: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub avg_response_time: f64,
}

impl HostInfo {
    pub fn new(ip: String) -> Self {
        let now = Utc::now();
        HostInfo {
            ip,
            hostname: None,
            mac_address: None,
            mac_vendor: None,
            os_family: None,
            os_confidence: 0,
            device_type: None,
            open_ports: Vec::new(),
            closed_ports: Vec::new(),
            filtered_ports: Vec::new(),
            dns_names: Vec::new(),
            reverse_dns: None,
            first_seen: now,
            last_seen: now,
            avg_response_time: 0.0,
        }
    }
}

/// Counters for the whole run, serialized into the final report.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ScanStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub open_ports: u64,
    pub closed_ports: u64,
    pub filtered_ports: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub duration: f64,
    pub ports_scanned: u64,
    pub scan_type: String,
    pub capability: String,
}

/// Counts-only view of the scan.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Summary {
    pub total_ports: u64,
    pub open_ports: u64,
    pub closed_ports: u64,
    pub filtered_ports: u64,
}

/// Shared, lock-free statistics updated from concurrent probe workers.
#[derive(Debug, Default)]
pub struct StatCounters {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub open_ports: AtomicU64,
    pub closed_ports: AtomicU64,
    pub filtered_ports: AtomicU64,
    pub timeouts: AtomicU64,
    pub errors: AtomicU64,
}

impl StatCounters {
    pub fn add_sent(&self, n: u64) {
        self.packets_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.packets_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_state(&self, state: PortState) {
        let counter = match state {
            PortState::Open => &self.open_ports,
            PortState::Closed => &self.closed_ports,
            PortState::Filtered | PortState::OpenFiltered => &self.filtered_ports,
            PortState::Error => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, duration: f64, scan_type: &str, capability: &str) -> ScanStats {
        let sent = self.packets_sent.load(Ordering::Relaxed);
        ScanStats {
            packets_sent: sent,
            packets_received: self.packets_received.load(Ordering::Relaxed),
            open_ports: self.open_ports.load(Ordering::Relaxed),
            closed_ports: self.closed_ports.load(Ordering::Relaxed),
            filtered_ports: self.filtered_ports.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            duration,
            ports_scanned: sent,
            scan_type: scan_type.to_string(),
            capability: capability.to_string(),
        }
    }
}

/// Immutable configuration for one scan run, built from caller parameters
/// with every knob clamped to a sane range.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub engine: EnginePreference,
    pub base_timeout: Duration,
    pub concurrency: usize,
    /// Max probes per second, 0 disables the limiter.
    pub rate_limit: u32,
    /// Packet rate handed to masscan, independent of `rate_limit`.
    pub masscan_rate: u32,
    pub service_detection: bool,
    pub http_analysis: bool,
    pub tls_analysis: bool,
    pub os_detection: bool,
    pub dns_lookup: bool,
    pub mac_lookup: bool,
    pub show_closed: bool,
    pub show_filtered: bool,
    pub timeout_floor: Duration,
    pub timeout_ceiling: Duration,
    pub timeout_multiplier: f64,
    pub latency_window: usize,
    pub min_latency_samples: usize,
    /// Probe-count threshold above which masscan is preferred when present.
    pub masscan_threshold: usize,
    /// Probe-count threshold above which the SYN engine is preferred when
    /// raw sockets are usable.
    pub syn_threshold: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            engine: EnginePreference::Auto,
            base_timeout: Duration::from_secs(1),
            concurrency: 100,
            rate_limit: 0,
            masscan_rate: 1000,
            service_detection: true,
            http_analysis: true,
            tls_analysis: true,
            os_detection: false,
            dns_lookup: true,
            mac_lookup: true,
            show_closed: false,
            show_filtered: false,
            timeout_floor: Duration::from_millis(500),
            timeout_ceiling: Duration::from_secs(10),
            timeout_multiplier: 1.5,
            latency_window: 100,
            min_latency_samples: 10,
            masscan_threshold: 10_000,
            syn_threshold: 100,
        }
    }
}

/// Errors from target or port expression parsing.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Port expression '{0}' contains no valid ports")]
    EmptyPortSet(String),
    #[error("Failed to resolve target: {0}")]
    Unresolvable(String),
}

/// Parse a port expression into a sorted, deduplicated list.
///
/// Accepts a preset name or comma-separated integers and `start-end` ranges.
/// Invalid tokens are dropped; an expression that yields nothing at all is an
/// error because a scan without ports is a configuration mistake, not a
/// degraded run.
pub fn parse_port_expression(expr: &str) -> Result<Vec<u16>, ParseError> {
    if let Some(preset) = preset_ports(expr.trim()) {
        return Ok(preset);
    }

    let mut ports = std::collections::BTreeSet::new();
    for part in expr.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.trim().parse::<u32>(), end.trim().parse::<u32>())
            {
                for p in start..=end.min(65535) {
                    if (1..=65535).contains(&p) {
                        ports.insert(p as u16);
                    }
                }
            }
        } else if let Ok(p) = part.parse::<u32>() {
            if (1..=65535).contains(&p) {
                ports.insert(p as u16);
            }
        }
    }

    if ports.is_empty() {
        return Err(ParseError::EmptyPortSet(expr.to_string()));
    }
    Ok(ports.into_iter().collect())
}

/// Named port presets. Returns `None` for names that are not presets so the
/// caller can fall through to expression parsing.
pub fn preset_ports(name: &str) -> Option<Vec<u16>> {
    match name {
        "quick" => Some(vec![
            21, 22, 23, 25, 80, 110, 135, 139, 143, 443, 445, 3306, 3389, 5900, 8080,
        ]),
        "top-20" => Some(vec![
            21, 22, 23, 25, 53, 80, 110, 111, 135, 139, 143, 443, 445, 993, 995, 1723, 3306,
            3389, 5900, 8080,
        ]),
        "top-100" => Some((1..=100).collect()),
        "top-1000" => Some((1..=1000).collect()),
        "web" => Some(vec![
            80, 81, 280, 443, 591, 593, 832, 981, 1010, 1311, 2082, 2087, 2095, 2096, 2480,
            3000, 3128, 3333, 4243, 4567, 4711, 4712, 4993, 5000, 5001, 5104, 5108, 5280, 5800,
            6543, 7000, 7001, 7396, 7474, 8000, 8001, 8008, 8014, 8042, 8069, 8080, 8081, 8083,
            8088, 8090, 8091, 8118, 8123, 8172, 8181, 8222, 8243, 8280, 8281, 8333, 8337, 8443,
            8500, 8834, 8880, 8888, 8983, 9000, 9043, 9060, 9080, 9090, 9091, 9200, 9443, 9800,
            9981, 11371, 12443, 16080, 18091, 18092, 20720, 28017,
        ]),
        "database" => Some(vec![
            1433, 1521, 2483, 2484, 3050, 3306, 5000, 5432, 5984, 6379, 7000, 7001, 7473, 7474,
            8020, 8086, 8087, 8098, 9042, 9160, 9200, 9300, 11211, 27017, 27018, 27019, 28017,
            50000,
        ]),
        "mail" => Some(vec![25, 110, 143, 465, 587, 993, 995, 2525]),
        "common" => Some(vec![
            20, 21, 22, 23, 25, 53, 80, 110, 111, 113, 135, 139, 143, 179, 443, 445, 465, 514,
            515, 587, 631, 993, 995, 1080, 1433, 1521, 1723, 2049, 2181, 3306, 3389, 5432, 5800,
            5900, 5984, 6379, 7001, 8000, 8080, 8443, 8888, 9000, 9042, 9090, 9200, 9300, 11211,
            27017, 27018, 50000,
        ]),
        "well-known" => Some((1..=1023).collect()),
        "all" => Some((1..=65535).collect()),
        _ => None,
    }
}

/// Clip text to a byte budget on a char boundary, for banners and titles.
pub fn clip_text(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_list_and_ranges() {
        let ports = parse_port_expression("80,443,8000-8010").unwrap();
        let mut expected = vec![80, 443];
        expected.extend(8000..=8010);
        assert_eq!(ports, expected);
        assert_eq!(ports.len(), 13);
    }

    #[test]
    fn test_parsed_ports_sorted_unique_in_range() {
        let ports = parse_port_expression("443,80,443,22,1-5,3").unwrap();
        assert_eq!(ports, vec![1, 2, 3, 4, 5, 22, 80, 443]);
        for w in ports.windows(2) {
            assert!(w[0] < w[1], "ports must be strictly sorted");
        }
        assert!(ports.iter().all(|p| (1..=65535).contains(p)));
    }

    #[test]
    fn test_invalid_tokens_dropped() {
        let ports = parse_port_expression("80,abc,99999,0,443").unwrap();
        assert_eq!(ports, vec![80, 443]);
    }

    #[test]
    fn test_empty_port_set_is_error() {
        assert!(matches!(
            parse_port_expression("abc,def"),
            Err(ParseError::EmptyPortSet(_))
        ));
        assert!(parse_port_expression("").is_err());
    }

    #[test]
    fn test_quick_preset_is_deterministic() {
        let first = parse_port_expression("quick").unwrap();
        let second = parse_port_expression("quick").unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![21, 22, 23, 25, 80, 110, 135, 139, 143, 443, 445, 3306, 3389, 5900, 8080]
        );
    }

    #[test]
    fn test_range_presets() {
        assert_eq!(parse_port_expression("top-100").unwrap().len(), 100);
        assert_eq!(parse_port_expression("well-known").unwrap().len(), 1023);
        let all = parse_port_expression("all").unwrap();
        assert_eq!(all.len(), 65535);
        assert_eq!(all[0], 1);
        assert_eq!(*all.last().unwrap(), 65535);
    }

    #[test]
    fn test_engine_kind_parsing() {
        assert_eq!("syn".parse::<EngineKind>().unwrap(), EngineKind::Syn);
        assert_eq!(
            "external-fast".parse::<EngineKind>().unwrap(),
            EngineKind::Masscan
        );
        assert_eq!(
            "external-integrated".parse::<EngineKind>().unwrap(),
            EngineKind::Nmap
        );
        assert!("warp".parse::<EngineKind>().is_err());
        assert_eq!(
            "auto".parse::<EnginePreference>().unwrap(),
            EnginePreference::Auto
        );
        assert_eq!(
            "connect".parse::<EnginePreference>().unwrap(),
            EnginePreference::Pinned(EngineKind::Connect)
        );
    }

    #[test]
    fn test_port_state_round_trip() {
        assert_eq!(PortState::OpenFiltered.to_string(), "open|filtered");
        assert_eq!(
            "open|filtered".parse::<PortState>().unwrap(),
            PortState::OpenFiltered
        );
        assert_eq!("open".parse::<PortState>().unwrap(), PortState::Open);
    }

    #[test]
    fn test_confidence_only_raises() {
        let mut finding = ServiceFinding::new("http".to_string(), 70);
        finding.raise_confidence(50);
        assert_eq!(finding.confidence, 70);
        finding.raise_confidence(95);
        assert_eq!(finding.confidence, 95);
    }

    #[test]
    fn test_clip_text_respects_char_boundary() {
        assert_eq!(clip_text("hello", 10), "hello");
        assert_eq!(clip_text("hello", 3), "hel");
        // A multi-byte char straddling the cut point is dropped whole.
        let clipped = clip_text("ab\u{00e9}cd", 3);
        assert_eq!(clipped, "ab");
    }
}
