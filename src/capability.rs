use std::fmt;
use std::path::PathBuf;

use log::debug;
use socket2::{Domain, Protocol, Socket, Type};

use crate::models::{EngineKind, EnginePreference, ScanConfig};

/// What this process can actually do on this host, probed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// A raw IPv4/TCP socket could be opened.
    pub raw_socket: bool,
    /// masscan binary found on PATH.
    pub masscan: bool,
    /// nmap binary found on PATH.
    pub nmap: bool,
}

/// Coarse capability grade included in every report so a reader knows how
/// much to trust the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityTier {
    Elite,
    Advanced,
    Standard,
    Basic,
}

impl fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityTier::Elite => write!(f, "elite"),
            CapabilityTier::Advanced => write!(f, "advanced"),
            CapabilityTier::Standard => write!(f, "standard"),
            CapabilityTier::Basic => write!(f, "basic"),
        }
    }
}

impl Capabilities {
    /// Probe the environment. The raw socket test is an actual open attempt,
    /// not a uid check, so capability dropping and extra grants both report
    /// correctly.
    pub fn detect() -> Self {
        let raw_socket = can_open_raw_socket();
        let masscan = find_in_path("masscan").is_some();
        let nmap = find_in_path("nmap").is_some();
        debug!(
            "[Capability] raw_socket={} masscan={} nmap={} euid_root={}",
            raw_socket,
            masscan,
            nmap,
            is_root()
        );
        Capabilities {
            raw_socket,
            masscan,
            nmap,
        }
    }

    pub fn tier(&self) -> CapabilityTier {
        match (self.masscan, self.raw_socket, self.nmap) {
            (true, true, true) => CapabilityTier::Elite,
            (false, true, true) => CapabilityTier::Advanced,
            _ if self.raw_socket || self.nmap => CapabilityTier::Standard,
            _ => CapabilityTier::Basic,
        }
    }

    pub fn supports(&self, kind: EngineKind) -> bool {
        match kind {
            EngineKind::Connect => true,
            EngineKind::Syn => self.raw_socket,
            EngineKind::Masscan => self.masscan,
            EngineKind::Nmap => self.nmap,
        }
    }
}

/// Fallback order from heaviest to lightest technique. Connect closes every
/// chain because it needs nothing beyond an ordinary socket.
const FALLBACK_ORDER: [EngineKind; 4] = [
    EngineKind::Masscan,
    EngineKind::Syn,
    EngineKind::Nmap,
    EngineKind::Connect,
];

/// Pick the engine to try first.
///
/// A pinned preference wins even when unsupported; the fallback chain will
/// walk it down to something runnable. Auto selection weighs the probe
/// product (ports times hosts) against the configured thresholds.
pub fn select_engine(
    config: &ScanConfig,
    caps: &Capabilities,
    probe_count: usize,
) -> EngineKind {
    match config.engine {
        EnginePreference::Pinned(kind) => kind,
        EnginePreference::Auto => {
            if caps.masscan && probe_count > config.masscan_threshold {
                EngineKind::Masscan
            } else if caps.raw_socket && probe_count > config.syn_threshold {
                EngineKind::Syn
            } else if caps.nmap {
                EngineKind::Nmap
            } else {
                EngineKind::Connect
            }
        }
    }
}

/// Engines to attempt, in order, starting from `start` and skipping anything
/// the environment cannot run. Never empty: connect is always last.
pub fn engine_chain(start: EngineKind, caps: &Capabilities) -> Vec<EngineKind> {
    let from = FALLBACK_ORDER
        .iter()
        .position(|k| *k == start)
        .unwrap_or(FALLBACK_ORDER.len() - 1);
    FALLBACK_ORDER[from..]
        .iter()
        .copied()
        .filter(|k| caps.supports(*k))
        .collect()
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn can_open_raw_socket() -> bool {
    Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP)).is_ok()
}

/// Locate an executable on PATH the way a shell would.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(raw: bool, masscan: bool, nmap: bool) -> Capabilities {
        Capabilities {
            raw_socket: raw,
            masscan,
            nmap,
        }
    }

    #[test]
    fn test_tier_grading() {
        assert_eq!(caps(true, true, true).tier(), CapabilityTier::Elite);
        assert_eq!(caps(true, false, true).tier(), CapabilityTier::Advanced);
        assert_eq!(caps(true, false, false).tier(), CapabilityTier::Standard);
        assert_eq!(caps(false, false, true).tier(), CapabilityTier::Standard);
        assert_eq!(caps(false, false, false).tier(), CapabilityTier::Basic);
        // masscan without the rest is still just standard-or-basic territory.
        assert_eq!(caps(false, true, false).tier(), CapabilityTier::Basic);
    }

    #[test]
    fn test_auto_selection_by_probe_count() {
        let config = ScanConfig::default();
        let full = caps(true, true, true);
        assert_eq!(select_engine(&config, &full, 20_000), EngineKind::Masscan);
        assert_eq!(select_engine(&config, &full, 5_000), EngineKind::Syn);
        assert_eq!(select_engine(&config, &full, 50), EngineKind::Nmap);

        let bare = caps(false, false, false);
        assert_eq!(select_engine(&config, &bare, 20_000), EngineKind::Connect);

        // Small job with only raw sockets: syn is not worth it below the
        // threshold and there is no nmap, so plain connect wins.
        let raw_only = caps(true, false, false);
        assert_eq!(select_engine(&config, &raw_only, 50), EngineKind::Connect);
        assert_eq!(select_engine(&config, &raw_only, 500), EngineKind::Syn);
    }

    #[test]
    fn test_pinned_engine_wins_selection() {
        let config = ScanConfig {
            engine: EnginePreference::Pinned(EngineKind::Syn),
            ..ScanConfig::default()
        };
        // Pinning ignores capability; the chain resolves it later.
        assert_eq!(
            select_engine(&config, &caps(false, false, false), 5),
            EngineKind::Syn
        );
    }

    #[test]
    fn test_chain_walks_fallback_order() {
        let full = caps(true, true, true);
        assert_eq!(
            engine_chain(EngineKind::Masscan, &full),
            vec![
                EngineKind::Masscan,
                EngineKind::Syn,
                EngineKind::Nmap,
                EngineKind::Connect
            ]
        );
        assert_eq!(
            engine_chain(EngineKind::Syn, &full),
            vec![EngineKind::Syn, EngineKind::Nmap, EngineKind::Connect]
        );
    }

    #[test]
    fn test_chain_skips_unavailable_engines() {
        let nmap_only = caps(false, false, true);
        assert_eq!(
            engine_chain(EngineKind::Masscan, &nmap_only),
            vec![EngineKind::Nmap, EngineKind::Connect]
        );
        let bare = caps(false, false, false);
        assert_eq!(
            engine_chain(EngineKind::Syn, &bare),
            vec![EngineKind::Connect]
        );
    }

    #[test]
    fn test_chain_always_ends_in_connect() {
        for start in FALLBACK_ORDER {
            for raw in [false, true] {
                for masscan in [false, true] {
                    for nmap in [false, true] {
                        let chain = engine_chain(start, &caps(raw, masscan, nmap));
                        assert!(!chain.is_empty());
                        assert_eq!(*chain.last().unwrap(), EngineKind::Connect);
                    }
                }
            }
        }
    }

    #[test]
    fn test_find_in_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("no-such-binary-for-sure-42").is_none());
    }

    #[test]
    #[cfg(unix)]
    fn test_executable_bit_required() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("fakescan");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        assert!(!is_executable(&tool));

        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable(&tool));
        assert!(!is_executable(dir.path()));
    }
}
