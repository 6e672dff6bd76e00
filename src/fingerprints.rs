use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, trace};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Connection and read budget for one banner grab. Deliberately fixed
/// rather than adaptive: fingerprint probes run after the port is already
/// known open, so the latency window no longer applies.
const BANNER_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on bytes read from a probed service.
const BANNER_READ_LIMIT: usize = 4096;

/// Everything known about one well-known port: its default service label,
/// an optional probe to elicit a banner, and version patterns tried in
/// declaration order.
pub struct PortFingerprint {
    pub service: &'static str,
    pub probe: Option<&'static [u8]>,
    pub patterns: Vec<(Regex, &'static str, u8)>,
}

/// A fingerprint pattern hit: the product label, its confidence, and the
/// version substring if the pattern captured one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub label: &'static str,
    pub confidence: u8,
    pub version: Option<String>,
}

lazy_static! {
    pub static ref FINGERPRINTS: HashMap<u16, PortFingerprint> = build_table();
}

fn build_table() -> HashMap<u16, PortFingerprint> {
    let mut table = HashMap::new();

    // FTP
    table.insert(
        21,
        PortFingerprint {
            service: "ftp",
            probe: None,
            patterns: patterns(&[
                (r"220.*FileZilla", "FileZilla FTP", 90),
                (r"220.*ProFTPD ([\d.]+)", "ProFTPD", 95),
                (r"220.*vsftpd ([\d.]+)", "vsftpd", 95),
                (r"220.*Pure-FTPd", "Pure-FTPd", 90),
                (r"220.*Microsoft FTP Service", "Microsoft IIS FTP", 95),
                (r"220[- ].*FTP", "Generic FTP", 70),
            ]),
        },
    );

    // SSH announces itself on connect; the interesting group is the
    // software version after the protocol version.
    table.insert(
        22,
        PortFingerprint {
            service: "ssh",
            probe: None,
            patterns: patterns(&[
                (r"SSH-([\d.]+)-OpenSSH_([\d.p]+)", "OpenSSH", 95),
                (r"SSH-([\d.]+)-libssh", "libssh", 90),
                (r"SSH.*dropbear", "Dropbear SSH", 90),
                (r"SSH.*Cisco", "Cisco SSH", 90),
            ]),
        },
    );

    // Telnet
    table.insert(
        23,
        PortFingerprint {
            service: "telnet",
            probe: None,
            patterns: patterns(&[
                (r"Ubuntu", "Linux Telnet", 80),
                (r"Debian", "Linux Telnet", 80),
                (r"CentOS", "Linux Telnet", 80),
                (r"login:", "Generic Telnet", 70),
            ]),
        },
    );

    // SMTP
    table.insert(
        25,
        PortFingerprint {
            service: "smtp",
            probe: Some(b"EHLO test\r\n"),
            patterns: patterns(&[
                (r"220.*Postfix", "Postfix SMTP", 95),
                (r"220.*Exim ([\d.]+)", "Exim", 95),
                (r"220.*Sendmail ([\d.]+)", "Sendmail", 95),
                (r"220.*Microsoft ESMTP MAIL Service", "Microsoft Exchange", 95),
                (r"220.*SMTP", "Generic SMTP", 70),
            ]),
        },
    );

    // DNS over TCP rarely banners, but version.bind leaks through some
    // middleware.
    table.insert(
        53,
        PortFingerprint {
            service: "dns",
            probe: None,
            patterns: patterns(&[
                (r"BIND ([\d.]+)", "ISC BIND", 95),
                (r"dnsmasq", "dnsmasq", 90),
            ]),
        },
    );

    // HTTP
    table.insert(
        80,
        PortFingerprint {
            service: "http",
            probe: Some(
                b"GET / HTTP/1.1\r\nHost: %TARGET%\r\nUser-Agent: Mozilla/5.0\r\nConnection: close\r\n\r\n",
            ),
            patterns: patterns(&[
                (r"Server: Apache/([\d.]+)", "Apache HTTP Server", 95),
                (r"Server: nginx/([\d.]+)", "nginx", 95),
                (r"Server: Microsoft-IIS/([\d.]+)", "Microsoft IIS", 95),
                (r"Server: lighttpd/([\d.]+)", "lighttpd", 95),
                (r"HTTP/", "Generic HTTP", 70),
            ]),
        },
    );

    // POP3
    table.insert(
        110,
        PortFingerprint {
            service: "pop3",
            probe: None,
            patterns: patterns(&[
                (r"\+OK.*Dovecot", "Dovecot POP3", 95),
                (r"\+OK.*Courier", "Courier POP3", 90),
                (r"\+OK", "Generic POP3", 70),
            ]),
        },
    );

    // IMAP
    table.insert(
        143,
        PortFingerprint {
            service: "imap",
            probe: None,
            patterns: patterns(&[
                (r"\* OK.*Dovecot", "Dovecot IMAP", 95),
                (r"\* OK.*Courier", "Courier IMAP", 90),
                (r"\* OK", "Generic IMAP", 70),
            ]),
        },
    );

    // HTTPS is handled by the TLS prober, no cleartext patterns apply.
    table.insert(
        443,
        PortFingerprint {
            service: "https",
            probe: None,
            patterns: Vec::new(),
        },
    );

    // SMB
    table.insert(
        445,
        PortFingerprint {
            service: "microsoft-ds",
            probe: None,
            patterns: patterns(&[(r"Windows", "Windows SMB", 90), (r"Samba", "Samba", 90)]),
        },
    );

    // MySQL/MariaDB handshake carries the version in cleartext.
    table.insert(
        3306,
        PortFingerprint {
            service: "mysql",
            probe: None,
            patterns: patterns(&[
                (r"([\d.]+)-MariaDB", "MariaDB", 95),
                (r"([\d.]+)-MySQL", "MySQL", 95),
                (r"mysql_native_password", "MySQL/MariaDB", 85),
            ]),
        },
    );

    // RDP answers nothing useful to a bare read; any response at all on
    // this port is the service.
    table.insert(
        3389,
        PortFingerprint {
            service: "ms-wbt-server",
            probe: None,
            patterns: patterns(&[(r"", "Microsoft Remote Desktop", 85)]),
        },
    );

    // PostgreSQL
    table.insert(
        5432,
        PortFingerprint {
            service: "postgresql",
            probe: None,
            patterns: patterns(&[(r"", "PostgreSQL", 85)]),
        },
    );

    // VNC
    table.insert(
        5900,
        PortFingerprint {
            service: "vnc",
            probe: None,
            patterns: patterns(&[
                (r"RFB ([\d.]+)", "VNC", 95),
                (r"RealVNC", "RealVNC", 90),
                (r"TightVNC", "TightVNC", 90),
            ]),
        },
    );

    // Redis
    table.insert(
        6379,
        PortFingerprint {
            service: "redis",
            probe: Some(b"PING\r\n"),
            patterns: patterns(&[
                (r"\+PONG", "Redis", 95),
                (r"redis_version:([\d.]+)", "Redis", 95),
            ]),
        },
    );

    // HTTP proxy / alt
    table.insert(
        8080,
        PortFingerprint {
            service: "http-proxy",
            probe: Some(b"GET / HTTP/1.1\r\nHost: %TARGET%\r\n\r\n"),
            patterns: patterns(&[
                (r"Server: Apache-Coyote", "Apache Tomcat", 90),
                (r"Server: Jetty", "Jetty", 90),
                (r"HTTP/", "Generic HTTP Proxy", 70),
            ]),
        },
    );

    // Elasticsearch
    table.insert(
        9200,
        PortFingerprint {
            service: "elasticsearch",
            probe: Some(b"GET / HTTP/1.1\r\n\r\n"),
            patterns: patterns(&[
                (r"elasticsearch", "Elasticsearch", 95),
                (r#""version".*"number""#, "Elasticsearch", 90),
            ]),
        },
    );

    // MongoDB
    table.insert(
        27017,
        PortFingerprint {
            service: "mongodb",
            probe: None,
            patterns: patterns(&[(r"", "MongoDB", 85)]),
        },
    );

    table
}

fn patterns(defs: &[(&'static str, &'static str, u8)]) -> Vec<(Regex, &'static str, u8)> {
    defs.iter()
        .filter_map(|(pattern, label, confidence)| {
            Regex::new(pattern).ok().map(|re| (re, *label, *confidence))
        })
        .collect()
}

/// Test a banner against the port's patterns in declaration order; the
/// first hit wins. Version comes from the last non-empty capture group so
/// protocol-version prefixes (SSH-2.0-...) do not shadow the software
/// version.
pub fn match_patterns(port: u16, banner: &str) -> Option<PatternMatch> {
    let fp = FINGERPRINTS.get(&port)?;
    for (re, label, confidence) in &fp.patterns {
        if let Some(caps) = re.captures(banner) {
            let version = caps
                .iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str())
                .filter(|s| !s.is_empty())
                .last()
                .map(|s| s.to_string());
            return Some(PatternMatch {
                label,
                confidence: *confidence,
                version,
            });
        }
    }
    None
}

/// Generic keyword identification for banners from ports without (matching)
/// fingerprints. Callers attach it at guess-level confidence.
pub fn keyword_service(banner: &str) -> Option<&'static str> {
    if banner.is_empty() {
        return None;
    }
    let lower = banner.to_lowercase();

    if lower.starts_with("http/") || lower.contains("server:") {
        return Some("http");
    }
    if lower.contains("ssh-") || lower.contains("openssh") {
        return Some("ssh");
    }
    if lower.starts_with("220 ") && (lower.contains("mail") || lower.contains("smtp")) {
        return Some("smtp");
    }
    if lower.contains("ftp") || lower.starts_with("220 ") {
        return Some("ftp");
    }
    if lower.contains("smtp") {
        return Some("smtp");
    }
    if lower.contains("pop3") || lower.starts_with("+ok") {
        return Some("pop3");
    }
    if lower.contains("imap") || lower.starts_with("* ok") {
        return Some("imap");
    }
    if lower.contains("mysql") {
        return Some("mysql");
    }
    if lower.contains("postgresql") {
        return Some("postgresql");
    }
    None
}

/// Default service label for a port, used before any banner evidence
/// arrives.
pub fn default_service_name(port: u16) -> String {
    if let Some(fp) = FINGERPRINTS.get(&port) {
        return fp.service.to_string();
    }
    let known = match port {
        111 => Some("rpcbind"),
        135 => Some("msrpc"),
        139 => Some("netbios-ssn"),
        993 => Some("imaps"),
        995 => Some("pop3s"),
        1433 => Some("ms-sql-s"),
        1723 => Some("pptp"),
        8443 => Some("https-alt"),
        8888 => Some("http-alt"),
        11211 => Some("memcached"),
        _ => None,
    };
    known
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("port-{}", port))
}

/// True when this port has a fingerprint entry worth probing.
pub fn has_fingerprint(port: u16) -> bool {
    FINGERPRINTS.contains_key(&port)
}

fn render_probe(probe: &[u8], host: &str) -> Vec<u8> {
    let text = String::from_utf8_lossy(probe);
    if text.contains("%TARGET%") {
        text.replace("%TARGET%", host).into_bytes()
    } else {
        probe.to_vec()
    }
}

/// Open a fresh connection to an already-open port, send the designated
/// probe if any, and read whatever the service offers. `None` means the
/// grab failed outright; `Some("")` means the service stayed silent until
/// EOF, which is itself a signal for the always-match patterns.
pub async fn probe_banner(ip: IpAddr, host: &str, port: u16) -> Option<String> {
    let connect = timeout(BANNER_TIMEOUT, TcpStream::connect((ip, port))).await;
    let mut stream = match connect {
        Ok(Ok(s)) => s,
        _ => {
            debug!("[Banner:{}:{}] Connection failed", ip, port);
            return None;
        }
    };

    if let Some(fp) = FINGERPRINTS.get(&port) {
        if let Some(probe) = fp.probe {
            let payload = render_probe(probe, host);
            if !payload.is_empty()
                && timeout(BANNER_TIMEOUT, stream.write_all(&payload))
                    .await
                    .map_or(true, |r| r.is_err())
            {
                debug!("[Banner:{}:{}] Probe write failed", ip, port);
                return None;
            }
        }
    }

    let mut buf = vec![0u8; BANNER_READ_LIMIT];
    match timeout(BANNER_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(n)) => {
            let banner = String::from_utf8_lossy(&buf[..n]).trim().to_string();
            trace!("[Banner:{}:{}] {} bytes", ip, port, n);
            Some(banner)
        }
        _ => {
            debug!("[Banner:{}:{}] Read timed out", ip, port);
            None
        }
    }
}
