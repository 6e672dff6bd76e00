use std::net::IpAddr;
use std::time::Duration;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::models::{clip_text, HttpFinding};
use crate::tls_probe::permissive_config;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Response body cap. Enough for headers plus the page head where titles
/// and framework markers live.
const HTTP_READ_LIMIT: usize = 65_536;

const TITLE_MAX: usize = 200;

lazy_static! {
    static ref TITLE_RE: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap();

    /// Technology signatures checked against the whole response (headers and
    /// body). Declaration order is output order.
    static ref TECH_SIGNATURES: Vec<(&'static str, Vec<Regex>)> = build_tech_signatures();
}

fn build_tech_signatures() -> Vec<(&'static str, Vec<Regex>)> {
    let defs: Vec<(&'static str, Vec<&'static str>)> = vec![
        (
            "WordPress",
            vec![
                r"wp-content",
                r"wp-includes",
                r"/wp-json/",
                r#"<meta name="generator" content="WordPress"#,
            ],
        ),
        ("Joomla", vec![r"Joomla", r"/components/", r"/modules/", r"com_content"]),
        ("Drupal", vec![r"Drupal", r"/sites/default/", r"drupal\.js", r"X-Generator.*Drupal"]),
        ("Django", vec![r"csrfmiddlewaretoken", r"__admin__", r"django"]),
        ("Flask", vec![r"flask", r"werkzeug"]),
        ("Express", vec![r"X-Powered-By: Express", r"express"]),
        ("Apache", vec![r"Server: Apache", r"Apache/[\d.]+"]),
        ("Nginx", vec![r"Server: nginx", r"nginx/[\d.]+"]),
        ("IIS", vec![r"Server: Microsoft-IIS", r"X-AspNet-Version", r"X-Powered-By: ASP\.NET"]),
        ("PHP", vec![r"X-Powered-By: PHP", r"\.php", r"PHPSESSID"]),
        ("ASP.NET", vec![r"X-AspNet-Version", r"__VIEWSTATE", r"__EVENTVALIDATION"]),
        ("React", vec![r"react", r"reactDOM", r"_react", r"data-reactid"]),
        ("Angular", vec![r"ng-version", r"angular", r"ng-app"]),
        ("Vue.js", vec![r"vue\.js", r"vuejs", r"data-v-", r"vue-router"]),
        ("jQuery", vec![r"jquery", r"jQuery"]),
        ("Bootstrap", vec![r"bootstrap", r"Bootstrap"]),
        ("Laravel", vec![r"laravel_session", r"X-Powered-By.*Laravel"]),
        ("Ruby on Rails", vec![r"X-Powered-By: Phusion Passenger", r"Rails"]),
        ("Symfony", vec![r"X-Powered-By.*Symfony", r"symfony"]),
        ("Spring", vec![r"X-Application-Context", r"Spring"]),
        ("Tomcat", vec![r"Server: Apache-Coyote", r"Tomcat"]),
        ("Varnish", vec![r"Via:.*varnish", r"X-Varnish"]),
        ("Cloudflare", vec![r"Server: cloudflare", r"__cfduid", r"CF-RAY"]),
        ("Amazon CloudFront", vec![r"X-Amz-Cf-Id", r"Via:.*CloudFront"]),
    ];

    defs.into_iter()
        .map(|(name, patterns)| {
            let compiled = patterns
                .into_iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect();
            (name, compiled)
        })
        .collect()
}

/// Whether a port is worth an HTTP request at all.
pub fn is_http_candidate(port: u16, service: Option<&str>) -> bool {
    if matches!(port, 80 | 443 | 8080 | 8443) {
        return true;
    }
    matches!(
        service,
        Some("http") | Some("https") | Some("http-proxy") | Some("https-alt")
    )
}

/// Whether a port should be probed for TLS details.
pub fn is_tls_candidate(port: u16, service: Option<&str>) -> bool {
    if matches!(port, 443 | 8443) {
        return true;
    }
    service.map_or(false, |s| s.contains("https"))
}

/// Parse a raw HTTP response into structured fields. Pure so it can be
/// tested without a socket.
pub fn analyze_response(raw: &str) -> HttpFinding {
    let mut finding = HttpFinding::default();

    let mut lines = raw.lines();
    if let Some(status_line) = lines.next() {
        let mut parts = status_line.split_whitespace();
        if parts.next().map_or(false, |v| v.starts_with("HTTP/")) {
            finding.status = parts.next().and_then(|code| code.parse().ok());
        }
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            match name.to_lowercase().as_str() {
                "server" => finding.server = Some(value.to_string()),
                "content-type" => finding.content_type = Some(value.to_string()),
                _ => {}
            }
        }
    }

    finding.title = TITLE_RE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| clip_text(m.as_str().trim(), TITLE_MAX))
        .filter(|t| !t.is_empty());

    finding.technologies = detect_technologies(raw);
    finding
}

/// Every technology whose signature appears anywhere in the response.
pub fn detect_technologies(raw: &str) -> Vec<String> {
    TECH_SIGNATURES
        .iter()
        .filter(|(_, patterns)| patterns.iter().any(|re| re.is_match(raw)))
        .map(|(name, _)| name.to_string())
        .collect()
}

async fn exchange<S>(stream: &mut S, request: &[u8]) -> Option<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if timeout(HTTP_TIMEOUT, stream.write_all(request))
        .await
        .map_or(true, |r| r.is_err())
    {
        return None;
    }

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match timeout(HTTP_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                response.extend_from_slice(&buf[..n]);
                if response.len() >= HTTP_READ_LIMIT {
                    response.truncate(HTTP_READ_LIMIT);
                    break;
                }
            }
            // Timeouts and errors end the read; whatever arrived still
            // counts.
            _ => break,
        }
    }

    if response.is_empty() {
        None
    } else {
        Some(response)
    }
}

fn build_request(host: &str) -> Vec<u8> {
    format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: Mozilla/5.0\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        host
    )
    .into_bytes()
}

async fn fetch(ip: IpAddr, host: &str, port: u16, use_tls: bool) -> Option<String> {
    let mut tcp = match timeout(HTTP_TIMEOUT, TcpStream::connect((ip, port))).await {
        Ok(Ok(s)) => s,
        _ => return None,
    };

    let request = build_request(host);
    let raw = if use_tls {
        let connector = TlsConnector::from(permissive_config());
        let server_name = match ServerName::try_from(host.to_string()) {
            Ok(name) => name,
            Err(_) => ServerName::IpAddress(ip.into()),
        };
        let mut tls = match timeout(HTTP_TIMEOUT, connector.connect(server_name, tcp)).await {
            Ok(Ok(t)) => t,
            _ => return None,
        };
        exchange(&mut tls, &request).await?
    } else {
        exchange(&mut tcp, &request).await?
    };

    Some(String::from_utf8_lossy(&raw).into_owned())
}

/// Fetch and analyze the root document, trying the likelier protocol first
/// for the given port. `None` when neither protocol produced any bytes.
pub async fn analyze(ip: IpAddr, host: &str, port: u16) -> Option<HttpFinding> {
    let tls_first = matches!(port, 443 | 8443);
    let order = if tls_first { [true, false] } else { [false, true] };

    for use_tls in order {
        if let Some(raw) = fetch(ip, host, port, use_tls).await {
            let finding = analyze_response(&raw);
            debug!(
                "[HTTP Scan:{}:{}] tls={} status={:?} server={:?}",
                ip, port, use_tls, finding.status, finding.server
            );
            return Some(finding);
        }
    }
    debug!("[HTTP Scan:{}:{}] No response on either protocol", ip, port);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "HTTP/1.1 200 OK\r\n\
Server: nginx/1.20.0\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Set-Cookie: PHPSESSID=abc123\r\n\
\r\n\
<html><head><title>  Welcome Home  </title>\
<script src=\"/wp-content/themes/x/jquery.min.js\"></script>\
</head><body></body></html>";

    #[test]
    fn test_analyze_response_fields() {
        let finding = analyze_response(SAMPLE);
        assert_eq!(finding.status, Some(200));
        assert_eq!(finding.server.as_deref(), Some("nginx/1.20.0"));
        assert_eq!(
            finding.content_type.as_deref(),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(finding.title.as_deref(), Some("Welcome Home"));
    }

    #[test]
    fn test_technology_detection() {
        let techs = analyze_response(SAMPLE).technologies;
        assert!(techs.contains(&"WordPress".to_string()));
        assert!(techs.contains(&"Nginx".to_string()));
        assert!(techs.contains(&"jQuery".to_string()));
        assert!(techs.contains(&"PHP".to_string()));
        assert!(!techs.contains(&"Drupal".to_string()));
    }

    #[test]
    fn test_detection_order_is_declaration_order() {
        let first = detect_technologies(SAMPLE);
        let second = detect_technologies(SAMPLE);
        assert_eq!(first, second);
        // Nginx is declared before PHP in the signature table.
        let nginx = first.iter().position(|t| t == "Nginx");
        let php = first.iter().position(|t| t == "PHP");
        assert!(nginx < php);
    }

    #[test]
    fn test_malformed_response_degrades() {
        let finding = analyze_response("complete garbage, not http at all");
        assert_eq!(finding.status, None);
        assert_eq!(finding.server, None);
        assert_eq!(finding.title, None);

        let finding = analyze_response("HTTP/1.1 twohundred OK\r\n\r\n");
        assert_eq!(finding.status, None);
    }

    #[test]
    fn test_title_is_clipped() {
        let long_title = "x".repeat(500);
        let raw = format!("HTTP/1.1 200 OK\r\n\r\n<title>{}</title>", long_title);
        let finding = analyze_response(&raw);
        assert_eq!(finding.title.map(|t| t.len()), Some(200));
    }

    #[test]
    fn test_http_candidates() {
        assert!(is_http_candidate(80, None));
        assert!(is_http_candidate(8443, None));
        assert!(is_http_candidate(3000, Some("http")));
        assert!(!is_http_candidate(22, Some("ssh")));

        assert!(is_tls_candidate(443, None));
        assert!(is_tls_candidate(9443, Some("https-alt")));
        assert!(!is_tls_candidate(80, Some("http")));
    }
}
