use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::capability::{engine_chain, Capabilities};
use crate::dispatch::{fan_out, DispatchGauge};
use crate::fingerprints::default_service_name;
use crate::half_open::{self, source_for};
use crate::models::{
    clip_text, EngineKind, PortState, ProbeResult, ScanConfig, ServiceFinding, StatCounters,
};
use crate::timing::{AdaptiveTimeout, ProbeRateLimiter};

/// Wait for a service to talk first after a successful connect.
const CONNECT_BANNER_WAIT: Duration = Duration::from_secs(2);

const BANNER_MAX: usize = 256;

/// External tools get a generous but bounded envelope.
const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything one engine invocation needs, shared across its workers.
pub struct ScanContext {
    pub ip: IpAddr,
    /// Name the caller asked for, used in probe templates; falls back to
    /// the address text.
    pub host: String,
    pub ports: Vec<u16>,
    pub config: Arc<ScanConfig>,
    pub timing: Arc<AdaptiveTimeout>,
    pub limiter: Arc<ProbeRateLimiter>,
    pub stats: Arc<StatCounters>,
    pub gauge: Arc<DispatchGauge>,
}

/// One contract for all four techniques: classify these ports on this
/// host. An `Err` means the engine could not run at all and the caller
/// should fall back; per-port trouble never surfaces here.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    fn kind(&self) -> EngineKind;
    async fn scan(&self, ctx: Arc<ScanContext>) -> Result<Vec<ProbeResult>>;
}

pub fn engine_for(kind: EngineKind) -> Box<dyn ScanEngine> {
    match kind {
        EngineKind::Connect => Box::new(ConnectEngine),
        EngineKind::Syn => Box::new(SynEngine),
        EngineKind::Masscan => Box::new(MasscanEngine),
        EngineKind::Nmap => Box::new(NmapEngine),
    }
}

/// Walk the fallback chain from `start` until an engine completes.
/// Returns the engine that actually produced the results, which is what
/// the report must name.
pub async fn run_with_fallback(
    start: EngineKind,
    caps: &Capabilities,
    ctx: Arc<ScanContext>,
) -> (EngineKind, Vec<ProbeResult>) {
    for kind in engine_chain(start, caps) {
        let engine = engine_for(kind);
        match engine.scan(Arc::clone(&ctx)).await {
            Ok(results) => return (engine.kind(), results),
            Err(e) => {
                warn!("[Engine:{}] {} unavailable: {}, falling back", ctx.ip, kind, e);
                eprintln!("[!] {} scan failed ({}), falling back", kind, e);
            }
        }
    }
    // Unreachable in practice: the chain always ends with connect, which
    // never errors as a whole.
    (EngineKind::Connect, Vec::new())
}

/// Full TCP connect per port. Works without privilege anywhere.
pub struct ConnectEngine;

#[async_trait]
impl ScanEngine for ConnectEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Connect
    }

    async fn scan(&self, ctx: Arc<ScanContext>) -> Result<Vec<ProbeResult>> {
        let ports = ctx.ports.clone();
        let limit = ctx.config.concurrency;
        let gauge = Arc::clone(&ctx.gauge);

        let results = fan_out(limit, gauge, ports, move |port| {
            let ctx = Arc::clone(&ctx);
            async move { connect_probe(&ctx, port).await }
        })
        .await;

        Ok(results.into_iter().flatten().collect())
    }
}

async fn connect_probe(ctx: &ScanContext, port: u16) -> Option<ProbeResult> {
    ctx.limiter.acquire().await;
    let probe_timeout = ctx.timing.current();
    let start = Instant::now();
    ctx.stats.add_sent(1);

    match timeout(probe_timeout, TcpStream::connect((ctx.ip, port))).await {
        Ok(Ok(mut stream)) => {
            let elapsed = start.elapsed();
            ctx.stats.add_received(1);
            ctx.timing.record(elapsed);

            let mut result = ProbeResult::new(port, PortState::Open, EngineKind::Connect);
            result.response_time = elapsed.as_secs_f64();

            let mut service = ServiceFinding::new(default_service_name(port), 70);
            // Services that speak first hand us a banner for free.
            let mut buf = vec![0u8; 1024];
            if let Ok(Ok(n)) = timeout(CONNECT_BANNER_WAIT, stream.read(&mut buf)).await {
                if n > 0 {
                    let banner = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                    if !banner.is_empty() {
                        service.banner = Some(clip_text(&banner, BANNER_MAX));
                    }
                }
            }
            result.service = Some(service);
            Some(result)
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            let mut result = ProbeResult::new(port, PortState::Closed, EngineKind::Connect);
            result.response_time = start.elapsed().as_secs_f64();
            Some(result)
        }
        Ok(Err(e)) => {
            debug!("[Connect:{}:{}] {}", ctx.ip, port, e);
            Some(ProbeResult::new(port, PortState::Error, EngineKind::Connect))
        }
        Err(_) => {
            ctx.stats.record_timeout();
            Some(ProbeResult::new(
                port,
                PortState::Filtered,
                EngineKind::Connect,
            ))
        }
    }
}

/// Raw half-open engine: one SYN batch, one collection window.
pub struct SynEngine;

#[async_trait]
impl ScanEngine for SynEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Syn
    }

    async fn scan(&self, ctx: Arc<ScanContext>) -> Result<Vec<ProbeResult>> {
        let IpAddr::V4(target) = ctx.ip else {
            return Err(anyhow!("Raw half-open probing is IPv4-only"));
        };
        let source = source_for(target)
            .ok_or_else(|| anyhow!("No usable local IPv4 source address"))?;

        let window = ctx.timing.current();
        let replies =
            half_open::syn_batch(source, target, &ctx.ports, window, &ctx.limiter).await?;

        ctx.stats.add_sent(ctx.ports.len() as u64);
        ctx.stats.add_received(replies.len() as u64);

        let mut results = Vec::with_capacity(ctx.ports.len());
        for &port in &ctx.ports {
            match replies.get(&port) {
                Some(reply) if reply.state == PortState::Open => {
                    ctx.timing.record(reply.latency);
                    let mut result = ProbeResult::new(port, PortState::Open, EngineKind::Syn);
                    result.response_time = reply.latency.as_secs_f64();
                    result.ttl = Some(reply.ttl);
                    result.window_size = Some(reply.window);
                    result.service = Some(ServiceFinding::new(default_service_name(port), 90));
                    results.push(result);
                }
                Some(reply) => {
                    ctx.timing.record(reply.latency);
                    let mut result = ProbeResult::new(port, reply.state, EngineKind::Syn);
                    result.response_time = reply.latency.as_secs_f64();
                    result.ttl = Some(reply.ttl);
                    results.push(result);
                }
                None => {
                    ctx.stats.record_timeout();
                    results.push(ProbeResult::new(port, PortState::Filtered, EngineKind::Syn));
                }
            }
        }
        Ok(results)
    }
}

/// External fast-batch accelerator. Only ports it reports open come back;
/// silence from it says nothing about the rest.
pub struct MasscanEngine;

#[derive(Debug, Deserialize)]
struct MasscanRecord {
    #[serde(default)]
    ports: Vec<MasscanPortRecord>,
}

#[derive(Debug, Deserialize)]
struct MasscanPortRecord {
    port: u16,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    ttl: Option<u8>,
}

/// Parse masscan's JSON-lines stdout. The format wraps records in array
/// punctuation and trailing commas; anything unparseable is skipped, the
/// tool's own noise included.
pub fn parse_masscan_output(stdout: &str) -> Vec<(u16, Option<u8>)> {
    let mut open = Vec::new();
    for line in stdout.lines() {
        let line = line.trim().trim_end_matches(',');
        if line.is_empty() || !line.starts_with('{') {
            continue;
        }
        let Ok(record) = serde_json::from_str::<MasscanRecord>(line) else {
            continue;
        };
        for p in record.ports {
            if p.status.as_deref().unwrap_or("open") == "open" {
                open.push((p.port, p.ttl));
            }
        }
    }
    open
}

#[async_trait]
impl ScanEngine for MasscanEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Masscan
    }

    async fn scan(&self, ctx: Arc<ScanContext>) -> Result<Vec<ProbeResult>> {
        let port_list = ctx
            .ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let output = timeout(
            SUBPROCESS_TIMEOUT,
            tokio::process::Command::new("masscan")
                .arg(ctx.ip.to_string())
                .args(["-p", &port_list])
                .args(["--rate", &ctx.config.masscan_rate.to_string()])
                .args(["--output-format", "json"])
                .args(["--output-filename", "-"])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| anyhow!("masscan timed out"))?
        .context("Failed to execute masscan")?;

        if !output.status.success() {
            return Err(anyhow!(
                "masscan exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        ctx.stats.add_sent(ctx.ports.len() as u64);

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut results = Vec::new();
        for (port, ttl) in parse_masscan_output(&stdout) {
            let mut result = ProbeResult::new(port, PortState::Open, EngineKind::Masscan);
            result.ttl = ttl;
            result.service = Some(ServiceFinding::new(default_service_name(port), 85));
            results.push(result);
        }
        debug!("[Masscan:{}] {} open ports reported", ctx.ip, results.len());
        Ok(results)
    }
}

/// External integrated scanner, queried in grepable output mode with its
/// own version detection when service detection is on.
pub struct NmapEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmapPortRecord {
    pub port: u16,
    pub state: String,
    pub service: Option<String>,
    pub version_info: Option<String>,
}

/// Parse `-oG -` output: one `Host:` line per target with a `Ports:`
/// field of `port/state/proto/owner/service/rpc/version` entries.
pub fn parse_nmap_grepable(stdout: &str) -> Vec<NmapPortRecord> {
    let mut records = Vec::new();
    for line in stdout.lines() {
        if !line.starts_with("Host:") {
            continue;
        }
        let Some(ports_field) = line.split("Ports: ").nth(1) else {
            continue;
        };
        let ports_field = ports_field.split('\t').next().unwrap_or(ports_field);
        for entry in ports_field.split(", ") {
            let fields: Vec<&str> = entry.split('/').collect();
            if fields.len() < 2 {
                continue;
            }
            let Ok(port) = fields[0].trim().parse::<u16>() else {
                continue;
            };
            let service = fields
                .get(4)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());
            let version_info = fields
                .get(6)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());
            records.push(NmapPortRecord {
                port,
                state: fields[1].trim().to_string(),
                service,
                version_info,
            });
        }
    }
    records
}

/// First version-looking token out of nmap's free-form version column.
pub fn version_from_info(info: &str) -> Option<String> {
    info.split_whitespace()
        .find(|token| token.chars().next().map_or(false, |c| c.is_ascii_digit()))
        .map(|token| token.to_string())
}

#[async_trait]
impl ScanEngine for NmapEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Nmap
    }

    async fn scan(&self, ctx: Arc<ScanContext>) -> Result<Vec<ProbeResult>> {
        let port_list = ctx
            .ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut command = tokio::process::Command::new("nmap");
        command.args(["-p", &port_list, "-T4"]);
        if ctx.config.service_detection {
            command.arg("-sV");
        }
        if ctx.config.os_detection {
            command.arg("-O");
        }
        command
            .args(["-oG", "-"])
            .arg(ctx.ip.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = timeout(SUBPROCESS_TIMEOUT, command.output())
            .await
            .map_err(|_| anyhow!("nmap timed out"))?
            .context("Failed to execute nmap")?;

        if !output.status.success() {
            return Err(anyhow!(
                "nmap exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        ctx.stats.add_sent(ctx.ports.len() as u64);

        let stdout = String::from_utf8_lossy(&output.stdout);
        let records = parse_nmap_grepable(&stdout);
        ctx.stats.add_received(records.len() as u64);

        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let state = record
                .state
                .parse::<PortState>()
                .unwrap_or(PortState::Error);
            let mut result = ProbeResult::new(record.port, state, EngineKind::Nmap);
            if state == PortState::Open {
                let name = record
                    .service
                    .unwrap_or_else(|| default_service_name(record.port));
                let mut service = ServiceFinding::new(name, 90);
                if let Some(info) = record.version_info {
                    service.version = version_from_info(&info);
                    service.banner = Some(clip_text(&info, BANNER_MAX));
                }
                result.service = Some(service);
            }
            results.push(result);
        }
        debug!("[Nmap:{}] {} port records parsed", ctx.ip, results.len());
        Ok(results)
    }
}
