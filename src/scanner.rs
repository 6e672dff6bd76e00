use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;

use crate::capability::{select_engine, Capabilities};
use crate::device;
use crate::dispatch::{fan_out, DispatchGauge};
use crate::engines::{run_with_fallback, ScanContext};
use crate::fingerprints;
use crate::half_open;
use crate::http_probe;
use crate::models::{
    clip_text, EngineKind, HostInfo, PortState, ProbeResult, ScanConfig, ScanStats,
    ServiceFinding, StatCounters, Summary,
};
use crate::resolver::{expand_targets, DnsResolver, ResolvedTarget};
use crate::timing::{AdaptiveTimeout, ProbeRateLimiter};
use crate::tls_probe;
use crate::vulns;

const BANNER_MAX: usize = 256;

/// Confidence floor for a service named only by its port number.
const PORT_GUESS_CONFIDENCE: u8 = 60;

/// Added on top of the current confidence when an HTTP exchange confirms
/// the port really speaks HTTP.
const HTTP_CONFIRM_BONUS: u8 = 15;

/// Aggregated payload of one run. A single-target scan reports under
/// `host_info`; an expression that expanded to several hosts reports the
/// whole set under `hosts`. Counters always cover the entire run.
#[derive(Debug, Serialize)]
pub struct ScanReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_info: Option<HostInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<HostInfo>,
    pub scan_stats: ScanStats,
    pub summary: Summary,
}

/// Execute one scan request end to end: expand the target expression, pick
/// an engine for the probe volume, classify every port, then enrich and
/// aggregate per host.
pub async fn run(target_expr: &str, ports: Vec<u16>, config: ScanConfig) -> Result<ScanReport> {
    let started = Instant::now();
    let caps = Capabilities::detect();
    let tier = caps.tier();

    let resolver = DnsResolver::new();
    let expanded = expand_targets(target_expr, &resolver).await?;
    for failure in &expanded.failures {
        warn!("[Scanner] {}", failure);
        eprintln!("[!] {}", failure);
    }

    let probe_count = ports.len().saturating_mul(expanded.targets.len());
    let engine = select_engine(&config, &caps, probe_count);

    eprintln!("[*] Scanning {} ({} ports)", target_expr, ports.len());
    eprintln!("[*] Capability level: {}", tier);
    eprintln!("[*] Max workers: {}", config.concurrency);
    eprintln!("[*] Using scan engine: {}", engine);

    let config = Arc::new(config);
    let stats = Arc::new(StatCounters::default());
    let timing = Arc::new(AdaptiveTimeout::from_config(&config));
    let limiter = Arc::new(ProbeRateLimiter::new(config.rate_limit));
    let gauge = Arc::new(DispatchGauge::default());

    // Fallback can demote the engine mid-run; the first host's outcome
    // names the run, per-result provenance covers the rest.
    let mut engine_used = None;
    let mut hosts = Vec::with_capacity(expanded.targets.len());
    for target in &expanded.targets {
        let ctx = Arc::new(ScanContext {
            ip: target.ip,
            host: target
                .hostname
                .clone()
                .unwrap_or_else(|| target.ip.to_string()),
            ports: ports.clone(),
            config: Arc::clone(&config),
            timing: Arc::clone(&timing),
            limiter: Arc::clone(&limiter),
            stats: Arc::clone(&stats),
            gauge: Arc::clone(&gauge),
        });
        let (used, host) = scan_host(target, engine, &caps, &resolver, ctx).await;
        engine_used.get_or_insert(used);
        hosts.push(host);
    }
    let engine_used = engine_used.unwrap_or(engine);

    let scan_stats = stats.snapshot(
        started.elapsed().as_secs_f64(),
        &engine_used.to_string(),
        &tier.to_string(),
    );
    let summary = Summary {
        total_ports: scan_stats.open_ports
            + scan_stats.closed_ports
            + scan_stats.filtered_ports
            + scan_stats.errors,
        open_ports: scan_stats.open_ports,
        closed_ports: scan_stats.closed_ports,
        filtered_ports: scan_stats.filtered_ports,
    };

    info!(
        "[Scanner] {} done: {} open across {} host(s) in {:.2}s",
        target_expr,
        summary.open_ports,
        hosts.len(),
        scan_stats.duration
    );

    let mut report = ScanReport {
        host_info: None,
        hosts: Vec::new(),
        scan_stats,
        summary,
    };
    if hosts.len() == 1 {
        report.host_info = hosts.pop();
    } else {
        report.hosts = hosts;
    }
    Ok(report)
}

/// Scan and enrich a single host. Returns the engine that actually produced
/// the port states so the report can name it.
async fn scan_host(
    target: &ResolvedTarget,
    engine: EngineKind,
    caps: &Capabilities,
    resolver: &DnsResolver,
    ctx: Arc<ScanContext>,
) -> (EngineKind, HostInfo) {
    debug!("[Scanner] Probing {} starting from {}", target.ip, engine);
    let (used, mut results) = run_with_fallback(engine, caps, Arc::clone(&ctx)).await;
    for result in &results {
        ctx.stats.record_state(result.state);
    }

    enrich_results(&ctx, &mut results).await;

    let mut host = HostInfo::new(target.ip.to_string());
    host.hostname = target.hostname.clone();

    if ctx.config.os_detection {
        let ttl = observed_ttl(&ctx, caps, &results).await;
        let (family, confidence) = device::infer_os(ttl, &results);
        host.os_family = family;
        host.os_confidence = confidence;
    }

    if ctx.config.dns_lookup {
        let names = resolver.reverse(target.ip).await;
        host.reverse_dns = names.first().cloned();
        host.dns_names = names;
        if host.hostname.is_none() {
            host.hostname = host.reverse_dns.clone();
        }
    }

    if ctx.config.mac_lookup {
        if let Some(mac) = device::arp_lookup(target.ip) {
            host.mac_vendor = Some(device::lookup_vendor(&mac));
            host.mac_address = Some(mac);
        }
    }
    host.device_type = device::infer_device_type(host.mac_vendor.as_deref(), &results);

    seal(&mut host, results, &ctx.config);
    (used, host)
}

/// Best TTL evidence available: a value already captured by the engine, or
/// one ICMP echo when raw sockets allow it. Connect scans on an
/// unprivileged host simply have none.
async fn observed_ttl(
    ctx: &ScanContext,
    caps: &Capabilities,
    results: &[ProbeResult],
) -> Option<u8> {
    if let Some(ttl) = results.iter().find_map(|r| r.ttl) {
        return Some(ttl);
    }
    if !caps.raw_socket {
        return None;
    }
    let IpAddr::V4(target) = ctx.ip else {
        return None;
    };
    half_open::icmp_ttl_probe(target, ctx.timing.current()).await
}

/// Second pass over open ports: banner fingerprinting, TLS and HTTP layers,
/// CVE correlation. Fanned out under the same worker ceiling as the probes
/// themselves.
async fn enrich_results(ctx: &Arc<ScanContext>, results: &mut Vec<ProbeResult>) {
    let wanted =
        ctx.config.service_detection || ctx.config.tls_analysis || ctx.config.http_analysis;
    if !wanted {
        results.sort_by_key(|r| r.port);
        return;
    }

    let (open, rest): (Vec<_>, Vec<_>) = std::mem::take(results)
        .into_iter()
        .partition(|r| r.state == PortState::Open);
    if open.is_empty() {
        *results = rest;
        results.sort_by_key(|r| r.port);
        return;
    }
    debug!("[Scanner] Enriching {} open ports on {}", open.len(), ctx.ip);

    let limit = ctx.config.concurrency;
    let gauge = Arc::clone(&ctx.gauge);
    let task_ctx = Arc::clone(ctx);
    let mut enriched = fan_out(limit, gauge, open, move |result| {
        let ctx = Arc::clone(&task_ctx);
        async move { enrich_port(&ctx, result).await }
    })
    .await;

    enriched.extend(rest);
    enriched.sort_by_key(|r| r.port);
    *results = enriched;
}

async fn enrich_port(ctx: &ScanContext, mut result: ProbeResult) -> ProbeResult {
    if ctx.config.service_detection {
        service_fingerprint_pass(ctx, &mut result).await;
    }

    let service_name = result.service.as_ref().map(|s| s.name.clone());

    if ctx.config.tls_analysis
        && http_probe::is_tls_candidate(result.port, service_name.as_deref())
    {
        result.tls = tls_probe::probe(ctx.ip, &ctx.host, result.port).await;
    }

    if ctx.config.http_analysis
        && http_probe::is_http_candidate(result.port, service_name.as_deref())
    {
        if let Some(http) = http_probe::analyze(ctx.ip, &ctx.host, result.port).await {
            if let Some(service) = result.service.as_mut() {
                if let Some(server) = http.server.as_deref() {
                    apply_server_header(service, server);
                }
                let bumped = service.confidence.saturating_add(HTTP_CONFIRM_BONUS);
                service.raise_confidence(bumped);
            }
            result.http = Some(http);
        }
    }

    if let Some(service) = result.service.as_mut() {
        if let Some(version) = service.version.clone() {
            service.vulnerabilities = vulns::correlate(&service.name, &version);
        }
    }
    result
}

/// Identify the service behind one open port from its banner. A stored
/// banner from the probing engine is reused; otherwise the port's template
/// probe goes out. Pattern hits overwrite the port-number guess; the
/// generic keyword table only fills in where no dedicated fingerprint
/// exists for the port.
async fn service_fingerprint_pass(ctx: &ScanContext, result: &mut ProbeResult) {
    let port = result.port;
    let service = result.service.get_or_insert_with(|| {
        ServiceFinding::new(
            fingerprints::default_service_name(port),
            PORT_GUESS_CONFIDENCE,
        )
    });

    if service.banner.is_none() {
        if let Some(banner) = fingerprints::probe_banner(ctx.ip, &ctx.host, port).await {
            service.banner = Some(clip_text(&banner, BANNER_MAX));
        }
    }
    let Some(banner) = service.banner.clone() else {
        return;
    };

    if let Some(hit) = fingerprints::match_patterns(port, &banner) {
        service.name = hit.label.to_string();
        if hit.version.is_some() {
            service.version = hit.version;
        }
        service.raise_confidence(hit.confidence);
    } else if !fingerprints::has_fingerprint(port) {
        if let Some(keyword) = fingerprints::keyword_service(&banner) {
            service.name = keyword.to_string();
            service.raise_confidence(PORT_GUESS_CONFIDENCE);
        }
    }
}

/// A `Server: product/version` header names the software more directly than
/// any banner guess, but an existing fingerprinted version still wins.
fn apply_server_header(service: &mut ServiceFinding, header: &str) {
    if service.version.is_some() {
        return;
    }
    let product = header.split_whitespace().next().unwrap_or(header);
    match product.split_once('/') {
        Some((name, version)) if !name.is_empty() => {
            service.name = name.to_string();
            if !version.is_empty() {
                service.version = Some(version.to_string());
            }
        }
        _ => {
            if !product.is_empty() {
                service.name = product.to_string();
            }
        }
    }
}

/// Fold classified results into the host report. Ambiguous open|filtered
/// results stay in the detailed list with their own state tag; closed and
/// filtered port numbers are listed only on request because wide scans
/// would otherwise bury the findings.
fn seal(host: &mut HostInfo, results: Vec<ProbeResult>, config: &ScanConfig) {
    let mut open = Vec::new();
    for result in results {
        match result.state {
            PortState::Open | PortState::OpenFiltered => open.push(result),
            PortState::Closed => {
                if config.show_closed {
                    host.closed_ports.push(result.port);
                }
            }
            PortState::Filtered => {
                if config.show_filtered {
                    host.filtered_ports.push(result.port);
                }
            }
            PortState::Error => {}
        }
    }
    host.closed_ports.sort_unstable();
    host.closed_ports.dedup();
    host.filtered_ports.sort_unstable();
    host.filtered_ports.dedup();

    let timed: Vec<f64> = open
        .iter()
        .filter(|r| r.response_time > 0.0)
        .map(|r| r.response_time)
        .collect();
    if !timed.is_empty() {
        host.avg_response_time = timed.iter().sum::<f64>() / timed.len() as f64;
    }

    open.sort_by_key(|r| r.port);
    host.open_ports = open;
    host.last_seen = Utc::now();
}
