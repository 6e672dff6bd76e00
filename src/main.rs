use clap::Parser;
use colored::Colorize;
use log::{error, info};
use std::io::{self, Read};
use std::process;

mod capability;
mod device;
mod dispatch;
mod engines;
mod fingerprints;
mod half_open;
mod http_probe;
mod models;
mod protocol;
mod resolver;
mod scanner;
mod timing;
mod tls_probe;
mod vulns;

use protocol::{Envelope, Request};

/// Network reconnaissance engine speaking JSON over stdin/stdout
#[derive(Parser)]
#[clap(name = "portrecon", version, about, long_about = None)]
struct Args {
    /// Enable debug-level logging on stderr
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    // The help guide bypasses the stdin protocol entirely and must work
    // even with a bare `help` word, the way operators actually call it.
    if std::env::args()
        .skip(1)
        .any(|arg| arg == "--help" || arg == "-h" || arg == "help")
    {
        print_help();
        process::exit(0);
    }

    let args = Args::parse();
    setup_logging(args.verbose);

    let envelope = match read_request() {
        Ok(request) => execute(request).await,
        Err(message) => {
            error!("[Main] {}", message);
            Envelope::failed(message)
        }
    };

    // Everything except the envelope goes to stderr; stdout carries exactly
    // one JSON document per invocation.
    match serde_json::to_string_pretty(&envelope) {
        Ok(body) => println!("{}", body),
        Err(e) => {
            error!("[Main] Could not serialize response: {}", e);
            process::exit(1);
        }
    }
    process::exit(if envelope.success { 0 } else { 1 });
}

async fn execute(request: Request) -> Envelope {
    if request.target.trim().is_empty() {
        return Envelope::failed("No target specified".to_string());
    }

    let (config, ports) = match request.params.build() {
        Ok(built) => built,
        Err(e) => return Envelope::failed(e.to_string()),
    };

    info!(
        "[Main] Scanning {} across {} ports",
        request.target,
        ports.len()
    );
    match scanner::run(&request.target, ports, config).await {
        Ok(report) => Envelope::completed(report),
        Err(e) => {
            error!("[Main] Scan failed: {}", e);
            Envelope::failed(e.to_string())
        }
    }
}

fn read_request() -> Result<Request, String> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| format!("Failed to read stdin: {}", e))?;
    if input.trim().is_empty() {
        return Err("No request document on stdin".to_string());
    }
    serde_json::from_str(&input).map_err(|e| format!("Invalid request document: {}", e))
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().default_filter_or(default_level);
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .init();
}

fn print_help() {
    let title = format!(
        "portrecon v{} - Complete Help Guide",
        env!("CARGO_PKG_VERSION")
    );
    println!(
        "{}",
        "╔═══════════════════════════════════════════════════════════════════╗".cyan()
    );
    println!("{}", format!("║{:^67}║", title).cyan());
    println!(
        "{}",
        "╚═══════════════════════════════════════════════════════════════════╝".cyan()
    );
    println!(
        r#"
DESCRIPTION:
  Network reconnaissance with intelligent engine selection, service and
  version detection, OS fingerprinting, device recognition, and CVE
  correlation. Reads one JSON request from stdin, writes one JSON report
  to stdout; progress and logs go to stderr.

CAPABILITY TIERS:
  • basic:    TCP connect scanning (always available)
  • standard: + raw-socket SYN scanning or nmap integration
  • advanced: + both raw sockets and nmap
  • elite:    + masscan for ultra-fast sweeps

PARAMETERS:
  engine          Scan engine: auto, connect, syn, nmap, masscan
                  Default: auto (capability and volume aware)

  ports           Port specification
                  Presets: quick, top-20, top-100, top-1000, web,
                           database, mail, common, well-known, all
                  Custom: "80,443,8080" or "1-1000" or "80,443,8000-9000"
                  Default: top-20

  threads         Concurrent workers (1-500)
                  Default: 100

  timeout         Base probe timeout in seconds
                  Default: 1.0 (adapts to observed latency)

  rate_limit      Probes per second (0 = unlimited)
                  Default: 0

  rate            Packet rate handed to masscan
                  Default: 1000

  service_detection    Identify services and versions     Default: true
  http_analysis        Analyze HTTP/HTTPS services        Default: true
  tls_analysis         Inspect TLS certificates           Default: true
  os_detection         OS fingerprinting                  Default: false
  dns_lookup           Reverse DNS enumeration            Default: true
  mac_lookup           MAC vendor lookup (local net only) Default: true
  show_closed          Include closed ports in output     Default: false
  show_filtered        Include filtered ports in output   Default: false

INPUT PROTOCOL:
  One request document on stdin:

    {{"target": "<host|ip|cidr|octet-range>", "params": {{ ... }}}}

  One response envelope on stdout:

    {{"success": true|false, "data": <report>|null, "errors": [...]}}

  Exit code 0 on success, non-zero on failure.

EXAMPLES:
  1. Quick scan of common ports:
     echo '{{"target": "example.com", "params": {{"ports": "quick"}}}}' | portrecon

  2. Full web stack analysis:
     echo '{{"target": "webapp.com", "params": {{"ports": "web"}}}}' | portrecon

  3. Half-open scan of the first thousand ports (requires root):
     echo '{{"target": "target.lan", "params": {{"engine": "syn", "ports": "top-1000"}}}}' | portrecon

  4. Ultra-fast subnet sweep:
     echo '{{"target": "192.168.1.0/24", "params": {{"engine": "masscan", "ports": "all", "rate": 10000}}}}' | portrecon

FEATURES:
  ✓ Four scan engines with deterministic capability fallback
  ✓ Adaptive timeout tuned from observed response latency
  ✓ Banner fingerprints with version capture for 18 protocols
  ✓ HTTP technology stack identification (20+ technologies)
  ✓ TLS certificate chain and cipher inspection
  ✓ OS fingerprinting (TTL and service evidence combined)
  ✓ Device type recognition from MAC vendor and open services
  ✓ CVE correlation against known vulnerable versions
  ✓ Reverse DNS enumeration
  ✓ Global rate limiting and bounded concurrency

DEVICE TYPES DETECTED:
  • Network Device (Cisco, Juniper, Fortinet, ...)
  • Server (Dell, HP, Supermicro, IBM)
  • Virtual Machine (VMware, Xen, KVM, VirtualBox)
  • IoT/Embedded (Raspberry Pi, Espressif, Arduino)
  • End-User Device (Apple, Samsung, Lenovo)
  • Windows Server/Workstation
  • Linux Server

OS DETECTION:
  • Linux/Unix (TTL ≤ 64, OpenSSH services)
  • Windows (TTL ≤ 128, SMB/RDP services)
  • Network Device (TTL ≤ 255, vendor services)

VULNERABILITY MAPPING:
  Service versions are correlated against known CVEs, for example
  Apache 2.4.49 -> CVE-2021-41773. Each finding carries its NVD URL.

NOTES:
  • SYN scanning and ICMP TTL probing require raw socket privilege
  • masscan and nmap engines need the binaries on PATH
  • MAC lookup reads the kernel ARP table, so local network only
  • An unknown engine name degrades to automatic selection
  • Always scan with proper authorization
"#
    );
}
