use std::io::Write;
use std::net::TcpListener;
use std::process::{Command, Output, Stdio};

use serde_json::{json, Value};

fn run_with_stdin(input: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_portrecon"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("binary should spawn");
    child
        .stdin
        .as_mut()
        .expect("stdin is piped")
        .write_all(input.as_bytes())
        .expect("request should be written");
    child.wait_with_output().expect("binary should finish")
}

fn envelope_from(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout must carry exactly one JSON document: {}\nstdout: {}\nstderr: {}",
            e,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn help_flag_prints_guide_and_exits_zero() {
    for flag in ["--help", "-h", "help"] {
        let output = Command::new(env!("CARGO_BIN_EXE_portrecon"))
            .arg(flag)
            .output()
            .expect("binary should run");
        assert!(output.status.success(), "{} must exit 0", flag);
        let text = String::from_utf8_lossy(&output.stdout);
        assert!(text.contains("PARAMETERS"), "{} must print the guide", flag);
        assert!(text.contains("INPUT PROTOCOL"));
        assert!(text.contains("engine"));
    }
}

#[test]
fn malformed_stdin_yields_failure_envelope_and_nonzero_exit() {
    let output = run_with_stdin("this is not a json document");
    assert!(!output.status.success());

    let envelope = envelope_from(&output);
    assert_eq!(envelope["success"], json!(false));
    assert!(envelope["data"].is_null());
    let errors = envelope["errors"].as_array().expect("errors array");
    assert!(!errors.is_empty());
}

#[test]
fn empty_stdin_is_a_failure() {
    let output = run_with_stdin("");
    assert!(!output.status.success());

    let envelope = envelope_from(&output);
    assert_eq!(envelope["success"], json!(false));
    assert!(envelope["data"].is_null());
}

#[test]
fn useless_port_expression_is_a_failure() {
    let request = json!({
        "target": "127.0.0.1",
        "params": {"ports": "abc,def"}
    });
    let output = run_with_stdin(&request.to_string());
    assert!(!output.status.success());

    let envelope = envelope_from(&output);
    assert_eq!(envelope["success"], json!(false));
    let message = envelope["errors"][0].as_str().expect("error message");
    assert!(message.contains("no valid ports"), "got: {}", message);
}

#[test]
fn missing_target_is_a_failure() {
    let output = run_with_stdin(r#"{"target": "", "params": {}}"#);
    assert!(!output.status.success());

    let envelope = envelope_from(&output);
    assert_eq!(envelope["success"], json!(false));
    assert!(envelope["data"].is_null());
}

#[test]
fn loopback_connect_scan_reports_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let open_port = listener.local_addr().unwrap().port();
    let closed_port = {
        let tmp = TcpListener::bind("127.0.0.1:0").expect("bind probe");
        tmp.local_addr().unwrap().port()
    };

    // Detection passes are off so the scan stays deterministic and quick.
    let request = json!({
        "target": "127.0.0.1",
        "params": {
            "engine": "connect",
            "ports": format!("{},{}", open_port, closed_port),
            "service_detection": false,
            "http_analysis": false,
            "tls_analysis": false,
            "dns_lookup": false,
            "mac_lookup": false,
            "show_closed": true,
            "show_filtered": true
        }
    });
    let output = run_with_stdin(&request.to_string());
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let envelope = envelope_from(&output);
    assert_eq!(envelope["success"], json!(true));
    assert!(envelope["errors"].as_array().unwrap().is_empty());

    let host = &envelope["data"]["host_info"];
    assert_eq!(host["ip"], json!("127.0.0.1"));

    let open_ports = host["open_ports"].as_array().expect("open_ports array");
    assert_eq!(open_ports.len(), 1);
    assert_eq!(open_ports[0]["port"], json!(open_port));
    assert_eq!(open_ports[0]["state"], json!("open"));
    assert_eq!(open_ports[0]["protocol"], json!("tcp"));

    let closed = host["closed_ports"].as_array().unwrap();
    let filtered = host["filtered_ports"].as_array().unwrap();
    assert!(
        closed.contains(&json!(closed_port)) || filtered.contains(&json!(closed_port)),
        "released port must be closed or filtered"
    );

    let stats = &envelope["data"]["scan_stats"];
    assert_eq!(stats["scan_type"], json!("connect"));
    assert_eq!(stats["ports_scanned"], json!(2));
    assert!(stats["duration"].as_f64().unwrap() > 0.0);

    let summary = &envelope["data"]["summary"];
    assert_eq!(summary["total_ports"], json!(2));
    assert_eq!(summary["open_ports"], json!(1));
}

#[test]
fn unresolvable_target_is_a_failure() {
    // The .invalid TLD is reserved to never resolve.
    let request = json!({
        "target": "no-such-host.invalid",
        "params": {"engine": "connect", "ports": "80", "dns_lookup": false}
    });
    let output = run_with_stdin(&request.to_string());
    assert!(!output.status.success());

    let envelope = envelope_from(&output);
    assert_eq!(envelope["success"], json!(false));
    assert!(envelope["data"].is_null());
    let message = envelope["errors"][0].as_str().expect("error message");
    assert!(message.contains("resolve"), "got: {}", message);
}
