use std::str::FromStr;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::models::{parse_port_expression, EnginePreference, ParseError, ScanConfig, MAX_WORKERS};
use crate::scanner::ScanReport;

const DEFAULT_PORTS: &str = "top-20";

/// One scan request, as the module framework delivers it on stdin.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub target: String,
    #[serde(default)]
    pub params: Params,
}

/// Caller-tunable knobs. Every field is optional; anything absent keeps the
/// engine default from `ScanConfig`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Params {
    pub engine: Option<String>,
    pub ports: Option<String>,
    #[serde(alias = "concurrency")]
    pub threads: Option<usize>,
    /// Base probe timeout in seconds.
    pub timeout: Option<f64>,
    /// Probes per second across the whole run, 0 disables limiting.
    pub rate_limit: Option<u32>,
    /// Packet rate handed through to masscan.
    pub rate: Option<u32>,
    pub service_detection: Option<bool>,
    pub http_analysis: Option<bool>,
    pub tls_analysis: Option<bool>,
    pub os_detection: Option<bool>,
    pub dns_lookup: Option<bool>,
    pub mac_lookup: Option<bool>,
    pub show_closed: Option<bool>,
    pub show_filtered: Option<bool>,
}

impl Params {
    /// Materialize the runtime configuration and port list.
    ///
    /// A port expression yielding nothing is the only fatal outcome here.
    /// Out-of-range numbers clamp and an unknown engine name degrades to
    /// automatic selection, because a misspelled knob should not kill a
    /// scan that can still run.
    pub fn build(&self) -> Result<(ScanConfig, Vec<u16>), ParseError> {
        let mut config = ScanConfig::default();

        if let Some(engine) = self.engine.as_deref() {
            match EnginePreference::from_str(engine) {
                Ok(preference) => config.engine = preference,
                Err(e) => warn!("[Params] {}, using automatic selection", e),
            }
        }
        if let Some(threads) = self.threads {
            config.concurrency = threads.clamp(1, MAX_WORKERS);
        }
        if let Some(timeout) = self.timeout {
            config.base_timeout = Duration::from_secs_f64(timeout.clamp(0.05, 60.0));
        }
        if let Some(rate_limit) = self.rate_limit {
            config.rate_limit = rate_limit;
        }
        if let Some(rate) = self.rate {
            config.masscan_rate = rate.max(1);
        }
        if let Some(v) = self.service_detection {
            config.service_detection = v;
        }
        if let Some(v) = self.http_analysis {
            config.http_analysis = v;
        }
        if let Some(v) = self.tls_analysis {
            config.tls_analysis = v;
        }
        if let Some(v) = self.os_detection {
            config.os_detection = v;
        }
        if let Some(v) = self.dns_lookup {
            config.dns_lookup = v;
        }
        if let Some(v) = self.mac_lookup {
            config.mac_lookup = v;
        }
        if let Some(v) = self.show_closed {
            config.show_closed = v;
        }
        if let Some(v) = self.show_filtered {
            config.show_filtered = v;
        }

        let ports = parse_port_expression(self.ports.as_deref().unwrap_or(DEFAULT_PORTS))?;
        Ok((config, ports))
    }
}

/// Response document written to stdout. `data` is serialized even when null
/// so callers can mechanically tell "no report" from an empty one.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub data: Option<ScanReport>,
    pub errors: Vec<String>,
}

impl Envelope {
    pub fn completed(report: ScanReport) -> Self {
        Envelope {
            success: true,
            data: Some(report),
            errors: Vec::new(),
        }
    }

    pub fn failed(message: String) -> Self {
        Envelope {
            success: false,
            data: None,
            errors: vec![message],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EngineKind;

    #[test]
    fn test_defaults_when_params_absent() {
        let request: Request = serde_json::from_str(r#"{"target": "10.0.0.1"}"#).unwrap();
        assert_eq!(request.target, "10.0.0.1");

        let (config, ports) = request.params.build().unwrap();
        assert_eq!(config.engine, EnginePreference::Auto);
        assert_eq!(config.concurrency, 100);
        assert_eq!(config.base_timeout, Duration::from_secs(1));
        assert!(config.service_detection);
        assert!(!config.os_detection);
        assert!(!config.show_closed);
        // The default port set is the top-20 preset.
        assert_eq!(ports.len(), 20);
        assert!(ports.contains(&443));
    }

    #[test]
    fn test_thread_count_clamps_to_ceiling() {
        let params: Params = serde_json::from_str(r#"{"threads": 9000}"#).unwrap();
        let (config, _) = params.build().unwrap();
        assert_eq!(config.concurrency, MAX_WORKERS);

        let params: Params = serde_json::from_str(r#"{"threads": 0}"#).unwrap();
        let (config, _) = params.build().unwrap();
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn test_concurrency_alias_accepted() {
        let params: Params = serde_json::from_str(r#"{"concurrency": 32}"#).unwrap();
        assert_eq!(params.threads, Some(32));
    }

    #[test]
    fn test_unknown_engine_degrades_to_auto() {
        let params: Params = serde_json::from_str(r#"{"engine": "warp-drive"}"#).unwrap();
        let (config, _) = params.build().unwrap();
        assert_eq!(config.engine, EnginePreference::Auto);

        let params: Params = serde_json::from_str(r#"{"engine": "syn"}"#).unwrap();
        let (config, _) = params.build().unwrap();
        assert_eq!(config.engine, EnginePreference::Pinned(EngineKind::Syn));
    }

    #[test]
    fn test_timeout_clamped_to_sane_range() {
        let params: Params = serde_json::from_str(r#"{"timeout": 0.0}"#).unwrap();
        let (config, _) = params.build().unwrap();
        assert_eq!(config.base_timeout, Duration::from_secs_f64(0.05));

        let params: Params = serde_json::from_str(r#"{"timeout": 600.0}"#).unwrap();
        let (config, _) = params.build().unwrap();
        assert_eq!(config.base_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_masscan_rate_is_independent_of_rate_limit() {
        let params: Params =
            serde_json::from_str(r#"{"rate": 50000, "rate_limit": 200}"#).unwrap();
        let (config, _) = params.build().unwrap();
        assert_eq!(config.masscan_rate, 50_000);
        assert_eq!(config.rate_limit, 200);
    }

    #[test]
    fn test_useless_port_expression_is_fatal() {
        let params: Params = serde_json::from_str(r#"{"ports": "abc,def"}"#).unwrap();
        assert!(matches!(params.build(), Err(ParseError::EmptyPortSet(_))));
    }

    #[test]
    fn test_failure_envelope_serializes_null_data() {
        let body = serde_json::to_value(Envelope::failed("boom".to_string())).unwrap();
        assert_eq!(body["success"], serde_json::json!(false));
        assert!(body["data"].is_null());
        assert_eq!(body["errors"][0], serde_json::json!("boom"));
    }
}
