use std::collections::HashMap;

use lazy_static::lazy_static;
use log::debug;

use crate::models::VulnerabilityRecord;

const NVD_URL: &str = "https://nvd.nist.gov/vuln/detail";

lazy_static! {
    /// Exact "{product} {version}" to CVE-id mapping. Correlation of
    /// already-identified versions, not a vulnerability feed.
    static ref CVE_DATABASE: HashMap<&'static str, &'static [&'static str]> = {
        let mut db: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
        db.insert("Apache 2.4.49", &["CVE-2021-41773", "CVE-2021-42013"][..]);
        db.insert("Apache 2.4.50", &["CVE-2021-42013"][..]);
        db.insert(
            "Apache 2.4.44",
            &["CVE-2020-9490", "CVE-2020-11984", "CVE-2020-11993"][..],
        );
        db.insert("Apache 2.4.48", &["CVE-2019-17567"][..]);
        db.insert("OpenSSH 7.4", &["CVE-2018-15473"][..]);
        db.insert("OpenSSH 7.7", &["CVE-2018-15919"][..]);
        db.insert("OpenSSH 7.9p1", &["CVE-2019-6110", "CVE-2019-6111"][..]);
        db.insert("OpenSSH 8.5", &["CVE-2021-28041"][..]);
        db.insert("OpenSSH 9.3p2", &["CVE-2023-38408"][..]);
        db.insert("nginx 1.6.2", &["CVE-2014-3616"][..]);
        db.insert(
            "nginx 1.9.10",
            &["CVE-2016-0742", "CVE-2016-0746", "CVE-2016-0747"][..],
        );
        db.insert("nginx 1.20.0", &["CVE-2021-23017"][..]);
        db.insert("MySQL 5.7.31", &["CVE-2018-2562", "CVE-2020-2574"][..]);
        db.insert("MySQL 8.0.22", &["CVE-2020-2578", "CVE-2020-2621"][..]);
        db.insert("MariaDB 10.2.36", &["CVE-2021-27928"][..]);
        db.insert("PostgreSQL 13.4", &["CVE-2021-32027", "CVE-2021-32028"][..]);
        db.insert("Redis 5.0.7", &["CVE-2020-14147"][..]);
        db.insert("MongoDB 4.0.12", &["CVE-2019-2386", "CVE-2019-2389"][..]);
        db.insert("Elasticsearch 7.9.0", &["CVE-2020-7019"][..]);
        db.insert("PHP 7.4.28", &["CVE-2021-21708"][..]);
        db.insert("PHP 8.0.30", &["CVE-2023-3824"][..]);
        // Heartbleed
        db.insert("OpenSSL 1.0.1g", &["CVE-2014-0160"][..]);
        db.insert("OpenSSL 1.0.2k", &["CVE-2017-3731", "CVE-2017-3732"][..]);
        db
    };
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Look up known CVEs for an identified service version.
///
/// Database keys use each product's canonical capitalization, while service
/// labels arrive in several shapes ("Apache HTTP Server", "nginx", "ssh").
/// Three candidate keys cover them: the label as-is, title-cased, and the
/// label's leading word. First database hit wins.
pub fn correlate(service: &str, version: &str) -> Vec<VulnerabilityRecord> {
    if service.is_empty() || version.is_empty() {
        return Vec::new();
    }

    let mut candidates = vec![
        format!("{} {}", service, version),
        format!("{} {}", title_case(service), version),
    ];
    if let Some(first_word) = service.split_whitespace().next() {
        if first_word != service {
            candidates.push(format!("{} {}", first_word, version));
        }
    }

    for key in &candidates {
        if let Some(cves) = CVE_DATABASE.get(key.as_str()) {
            debug!("[Vulns] {} matched {} CVE(s)", key, cves.len());
            return cves
                .iter()
                .map(|id| VulnerabilityRecord {
                    id: id.to_string(),
                    url: format!("{}/{}", NVD_URL, id),
                })
                .collect();
        }
    }
    Vec::new()
}
