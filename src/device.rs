use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use lazy_static::lazy_static;
use log::debug;

use crate::fingerprints::default_service_name;
use crate::models::{PortState, ProbeResult};

lazy_static! {
    /// MAC organizational prefix to vendor name. Covers the gear actually
    /// seen on assessment networks, not the full IEEE registry.
    static ref OUI_VENDORS: HashMap<&'static str, &'static str> = {
        let mut db = HashMap::new();
        // Network equipment
        db.insert("00:00:0C", "Cisco Systems");
        db.insert("00:01:42", "Cisco Systems");
        db.insert("00:01:43", "Cisco Systems");
        db.insert("00:01:63", "Cisco Systems");
        db.insert("00:05:85", "Juniper Networks");
        db.insert("00:0F:EA", "Juniper Networks");
        db.insert("00:19:E2", "Juniper Networks");
        db.insert("00:0B:86", "Hewlett Packard Enterprise");
        db.insert("00:11:0A", "Hewlett Packard Enterprise");
        db.insert("00:1C:73", "Arista Networks");
        db.insert("00:15:6D", "Ubiquiti Networks");
        db.insert("00:27:22", "Ubiquiti Networks");
        db.insert("00:0C:42", "MikroTik");
        db.insert("00:09:0F", "Fortinet");
        db.insert("00:1B:17", "Palo Alto Networks");
        db.insert("00:09:5B", "NETGEAR");
        db.insert("00:05:5F", "D-Link");
        db.insert("00:03:2F", "Linksys");
        db.insert("00:14:BF", "Linksys");
        // Servers and enterprise
        db.insert("00:06:5B", "Dell");
        db.insert("00:14:22", "Dell");
        db.insert("00:1A:A0", "Dell");
        db.insert("00:25:90", "Super Micro Computer");
        db.insert("00:02:55", "IBM");
        db.insert("00:0E:7F", "IBM");
        db.insert("3C:4A:92", "Hewlett Packard");
        db.insert("00:17:A4", "Hewlett Packard");
        // Virtualization
        db.insert("00:05:69", "VMware");
        db.insert("00:0C:29", "VMware");
        db.insert("00:50:56", "VMware");
        db.insert("00:1C:14", "VMware");
        db.insert("00:16:3E", "Xen/XenSource");
        db.insert("00:15:5D", "Microsoft Hyper-V");
        db.insert("08:00:27", "Oracle VirtualBox");
        db.insert("52:54:00", "KVM/QEMU");
        // Cloud providers
        db.insert("02:42:AC", "Docker Container");
        db.insert("02:50:00", "Google Cloud");
        db.insert("3C:5A:B4", "Google Cloud");
        db.insert("00:1A:11", "Amazon AWS");
        db.insert("06:00:00", "Microsoft Azure");
        // Computing
        db.insert("00:02:B3", "Intel");
        db.insert("00:0E:0C", "Intel");
        db.insert("00:E0:4C", "Realtek");
        db.insert("00:0A:F7", "Broadcom");
        db.insert("00:1B:21", "Broadcom");
        db.insert("00:02:C9", "Mellanox");
        db.insert("00:0E:1E", "QLogic");
        // Mobile and consumer
        db.insert("00:03:93", "Apple");
        db.insert("00:0A:95", "Apple");
        db.insert("00:1C:B3", "Apple");
        db.insert("28:CF:E9", "Apple");
        db.insert("F0:18:98", "Apple");
        db.insert("00:07:AB", "Samsung Electronics");
        db.insert("00:1D:25", "Samsung Electronics");
        db.insert("AC:5F:3E", "Samsung Electronics");
        db.insert("00:01:64", "Lenovo");
        db.insert("00:21:5C", "Lenovo");
        db.insert("00:01:80", "ASUSTek");
        db.insert("00:1A:92", "ASUSTek");
        db.insert("00:01:24", "Acer");
        db.insert("00:21:27", "Acer");
        // IoT and embedded
        db.insert("B8:27:EB", "Raspberry Pi Foundation");
        db.insert("DC:A6:32", "Raspberry Pi Trading");
        db.insert("24:0A:C4", "Espressif (ESP32/ESP8266)");
        db.insert("30:AE:A4", "Espressif");
        db.insert("CC:50:E3", "Espressif");
        db.insert("00:1B:63", "Arduino");
        // Industrial control
        db.insert("00:80:F4", "Telemecanique");
        db.insert("00:00:BC", "Allen-Bradley");
        db.insert("00:30:F3", "Schneider Electric");
        db.insert("00:06:29", "Siemens");
        db.insert("00:50:7F", "Siemens");
        db
    };
}

/// Vendor for a MAC address by organizational prefix.
pub fn lookup_vendor(mac: &str) -> String {
    if mac.len() < 8 {
        return "Unknown Vendor".to_string();
    }
    let oui = mac[..8].to_uppercase();
    OUI_VENDORS
        .get(oui.as_str())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "Unknown Vendor".to_string())
}

/// Find a neighbor's MAC in kernel ARP table text (/proc/net/arp layout).
/// Scanning the target beforehand is what populates the cache, so this runs
/// after the probe phase.
pub fn parse_arp_table(content: &str, ip: IpAddr) -> Option<String> {
    let needle = ip.to_string();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] != needle {
            continue;
        }
        let flags = fields[2];
        let mac = fields[3];
        // 0x0 marks an incomplete entry; an all-zero MAC means the same.
        if flags == "0x0" || mac == "00:00:00:00:00:00" {
            continue;
        }
        return Some(mac.to_string());
    }
    None
}

/// MAC lookup against the live kernel ARP cache. Only meaningful for
/// targets on a directly attached network.
pub fn arp_lookup(ip: IpAddr) -> Option<String> {
    let content = std::fs::read_to_string("/proc/net/arp").ok()?;
    let mac = parse_arp_table(&content, ip);
    if let Some(mac) = &mac {
        debug!("[Device] ARP cache has {} at {}", ip, mac);
    }
    mac
}

fn open_service_view(results: &[ProbeResult]) -> (HashSet<String>, HashSet<u16>) {
    let mut names = HashSet::new();
    let mut ports = HashSet::new();
    for r in results {
        if r.state != PortState::Open {
            continue;
        }
        ports.insert(r.port);
        names.insert(default_service_name(r.port).to_lowercase());
        if let Some(service) = &r.service {
            names.insert(service.name.to_lowercase());
        }
    }
    (names, ports)
}

fn has_openssh(results: &[ProbeResult]) -> bool {
    results.iter().any(|r| {
        r.state == PortState::Open
            && r.service.as_ref().map_or(false, |s| {
                s.name.contains("OpenSSH")
                    || s.banner.as_deref().unwrap_or("").contains("OpenSSH")
            })
    })
}

/// Combine TTL and service evidence into an OS family guess.
///
/// Each signal carries its own confidence; the highest wins, and a service
/// signal displaces a TTL signal of equal confidence because it is the more
/// specific observation.
pub fn infer_os(ttl: Option<u8>, results: &[ProbeResult]) -> (Option<String>, u8) {
    let mut best: Option<(String, u8)> = ttl.map(|ttl| {
        let family = if ttl <= 64 {
            "Linux/Unix"
        } else if ttl <= 128 {
            "Windows"
        } else {
            "Cisco/Network Device"
        };
        (family.to_string(), 60)
    });

    let (names, ports) = open_service_view(results);
    let mut service_signals: Vec<(&str, u8)> = Vec::new();
    if names.contains("microsoft-ds") || names.contains("ms-wbt-server") || ports.contains(&445)
    {
        service_signals.push(("Windows", 80));
    }
    if has_openssh(results) {
        service_signals.push(("Linux/Unix", 70));
    }

    for (family, confidence) in service_signals {
        let replace = match &best {
            Some((_, current)) => confidence >= *current,
            None => true,
        };
        if replace {
            best = Some((family.to_string(), confidence));
        }
    }

    match best {
        Some((family, confidence)) => (Some(family), confidence),
        None => (None, 0),
    }
}

/// Classify the host into a coarse device category from vendor keywords and
/// the open service set. Vendor may be absent; the service rules still
/// apply.
pub fn infer_device_type(vendor: Option<&str>, results: &[ProbeResult]) -> Option<String> {
    let vendor_lower = vendor.unwrap_or("").to_lowercase();
    let mut device: Option<&str> = None;

    if !vendor_lower.is_empty() {
        let matches = |keys: &[&str]| keys.iter().any(|k| vendor_lower.contains(k));
        if matches(&["cisco", "juniper", "arista", "mikrotik", "fortinet"]) {
            device = Some("Network Device");
        } else if matches(&["dell", "hp", "hewlett", "super micro", "ibm"]) {
            device = Some("Server");
        } else if matches(&["vmware", "xen", "virtualbox", "kvm"]) {
            device = Some("Virtual Machine");
        } else if matches(&["raspberry", "espressif", "arduino"]) {
            device = Some("IoT/Embedded Device");
        } else if matches(&["apple", "samsung", "lenovo", "asus", "acer"]) {
            device = Some("End-User Device");
        }
    }

    // Service evidence is stronger than a vendor prefix and overrides it.
    let (names, ports) = open_service_view(results);
    if names.contains("microsoft-ds") || ports.contains(&3389) {
        device = Some("Windows Server/Workstation");
    } else if (names.contains("ssh") || ports.contains(&22))
        && [80, 443, 3306, 5432].iter().any(|p| ports.contains(p))
    {
        device = Some("Linux Server");
    }

    device.map(|d| d.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngineKind, ServiceFinding};

    fn open_port(port: u16, service: Option<&str>) -> ProbeResult {
        let mut r = ProbeResult::new(port, PortState::Open, EngineKind::Connect);
        if let Some(name) = service {
            r.service = Some(ServiceFinding::new(name.to_string(), 70));
        }
        r
    }

    #[test]
    fn test_ttl_buckets() {
        assert_eq!(
            infer_os(Some(64), &[]),
            (Some("Linux/Unix".to_string()), 60)
        );
        assert_eq!(infer_os(Some(57), &[]), (Some("Linux/Unix".to_string()), 60));
        assert_eq!(infer_os(Some(128), &[]), (Some("Windows".to_string()), 60));
        assert_eq!(infer_os(Some(110), &[]), (Some("Windows".to_string()), 60));
        assert_eq!(
            infer_os(Some(255), &[]),
            (Some("Cisco/Network Device".to_string()), 60)
        );
        assert_eq!(
            infer_os(Some(140), &[]),
            (Some("Cisco/Network Device".to_string()), 60)
        );
        assert_eq!(infer_os(None, &[]), (None, 0));
    }

    #[test]
    fn test_windows_services_beat_ttl() {
        let results = vec![open_port(445, None)];
        let (family, confidence) = infer_os(Some(64), &results);
        assert_eq!(family.as_deref(), Some("Windows"));
        assert_eq!(confidence, 80);
    }

    #[test]
    fn test_openssh_banner_beats_conflicting_ttl() {
        let mut ssh = open_port(22, Some("OpenSSH"));
        if let Some(s) = &mut ssh.service {
            s.version = Some("8.9p1".to_string());
        }
        // TTL says Windows at 60, the SSH evidence says Unix at 70.
        let (family, confidence) = infer_os(Some(110), &[ssh]);
        assert_eq!(family.as_deref(), Some("Linux/Unix"));
        assert_eq!(confidence, 70);
    }

    #[test]
    fn test_vendor_classification() {
        assert_eq!(
            infer_device_type(Some("Cisco Systems"), &[]).as_deref(),
            Some("Network Device")
        );
        assert_eq!(
            infer_device_type(Some("VMware"), &[]).as_deref(),
            Some("Virtual Machine")
        );
        assert_eq!(
            infer_device_type(Some("Raspberry Pi Foundation"), &[]).as_deref(),
            Some("IoT/Embedded Device")
        );
        assert_eq!(
            infer_device_type(Some("Hewlett Packard"), &[]).as_deref(),
            Some("Server")
        );
        assert_eq!(infer_device_type(Some("Obscure Corp"), &[]), None);
        assert_eq!(infer_device_type(None, &[]), None);
    }

    #[test]
    fn test_service_rules_override_vendor() {
        let results = vec![open_port(3389, None)];
        assert_eq!(
            infer_device_type(Some("Dell"), &results).as_deref(),
            Some("Windows Server/Workstation")
        );

        let results = vec![open_port(22, Some("ssh")), open_port(443, None)];
        assert_eq!(
            infer_device_type(None, &results).as_deref(),
            Some("Linux Server")
        );
    }

    #[test]
    fn test_ssh_alone_is_not_a_linux_server() {
        let results = vec![open_port(22, Some("ssh"))];
        assert_eq!(infer_device_type(None, &results), None);
    }

    #[test]
    fn test_vendor_lookup() {
        assert_eq!(lookup_vendor("b8:27:eb:12:34:56"), "Raspberry Pi Foundation");
        assert_eq!(lookup_vendor("52:54:00:ab:cd:ef"), "KVM/QEMU");
        assert_eq!(lookup_vendor("de:ad:be:ef:00:01"), "Unknown Vendor");
        assert_eq!(lookup_vendor("short"), "Unknown Vendor");
    }

    #[test]
    fn test_parse_arp_table() {
        let content = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
192.168.1.50     0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.77     0x1         0x2         b8:27:eb:01:02:03     *        eth0
";
        let ip: IpAddr = "192.168.1.77".parse().unwrap();
        assert_eq!(
            parse_arp_table(content, ip).as_deref(),
            Some("b8:27:eb:01:02:03")
        );
        // Incomplete entries never count.
        let pending: IpAddr = "192.168.1.50".parse().unwrap();
        assert_eq!(parse_arp_table(content, pending), None);
        let absent: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(parse_arp_table(content, absent), None);
    }
}
