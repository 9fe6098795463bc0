use std::path::Path;
use std::time::Duration;

use log::debug;

use super::types::NetworkInterface;
use crate::dissector::process::run_tool;
use crate::error_handling::types::ForensicError;

const LIST_TIMEOUT: Duration = Duration::from_secs(15);

/// Name fragments of interfaces that rarely carry the traffic someone wants.
const UNLIKELY: &[&str] = &[
    "lo", "loopback", "any", "docker", "veth", "br-", "virbr", "vmnet", "utun", "tun", "tap",
    "wg", "bluetooth", "dbus", "nflog", "nfqueue", "usbmon",
];

/// Capture-tool plugins listed alongside real interfaces.
const EXTCAP: &[&str] = &[
    "ciscodump",
    "dpauxmon",
    "randpkt",
    "sdjournal",
    "sshdump",
    "udpdump",
    "wifidump",
    "etwdump",
    "androiddump",
];

const LIKELY: &[&str] = &["eth", "en", "wlan", "wl", "wi-fi", "ethernet"];

/// Parses `-D` output: `1. eth0`, `3. \Device\NPF_{..} (Ethernet)`.
pub fn parse_interface_list(output: &str) -> Vec<NetworkInterface> {
    output
        .lines()
        .filter_map(|line| {
            let (index, rest) = line.trim().split_once(". ")?;
            let index = index.trim().parse().ok()?;
            let rest = rest.trim();
            let (name, description) = match rest.strip_suffix(')').and_then(|r| r.split_once(" (")) {
                Some((name, desc)) => (name.trim(), Some(desc.trim().to_string())),
                None => (rest, None),
            };
            if name.is_empty() {
                return None;
            }
            Some(NetworkInterface {
                index,
                name: name.to_string(),
                description,
            })
        })
        .collect()
}

/// Higher is a better default. Loopback, virtual, tunnel and plugin entries sink.
pub fn preference(interface: &NetworkInterface) -> i32 {
    let name = interface.name.to_lowercase();
    let description = interface
        .description
        .as_deref()
        .unwrap_or("")
        .to_lowercase();

    if EXTCAP.iter().any(|e| name.starts_with(e)) {
        return -100;
    }
    let mut score = 0;
    if UNLIKELY.iter().any(|u| name.starts_with(u)) || description.contains("loopback") {
        score -= 50;
    }
    if description.contains("virtual") || description.contains("adapter for loopback") {
        score -= 20;
    }
    if LIKELY.iter().any(|l| name.starts_with(l) || description.starts_with(l)) {
        score += 10;
    }
    score
}

/// Best-scoring interface; ties go to the lower index.
pub fn choose_default(interfaces: &[NetworkInterface]) -> Option<&NetworkInterface> {
    interfaces
        .iter()
        .max_by(|x, y| preference(x).cmp(&preference(y)).then_with(|| y.index.cmp(&x.index)))
}

pub async fn list_interfaces(tool: &Path) -> Result<Vec<NetworkInterface>, ForensicError> {
    let output = run_tool(tool, &["-D".to_string()], LIST_TIMEOUT).await?;
    let interfaces = parse_interface_list(&output.stdout);
    debug!("{} capture interface(s) available", interfaces.len());
    Ok(interfaces)
}
