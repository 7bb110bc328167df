//! Best-effort host identity detection.
//!
//! Instances are keyed by `(host_ip, host_mac, service_name)`; this
//! module discovers the IP and MAC of the primary interface without
//! generating traffic. Detection is best effort: on failure the loopback
//! address and an all-zero MAC are used, which still yields a stable
//! (if less distinctive) instance key.

use std::net::UdpSocket;

use tracing::debug;

use trellis_core::InstanceInfo;

const FALLBACK_IP: &str = "127.0.0.1";
const FALLBACK_MAC: &str = "00:00:00:00:00:00";

/// Detect this host's identity for instance registration.
pub fn detect() -> InstanceInfo {
    let host_ip = local_ip().unwrap_or_else(|| {
        debug!("no routable local IP found, using loopback");
        FALLBACK_IP.to_string()
    });
    let host_mac = primary_mac().unwrap_or_else(|| {
        debug!("no interface MAC found, using zero MAC");
        FALLBACK_MAC.to_string()
    });
    let working_dir = std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();

    InstanceInfo {
        language: "rust".to_string(),
        host_ip,
        host_mac,
        working_dir,
    }
}

/// The local address the OS would route external traffic from.
///
/// Connecting a UDP socket picks a source address without sending
/// anything.
fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let addr = socket.local_addr().ok()?;
    if addr.ip().is_loopback() {
        return None;
    }
    Some(addr.ip().to_string())
}

/// MAC address of the first up, non-loopback interface.
#[cfg(target_os = "linux")]
fn primary_mac() -> Option<String> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name == "lo" {
            continue;
        }
        let mac = std::fs::read_to_string(entry.path().join("address")).ok()?;
        let mac = mac.trim();
        if mac.is_empty() || mac == FALLBACK_MAC {
            continue;
        }
        return Some(mac.to_string());
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn primary_mac() -> Option<String> {
    None
}
