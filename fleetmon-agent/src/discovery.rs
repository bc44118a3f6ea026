//! Network discovery for machine registration
//!
//! This module handles:
//! - Network interface enumeration with MAC addresses
//! - Primary MAC selection with priority (Ethernet > WiFi > Other > Virtual)
//! - Best-effort local IP detection without sending packets

use if_addrs::get_if_addrs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::inventory::UNKNOWN;

/// One reportable network interface, as the server expects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub interface_name: String,
    pub mac_address: String,
    pub is_up: bool,
    pub speed_mbps: i64,
}

/// Interface classification used for primary MAC selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum InterfaceKind {
    Ethernet,
    Wireless,
    Other,
    Virtual,
}

/// Enumerate non-loopback interfaces that currently hold an address.
///
/// `if-addrs` yields one entry per address, so names are deduplicated.
/// Link speed is not portably available; the server treats 0 as unknown.
pub fn interfaces() -> Vec<NetworkInterface> {
    let if_addrs = match get_if_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("Failed to enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut interfaces = Vec::new();

    for if_addr in if_addrs {
        if if_addr.is_loopback() || !seen.insert(if_addr.name.clone()) {
            continue;
        }

        let mac_address = match interface_mac(&if_addr.name) {
            Some(mac) => mac,
            None => continue,
        };

        debug!("Found interface: {} ({})", if_addr.name, mac_address);
        interfaces.push(NetworkInterface {
            interface_name: if_addr.name,
            mac_address,
            // Only configured interfaces are enumerated, so they are up.
            is_up: true,
            speed_mbps: 0,
        });
    }

    interfaces
}

/// Select the primary MAC address for this machine.
///
/// Wired interfaces win over wireless, physical over virtual. Falls back
/// to the `"N/A"` sentinel when nothing usable is found.
pub fn primary_mac() -> String {
    let mut candidates = interfaces();
    candidates.sort_by_key(|i| classify_interface(&i.interface_name));

    match candidates.first() {
        Some(best) => {
            debug!(
                "Selected primary interface: {} ({})",
                best.interface_name, best.mac_address
            );
            best.mac_address.clone()
        }
        None => {
            warn!("No network interface with a MAC address found");
            UNKNOWN.to_string()
        }
    }
}

/// Local IP as seen on the route towards the probe target.
///
/// Connecting a UDP socket picks the outbound interface without sending
/// a single packet. Falls back to loopback when the host is offline.
pub fn local_ip() -> String {
    routed_local_ip().unwrap_or_else(|| "127.0.0.1".to_string())
}

fn routed_local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

fn interface_mac(interface_name: &str) -> Option<String> {
    match mac_address::mac_address_by_name(interface_name) {
        Ok(Some(mac)) => {
            let b = mac.bytes();
            Some(format!(
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ))
        }
        Ok(None) => {
            debug!("No MAC found for interface: {}", interface_name);
            None
        }
        Err(e) => {
            debug!("Error getting MAC for {}: {}", interface_name, e);
            None
        }
    }
}

fn classify_interface(name: &str) -> InterfaceKind {
    let name = name.to_lowercase();

    if name.starts_with("docker") || name.starts_with("br-") || name.starts_with("veth")
        || name.starts_with("vir") || name.starts_with("vmnet") || name.starts_with("tun")
        || name.starts_with("tap")
    {
        return InterfaceKind::Virtual;
    }

    if name.starts_with("wlan") || name.starts_with("wlp") || name.starts_with("wlo")
        || name.contains("wifi") || name.contains("wi-fi")
    {
        return InterfaceKind::Wireless;
    }

    if name.starts_with("eth") || name.starts_with("en") || name.contains("ethernet") {
        return InterfaceKind::Ethernet;
    }

    InterfaceKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_classification() {
        assert_eq!(classify_interface("eth0"), InterfaceKind::Ethernet);
        assert_eq!(classify_interface("enp3s0"), InterfaceKind::Ethernet);
        assert_eq!(classify_interface("wlan0"), InterfaceKind::Wireless);
        assert_eq!(classify_interface("wlp2s0"), InterfaceKind::Wireless);
        assert_eq!(classify_interface("docker0"), InterfaceKind::Virtual);
        assert_eq!(classify_interface("veth12ab"), InterfaceKind::Virtual);
        assert_eq!(classify_interface("ppp0"), InterfaceKind::Other);
    }

    #[test]
    fn test_priority_prefers_wired_over_virtual() {
        let mut kinds = vec![
            InterfaceKind::Virtual,
            InterfaceKind::Other,
            InterfaceKind::Ethernet,
            InterfaceKind::Wireless,
        ];
        kinds.sort();
        assert_eq!(kinds[0], InterfaceKind::Ethernet);
        assert_eq!(kinds[3], InterfaceKind::Virtual);
    }

    #[test]
    fn test_local_ip_is_parseable() {
        let ip = local_ip();
        assert!(ip.parse::<std::net::IpAddr>().is_ok());
    }
}
