//! Host network interface discovery
//!
//! Used to offer multicast interface choices to the operator and to pick
//! sensible defaults for the HTTP listen address and multicast interface.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use get_if_addrs::get_if_addrs;

/// Interface name to its non-loopback IPv4 addresses
pub type InterfaceMap = BTreeMap<String, Vec<String>>;

/// List every interface that carries at least one non-loopback IPv4 address
///
/// Errors are logged and produce an empty map.
pub fn interfaces_and_ips() -> InterfaceMap {
    let mut result = InterfaceMap::new();

    let interfaces = match get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list network interfaces");
            return result;
        }
    };

    for iface in interfaces {
        let ip = iface.ip();
        if ip.is_loopback() || !ip.is_ipv4() {
            continue;
        }
        result.entry(iface.name).or_default().push(ip.to_string());
    }

    result
}

/// First IPv4 address of the named interface
pub fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    let interfaces = get_if_addrs().ok()?;
    interfaces
        .into_iter()
        .filter(|iface| iface.name == name)
        .find_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
}

/// Pick the address the HTTP server should advertise
///
/// A `192.168.` address wins; otherwise the first address seen.
pub fn find_best_ip(interfaces: &InterfaceMap) -> Option<&str> {
    let mut first = None;
    for ip in interfaces.values().flatten() {
        if first.is_none() {
            first = Some(ip.as_str());
        }
        if ip.starts_with("192.168.") {
            return Some(ip.as_str());
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &[&str])]) -> InterfaceMap {
        entries
            .iter()
            .map(|(name, ips)| {
                (
                    name.to_string(),
                    ips.iter().map(|ip| ip.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_find_best_ip_prefers_lan() {
        let m = map(&[("eth0", &["10.0.0.2"]), ("eth1", &["192.168.1.20"])]);
        assert_eq!(find_best_ip(&m), Some("192.168.1.20"));
    }

    #[test]
    fn test_find_best_ip_falls_back_to_first() {
        let m = map(&[("eth0", &["10.0.0.2", "10.0.0.3"]), ("eth1", &["172.16.0.9"])]);
        assert_eq!(find_best_ip(&m), Some("10.0.0.2"));
    }

    #[test]
    fn test_find_best_ip_empty() {
        assert_eq!(find_best_ip(&InterfaceMap::new()), None);
    }

    #[test]
    fn test_interfaces_skip_loopback() {
        for ips in interfaces_and_ips().values() {
            for ip in ips {
                let ip: Ipv4Addr = ip.parse().unwrap();
                assert!(!ip.is_loopback());
            }
        }
    }
}
