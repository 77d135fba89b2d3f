//! Local IPv4 resolution for the envelope `ip` field.

use std::net::Ipv4Addr;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

/// IPv4 address of the named interface, or the first non-loopback IPv4 of
/// the host when `interface` is `None`. Empty string when none is found:
/// the field is informational and must never fail a transmit.
pub fn local_ipv4(interface: Option<&str>) -> String {
    find_ipv4(interface)
        .map(|ip| ip.to_string())
        .unwrap_or_default()
}

fn find_ipv4(interface: Option<&str>) -> Option<Ipv4Addr> {
    let addrs = getifaddrs().ok()?;
    for ifaddr in addrs {
        match interface {
            Some(name) if ifaddr.interface_name != name => continue,
            None if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) => continue,
            _ => {}
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Some(sin.ip());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_yields_empty() {
        assert_eq!(local_ipv4(Some("definitely-not-a-nic0")), "");
    }

    #[test]
    fn default_lookup_is_parseable_or_empty() {
        let ip = local_ipv4(None);
        if !ip.is_empty() {
            let parsed: Ipv4Addr = ip.parse().expect("ipv4 address");
            assert!(!parsed.is_loopback());
        }
    }
}
