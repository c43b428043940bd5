use get_if_addrs::get_if_addrs;
use std::net::UdpSocket;

/// Guesses this machine's outbound IP address.
///
/// Opens a UDP socket and "connects" it to a public DNS server (8.8.8.8).
/// UDP connect never sends a packet, but it does make the kernel pick the
/// local interface/address that would carry traffic to that destination,
/// which is exactly what a source client needs to fill in as its own
/// advertised IP. Falls back to `127.0.0.1` if no route exists (e.g. no
/// network interface is up at all).
pub fn guess_local_ip() -> String {
    match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => {
            if socket.connect("8.8.8.8:80").is_ok() {
                if let Ok(local_addr) = socket.local_addr() {
                    return local_addr.ip().to_string();
                }
            }
            "127.0.0.1".to_string()
        }
        Err(_) => "127.0.0.1".to_string(),
    }
}

/// Every non-loopback IPv4 address this machine carries, grouped by
/// interface name. Used for startup diagnostics ("which address did we
/// bind?") rather than anything on the hot path.
pub fn list_all_ips() -> std::collections::HashMap<String, Vec<String>> {
    let mut result = std::collections::HashMap::new();

    if let Ok(interfaces) = get_if_addrs() {
        for iface in interfaces {
            let ip = iface.ip();
            if ip.is_loopback() {
                continue;
            }
            if ip.is_ipv4() {
                result
                    .entry(iface.name)
                    .or_insert_with(Vec::new)
                    .push(ip.to_string());
            }
        }
    } else {
        result.insert(
            "error".to_string(),
            vec!["failed to enumerate network interfaces".to_string()],
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn guess_local_ip_returns_a_parseable_address() {
        let ip = guess_local_ip();
        assert!(ip.parse::<IpAddr>().is_ok(), "should return a valid IP address");
    }

    #[test]
    fn guess_local_ip_is_never_empty() {
        assert!(!guess_local_ip().is_empty());
    }

    #[test]
    fn guess_local_ip_prefers_ipv4() {
        let ip = guess_local_ip();
        if let Ok(parsed) = ip.parse::<IpAddr>() {
            assert!(parsed.is_ipv4(), "should return an IPv4 address");
        }
    }

    #[test]
    fn list_all_ips_excludes_loopback() {
        for (_, addrs) in list_all_ips() {
            for addr in addrs {
                if let Ok(parsed) = addr.parse::<IpAddr>() {
                    assert!(!parsed.is_loopback());
                }
            }
        }
    }

    #[test]
    fn list_all_ips_entries_are_valid_addresses() {
        for (iface, addrs) in list_all_ips() {
            if iface == "error" {
                continue;
            }
            for addr in addrs {
                assert!(addr.parse::<IpAddr>().is_ok());
            }
        }
    }

    #[test]
    fn list_all_ips_has_no_duplicate_addresses_per_interface() {
        for (iface, addrs) in list_all_ips() {
            if iface == "error" {
                continue;
            }
            let unique: std::collections::HashSet<_> = addrs.iter().collect();
            assert_eq!(addrs.len(), unique.len(), "duplicate address on {iface}");
        }
    }
}
