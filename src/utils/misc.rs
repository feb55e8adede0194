use crate::config::IfaceInfo;
use std::net::{Ipv4Addr, UdpSocket};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of a value's type/variant, used for counting errors in metrics.
pub trait Typename {
    fn typename(&self) -> &'static str;
}

pub fn get_unix_millis_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

pub fn get_unix_secs_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Find the IPv4 address of the interface the OS routes LAN traffic
/// through, using the connect-to-external trick: connecting a UDP socket
/// sends no packet but makes the OS pick a source address.
pub fn detect_iface() -> IfaceInfo {
    let local_addr = local_route_addr().unwrap_or(Ipv4Addr::LOCALHOST);
    IfaceInfo { local_addr, broadcast_addr: directed_broadcast_of(local_addr) }
}

fn local_route_addr() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 53)).ok()?;
    match socket.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
        _ => None,
    }
}

/// Best-effort directed broadcast guess for private LANs, where a /24 is
/// the overwhelmingly common case. Elsewhere we return None and rely on
/// the limited-broadcast fallback.
fn directed_broadcast_of(addr: Ipv4Addr) -> Option<Ipv4Addr> {
    if !addr.is_private() {
        return None;
    }
    let [a, b, c, _] = addr.octets();
    Some(Ipv4Addr::new(a, b, c, 255))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directed_broadcast_only_for_private_ranges() {
        assert_eq!(directed_broadcast_of(Ipv4Addr::new(192, 168, 1, 42)), Some(Ipv4Addr::new(192, 168, 1, 255)));
        assert_eq!(directed_broadcast_of(Ipv4Addr::new(10, 20, 30, 40)), Some(Ipv4Addr::new(10, 20, 30, 255)));
        assert_eq!(directed_broadcast_of(Ipv4Addr::new(8, 8, 8, 8)), None);
    }
}
