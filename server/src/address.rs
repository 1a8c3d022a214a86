//! Socket address helpers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// Address family of a socket or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

/// `::ffff:a.b.c.d` form, if `ip` is one.
pub fn mapped_ipv4(ip: &Ipv6Addr) -> Option<Ipv4Addr> {
    match ip.segments() {
        [0, 0, 0, 0, 0, 0xFFFF, _, _] => {
            let o = ip.octets();
            Some(Ipv4Addr::new(o[12], o[13], o[14], o[15]))
        }
        _ => None,
    }
}

/// Collapses IPv4-mapped IPv6 addresses to plain IPv4.
pub fn normalize(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match mapped_ipv4(v6.ip()) {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => mapped_ipv4(&v6).map(IpAddr::V4).unwrap_or(ip),
        IpAddr::V4(_) => ip,
    }
}

/// Rewrites `dest` so a socket of `family` can send to it.
///
/// IPv4 destinations become IPv4-mapped on IPv6 sockets and mapped
/// destinations collapse back on IPv4 sockets. Native IPv6 cannot be reached
/// from an IPv4 socket.
pub fn translate_for(family: Family, dest: SocketAddr) -> Option<SocketAddr> {
    match (family, dest) {
        (Family::V4, SocketAddr::V4(_)) | (Family::V6, SocketAddr::V6(_)) => Some(dest),
        (Family::V6, SocketAddr::V4(v4)) => Some(SocketAddr::V6(SocketAddrV6::new(
            v4.ip().to_ipv6_mapped(),
            v4.port(),
            0,
            0,
        ))),
        (Family::V4, SocketAddr::V6(v6)) => {
            mapped_ipv4(v6.ip()).map(|ip| SocketAddr::new(IpAddr::V4(ip), v6.port()))
        }
    }
}

/// Port in the 2-byte network-order form embedded by some packets.
pub fn port_bytes(port: u16) -> [u8; 2] {
    port.to_be_bytes()
}

pub fn loopback(family: Family, port: u16) -> SocketAddr {
    match family {
        Family::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        Family::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
    }
}

/// Parses an address typed by a human, tolerating whitespace and brackets.
pub fn parse_ip(text: &str) -> Option<IpAddr> {
    let text = text.trim().trim_start_matches('[').trim_end_matches(']');
    text.parse().ok()
}
