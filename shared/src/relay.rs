//! Encapsulation for datagrams forwarded to a relay.
//!
//! Layout: family byte (4 or 6), address octets, port in network order, then
//! the original datagram untouched.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Prefixes `datagram` with the address it came from.
pub fn wrap(sender: SocketAddr, datagram: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(19 + datagram.len());
    match sender.ip() {
        IpAddr::V4(ip) => {
            out.push(4);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(6);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&sender.port().to_be_bytes());
    out.extend_from_slice(datagram);
    out
}

/// Returns the original sender and the datagram it sent.
pub fn unwrap(packet: &[u8]) -> Option<(SocketAddr, &[u8])> {
    let (&family, rest) = packet.split_first()?;
    let (ip, rest) = match family {
        4 if rest.len() >= 6 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&rest[..4]);
            (IpAddr::V4(Ipv4Addr::from(octets)), &rest[4..])
        }
        6 if rest.len() >= 18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            (IpAddr::V6(Ipv6Addr::from(octets)), &rest[16..])
        }
        _ => return None,
    };
    // Both arms checked that the port fits.
    let port = u16::from_be_bytes([rest[0], rest[1]]);
    Some((SocketAddr::new(ip, port), &rest[2..]))
}
