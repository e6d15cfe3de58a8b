//! Registry identity of a transport peer.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Canonical (ip, port, ip version) key for one peer.
///
/// Two datagrams with equal keys always belong to the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressKey {
    pub ip: IpAddr,
    pub port: u16,
    pub version: u8,
}

impl AddressKey {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        // IPv4-mapped IPv6 senders (dual-stack sockets) share a key with
        // their plain IPv4 form.
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        let version = if ip.is_ipv4() { 4 } else { 6 };
        Self { ip, port, version }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for AddressKey {
    fn from(addr: SocketAddr) -> Self {
        AddressKey::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_key_from_ipv4() {
        let key = AddressKey::from("127.0.0.1:19132".parse::<SocketAddr>().unwrap());
        assert_eq!(key.version, 4);
        assert_eq!(key.port, 19132);
        assert_eq!(key.to_string(), "127.0.0.1:19132");
    }

    #[test]
    fn test_key_from_ipv6() {
        let key = AddressKey::from("[2001:db8::1]:19133".parse::<SocketAddr>().unwrap());
        assert_eq!(key.version, 6);
        assert_eq!(key.to_string(), "[2001:db8::1]:19133");
    }

    #[test]
    fn test_mapped_ipv4_collapses_to_ipv4() {
        let mapped = AddressKey::from("[::ffff:10.0.0.7]:4000".parse::<SocketAddr>().unwrap());
        let plain = AddressKey::from("10.0.0.7:4000".parse::<SocketAddr>().unwrap());
        assert_eq!(mapped, plain);
        assert_eq!(mapped.version, 4);
    }

    #[test]
    fn test_equal_keys_share_a_slot() {
        let mut slots = HashMap::new();
        let addr: SocketAddr = "192.168.0.2:5555".parse().unwrap();
        slots.insert(AddressKey::from(addr), 1);
        slots.insert(AddressKey::from(addr), 2);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[&AddressKey::from(addr)], 2);

        let other_port: SocketAddr = "192.168.0.2:5556".parse().unwrap();
        assert!(!slots.contains_key(&AddressKey::from(other_port)));
    }
}
