use crate::errors::{ErrorKind, Result};
use byteorder::{ByteOrder, NetworkEndian};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Length in bytes of a compact peer tuple.
pub const COMPACT_ADDR_LEN: usize = 6;

/// An IPv4 UDP endpoint carried on the wire as a 6 byte compact tuple
/// (4 address octets followed by a big-endian port).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr(SocketAddrV4);

impl Addr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Addr {
        Addr(SocketAddrV4::new(ip, port))
    }

    pub fn ip(&self) -> &Ipv4Addr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn to_compact(&self) -> [u8; COMPACT_ADDR_LEN] {
        let mut bytes = [0u8; COMPACT_ADDR_LEN];
        bytes[..4].copy_from_slice(&self.0.ip().octets());
        NetworkEndian::write_u16(&mut bytes[4..], self.0.port());
        bytes
    }

    pub fn from_compact(bytes: &[u8]) -> Result<Addr> {
        if bytes.len() != COMPACT_ADDR_LEN {
            Err(ErrorKind::InvalidCompactAddr {
                length: bytes.len(),
            })?;
        }

        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = NetworkEndian::read_u16(&bytes[4..]);
        Ok(Addr(SocketAddrV4::new(ip, port)))
    }
}

impl From<SocketAddrV4> for Addr {
    fn from(addr: SocketAddrV4) -> Addr {
        Addr(addr)
    }
}

impl From<Addr> for SocketAddrV4 {
    fn from(addr: Addr) -> SocketAddrV4 {
        addr.0
    }
}

impl From<Addr> for SocketAddr {
    fn from(addr: Addr) -> SocketAddr {
        SocketAddr::V4(addr.0)
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({})", self.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Serialize for Addr {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.to_compact())
    }
}

struct AddrVisitor;

impl<'de> Visitor<'de> for AddrVisitor {
    type Value = Addr;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a 6 byte compact address")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Addr, E>
    where
        E: de::Error,
    {
        Addr::from_compact(v).map_err(|_| E::invalid_length(v.len(), &self))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Addr, E>
    where
        E: de::Error,
    {
        self.visit_bytes(&v)
    }

    fn visit_str<E>(self, v: &str) -> std::result::Result<Addr, E>
    where
        E: de::Error,
    {
        self.visit_bytes(v.as_bytes())
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Addr, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_byte_buf(AddrVisitor)
    }
}
