use crate::errors::{ErrorKind, Result};
use num_bigint::BigUint;
use rand::Rng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Length in bytes of a node identifier or info-hash.
pub const NODE_ID_LEN: usize = 20;

/// A 160 bit identifier in the DHT key space. Node identifiers, info-hashes
/// and storage targets all share this type; only XOR ordering is ever
/// interpreted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeID([u8; NODE_ID_LEN]);

impl NodeID {
    pub fn new(bytes: [u8; NODE_ID_LEN]) -> NodeID {
        NodeID(bytes)
    }

    pub fn random() -> NodeID {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill(&mut bytes[..]);
        NodeID(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<NodeID> {
        if bytes.len() != NODE_ID_LEN {
            Err(ErrorKind::InvalidNodeID {
                length: bytes.len(),
            })?;
        }

        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(NodeID(id))
    }

    pub fn from_hex(hex_str: &str) -> Result<NodeID> {
        let bytes = hex::decode(hex_str).map_err(|_| ErrorKind::InvalidNodeID {
            length: hex_str.len() / 2,
        })?;
        NodeID::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Big-endian numeric view of the identifier.
    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// Converts back from the numeric view. Values of 2^160 or more do not
    /// round-trip and are rejected.
    pub fn from_biguint(value: &BigUint) -> Result<NodeID> {
        let bytes = value.to_bytes_be();
        if bytes.len() > NODE_ID_LEN {
            Err(ErrorKind::InvalidNodeID {
                length: bytes.len(),
            })?;
        }

        let mut id = [0u8; NODE_ID_LEN];
        id[NODE_ID_LEN - bytes.len()..].copy_from_slice(&bytes);
        Ok(NodeID(id))
    }

    /// XOR distance to `other`. Only the ordering of distances is meaningful.
    pub fn distance_to(&self, other: &NodeID) -> BigUint {
        let mut xored = [0u8; NODE_ID_LEN];
        for (i, byte) in xored.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        BigUint::from_bytes_be(&xored)
    }
}

impl fmt::Debug for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeID({})", self.to_hex())
    }
}

impl fmt::Display for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for NodeID {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

struct NodeIDVisitor;

impl<'de> Visitor<'de> for NodeIDVisitor {
    type Value = NodeID;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a 20 byte string")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<NodeID, E>
    where
        E: de::Error,
    {
        NodeID::from_bytes(v).map_err(|_| E::invalid_length(v.len(), &self))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<NodeID, E>
    where
        E: de::Error,
    {
        self.visit_bytes(&v)
    }

    fn visit_str<E>(self, v: &str) -> std::result::Result<NodeID, E>
    where
        E: de::Error,
    {
        self.visit_bytes(v.as_bytes())
    }
}

impl<'de> Deserialize<'de> for NodeID {
    fn deserialize<D>(deserializer: D) -> std::result::Result<NodeID, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_byte_buf(NodeIDVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric() {
        let a = NodeID::random();
        let b = NodeID::random();

        assert_eq!(a.distance_to(&b), b.distance_to(&a));
    }

    #[test]
    fn distance_to_self_is_zero() {
        let a = NodeID::random();

        assert_eq!(a.distance_to(&a), BigUint::from(0u8));
    }

    #[test]
    fn distance_orders_by_shared_prefix() {
        let target = NodeID::new([0u8; 20]);

        let mut near = [0u8; 20];
        near[19] = 1;
        let near = NodeID::new(near);

        let mut far = [0u8; 20];
        far[0] = 0x80;
        let far = NodeID::new(far);

        assert!(target.distance_to(&near) < target.distance_to(&far));
    }

    #[test]
    fn biguint_round_trip() {
        let id = NodeID::random();
        let back = NodeID::from_biguint(&id.to_biguint()).unwrap();

        assert_eq!(id, back);
    }

    #[test]
    fn biguint_pads_leading_zeroes() {
        let mut bytes = [0u8; 20];
        bytes[19] = 7;
        let id = NodeID::new(bytes);

        assert_eq!(NodeID::from_biguint(&BigUint::from(7u8)).unwrap(), id);
    }

    #[test]
    fn hex_round_trip() {
        let id = NodeID::random();

        assert_eq!(NodeID::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(NodeID::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn bencode_round_trip() {
        let id = NodeID::random();
        let encoded = serde_bencode::ser::to_bytes(&id).unwrap();

        assert_eq!(encoded.len(), 23); // "20:" prefix plus payload

        let decoded: NodeID = serde_bencode::de::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, id);
    }
}
