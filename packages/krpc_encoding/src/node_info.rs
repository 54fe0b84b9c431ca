use crate::addr::{Addr, COMPACT_ADDR_LEN};
use crate::errors::{ErrorKind, Result};
use crate::node_id::{NodeID, NODE_ID_LEN};
use std::fmt;

/// Length in bytes of a compact node tuple (20 byte ID, 4 byte IPv4
/// address, 2 byte big-endian port).
pub const COMPACT_NODE_LEN: usize = NODE_ID_LEN + COMPACT_ADDR_LEN;

/// Contact information for a remote node.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub id: NodeID,
    pub address: Addr,
}

impl NodeInfo {
    pub fn new(id: NodeID, address: Addr) -> NodeInfo {
        NodeInfo { id, address }
    }

    pub fn to_compact(&self) -> [u8; COMPACT_NODE_LEN] {
        let mut bytes = [0u8; COMPACT_NODE_LEN];
        bytes[..NODE_ID_LEN].copy_from_slice(self.id.as_bytes());
        bytes[NODE_ID_LEN..].copy_from_slice(&self.address.to_compact());
        bytes
    }

    pub fn from_compact(bytes: &[u8]) -> Result<NodeInfo> {
        if bytes.len() != COMPACT_NODE_LEN {
            Err(ErrorKind::InvalidNodeList {
                length: bytes.len(),
            })?;
        }

        Ok(NodeInfo {
            id: NodeID::from_bytes(&bytes[..NODE_ID_LEN])?,
            address: Addr::from_compact(&bytes[NODE_ID_LEN..])?,
        })
    }

    /// Encodes a node set by concatenating 26 byte records.
    pub fn encode_list(nodes: &[NodeInfo]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
        for node in nodes {
            bytes.extend_from_slice(&node.to_compact());
        }
        bytes
    }

    /// Decodes a concatenated node set. A length which is not a multiple of
    /// 26 fails the whole list.
    pub fn decode_list(bytes: &[u8]) -> Result<Vec<NodeInfo>> {
        if bytes.len() % COMPACT_NODE_LEN != 0 {
            Err(ErrorKind::InvalidNodeList {
                length: bytes.len(),
            })?;
        }

        bytes
            .chunks(COMPACT_NODE_LEN)
            .map(NodeInfo::from_compact)
            .collect()
    }
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeInfo({} at {})", self.id, self.address)
    }
}

/// Serde adapter encoding `Vec<NodeInfo>` as a single concatenated byte
/// string, the way `nodes` appears inside responses.
pub mod node_list {
    use super::NodeInfo;
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(nodes: &[NodeInfo], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&NodeInfo::encode_list(nodes))
    }

    struct NodeListVisitor;

    impl<'de> Visitor<'de> for NodeListVisitor {
        type Value = Vec<NodeInfo>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a byte string with a length divisible by 26")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Vec<NodeInfo>, E>
        where
            E: de::Error,
        {
            NodeInfo::decode_list(v).map_err(|_| E::invalid_length(v.len(), &self))
        }

        fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Vec<NodeInfo>, E>
        where
            E: de::Error,
        {
            self.visit_bytes(&v)
        }

        fn visit_str<E>(self, v: &str) -> Result<Vec<NodeInfo>, E>
        where
            E: de::Error,
        {
            self.visit_bytes(v.as_bytes())
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<NodeInfo>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_byte_buf(NodeListVisitor)
    }

    /// The same adapter for optional `nodes` fields.
    pub mod option {
        use super::super::NodeInfo;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(nodes: &Option<Vec<NodeInfo>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match nodes {
                Some(nodes) => super::serialize(nodes, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<NodeInfo>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            #[derive(serde_derive::Deserialize)]
            struct Wrapper(#[serde(with = "super")] Vec<NodeInfo>);

            Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|wrapper| wrapper.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample(seed: u8) -> NodeInfo {
        NodeInfo::new(
            NodeID::new([seed; 20]),
            Addr::new(Ipv4Addr::new(10, 0, 0, seed), 6881 + u16::from(seed)),
        )
    }

    #[test]
    fn compact_round_trip() {
        let node = sample(3);
        assert_eq!(NodeInfo::from_compact(&node.to_compact()).unwrap(), node);
    }

    #[test]
    fn list_round_trip() {
        let nodes = vec![sample(1), sample(2), sample(3)];
        let encoded = NodeInfo::encode_list(&nodes);

        assert_eq!(encoded.len(), 3 * COMPACT_NODE_LEN);
        assert_eq!(NodeInfo::decode_list(&encoded).unwrap(), nodes);
    }

    #[test]
    fn empty_list_round_trip() {
        assert_eq!(NodeInfo::decode_list(&[]).unwrap(), Vec::new());
    }

    #[test]
    fn rejects_truncated_list() {
        let mut encoded = NodeInfo::encode_list(&[sample(1), sample(2)]);
        encoded.pop();

        assert!(NodeInfo::decode_list(&encoded).is_err());
    }
}
