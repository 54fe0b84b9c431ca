//! Wire model for the BitTorrent DHT: 160 bit node identifiers, compact
//! node and peer codecs, and the bencoded KRPC message envelope.

mod addr;
pub mod errors;
mod messages;
mod node_id;
mod node_info;

pub use crate::addr::{Addr, COMPACT_ADDR_LEN};
pub use crate::messages::{error_code, Envelope, KRPCError, MessageType, Query, Response};
pub use crate::node_id::{NodeID, NODE_ID_LEN};
pub use crate::node_info::{node_list, NodeInfo, COMPACT_NODE_LEN};

/// Serde adapter for the wire's integer-encoded booleans.
pub mod booleans {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn is_false(value: &bool) -> bool {
        !*value
    }

    pub fn serialize<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(i64::from(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(i64::deserialize(deserializer)? != 0)
    }
}
