use crate::addr::Addr;
use crate::booleans;
use crate::errors::{ErrorKind, Result};
use crate::node_id::NodeID;
use crate::node_info::{node_list, NodeInfo};
use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Well-known KRPC error codes.
pub mod error_code {
    /// Generic error
    pub const GENERIC: u16 = 201;

    /// Server error
    pub const SERVER: u16 = 202;

    /// Protocol error: malformed packet, invalid arguments, bad token or
    /// bad signature
    pub const PROTOCOL: u16 = 203;

    /// Method unknown
    pub const METHOD_UNKNOWN: u16 = 204;

    /// The `cas` value of a mutable put did not match the stored sequence
    pub const CAS_MISMATCH: u16 = 301;

    /// A mutable put carried a sequence number lower than the stored one
    pub const SEQ_LESS_THAN_CURRENT: u16 = 302;
}

/// Envelope holding information common to queries, responses and errors.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Public IP address of the requester, echoed by peers supporting
    /// [BEP-0042].
    ///
    /// [BEP-0042]: http://www.bittorrent.org/beps/bep_0042.html
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Addr>,

    /// Transaction ID generated by the querying node and echoed in the
    /// response. Used to correlate requests and responses.
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    /// Client version string
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<ByteBuf>,

    #[serde(flatten)]
    pub message_type: MessageType,
}

impl Envelope {
    pub fn query(transaction_id: Vec<u8>, query: Query) -> Envelope {
        Envelope {
            ip: None,
            transaction_id,
            version: None,
            message_type: MessageType::Query { query },
        }
    }

    pub fn response(transaction_id: Vec<u8>, response: Response) -> Envelope {
        Envelope {
            ip: None,
            transaction_id,
            version: None,
            message_type: MessageType::Response { response },
        }
    }

    pub fn error(transaction_id: Vec<u8>, error: KRPCError) -> Envelope {
        Envelope {
            ip: None,
            transaction_id,
            version: None,
            message_type: MessageType::Error { error },
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        Ok(serde_bencode::de::from_bytes(bytes)
            .map_err(|cause| ErrorKind::DecodeError { cause })?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::ser::to_bytes(self).map_err(|cause| ErrorKind::EncodeError { cause })?)
    }
}

/// The three message families distinguished by `y`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "y")]
pub enum MessageType {
    #[serde(rename = "q")]
    Query {
        #[serde(flatten)]
        query: Query,
    },

    #[serde(rename = "r")]
    Response {
        #[serde(rename = "r")]
        response: Response,
    },

    #[serde(rename = "e")]
    Error {
        #[serde(rename = "e")]
        error: KRPCError,
    },
}

/// Error sent when a query cannot be fulfilled
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct KRPCError(u16, String);

impl KRPCError {
    pub fn new(code: u16, message: &str) -> KRPCError {
        KRPCError(code, message.to_string())
    }

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn message(&self) -> &str {
        &self.1
    }
}

impl fmt::Display for KRPCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.1, self.0)
    }
}

/// Possible queries
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "q", content = "a")]
pub enum Query {
    /// Liveness probe
    ///
    /// The appropriate response is [`Response`] carrying only the node ID of
    /// the responding node.
    #[serde(rename = "ping")]
    Ping {
        /// Sender's node ID
        id: NodeID,
    },

    /// Used to find the contact information for a node given its ID.
    ///
    /// The receiver responds with the K closest good nodes in its own
    /// routing table.
    #[serde(rename = "find_node")]
    FindNode {
        /// Node ID of the querying node
        id: NodeID,

        /// ID of the node being searched for
        target: NodeID,
    },

    /// Get peers associated with a torrent infohash.
    ///
    /// The response carries a write token and the K closest nodes, plus the
    /// compact peer list under `values` when the receiver has local
    /// announcements for `info_hash`.
    #[serde(rename = "get_peers")]
    GetPeers {
        /// Node ID of the querying node
        id: NodeID,

        /// Infohash of the torrent searching for peers of
        info_hash: NodeID,
    },

    /// Announce that the peer controlling the querying node is downloading
    /// a torrent on a port.
    ///
    /// The receiver must verify that the token was previously issued to the
    /// same IP address before storing the announcement.
    #[serde(rename = "announce_peer")]
    AnnouncePeer {
        /// Node ID of the querying node
        id: NodeID,

        /// Whether the peer's port is implied by the source port of the
        /// datagram carrying this query, useful for peers behind a NAT
        /// that do not know their external port.
        #[serde(
            default,
            with = "booleans",
            skip_serializing_if = "booleans::is_false"
        )]
        implied_port: bool,

        /// Infohash of the torrent being announced
        info_hash: NodeID,

        /// Peer's port, ignored when `implied_port` is set
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,

        /// Token received in response to a previous [`Query::GetPeers`]
        #[serde(with = "serde_bytes")]
        token: Vec<u8>,
    },

    /// Retrieve a stored value from [BEP-0044]
    ///
    /// [BEP-0044]: http://www.bittorrent.org/beps/bep_0044.html
    #[serde(rename = "get")]
    Get {
        /// Node ID of the querying node
        id: NodeID,

        /// SHA-1 of the stored value for immutable items, SHA-1 of the
        /// public key and optional salt for mutable items
        target: NodeID,
    },

    /// Store a value under [BEP-0044]
    ///
    /// Immutable items carry only `v`; mutable items additionally carry the
    /// public key, signature, sequence number and optional salt.
    ///
    /// [BEP-0044]: http://www.bittorrent.org/beps/bep_0044.html
    #[serde(rename = "put")]
    Put {
        /// Expected sequence number of the stored item, for compare-and-swap
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cas: Option<i64>,

        /// Node ID of the querying node
        id: NodeID,

        /// Ed25519 public key of a mutable item (32 bytes)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        k: Option<ByteBuf>,

        /// Salt mixed into a mutable item's target (at most 64 bytes)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        salt: Option<ByteBuf>,

        /// Sequence number of a mutable item
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<i64>,

        /// Ed25519 signature over the item (64 bytes)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sig: Option<ByteBuf>,

        /// Token received in response to a previous [`Query::Get`] or
        /// [`Query::GetPeers`]
        #[serde(with = "serde_bytes")]
        token: Vec<u8>,

        /// The stored value (at most 1000 bytes)
        v: ByteBuf,
    },

    /// Any method this node does not implement. Answered with a
    /// [`error_code::METHOD_UNKNOWN`] error rather than silence.
    #[serde(other)]
    Unknown,
}

impl Query {
    /// The sender's node ID, present in every known query.
    pub fn id(&self) -> Option<&NodeID> {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. }
            | Query::Get { id, .. }
            | Query::Put { id, .. } => Some(id),
            Query::Unknown => None,
        }
    }

    /// The wire name of the method.
    pub fn method(&self) -> &'static str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
            Query::Get { .. } => "get",
            Query::Put { .. } => "put",
            Query::Unknown => "unknown",
        }
    }
}

/// A response body.
///
/// Every method's response is a subset of these fields, so a single decoder
/// serves the whole base set and both extensions; a response is interpreted
/// against the query that created its transaction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct Response {
    /// Identifier of the queried node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeID>,

    /// Ed25519 public key of a stored mutable item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<ByteBuf>,

    /// Compact node set closest to the requested target
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "node_list::option"
    )]
    pub nodes: Option<Vec<NodeInfo>>,

    /// Sequence number of a stored mutable item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,

    /// Ed25519 signature of a stored mutable item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<ByteBuf>,

    /// Write token for a later announce or put
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,

    /// Stored value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<ByteBuf>,

    /// Compact peer tuples announced for the requested infohash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Addr>>,
}

impl Response {
    /// A response carrying only the sender's ID, fitting ping and announce.
    pub fn only_id(id: NodeID) -> Response {
        Response {
            id: Some(id),
            ..Response::default()
        }
    }
}
