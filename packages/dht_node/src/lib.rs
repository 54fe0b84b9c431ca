//! A BitTorrent DHT node.
//!
//! Implements the four base KRPC queries from [BEP-0005] (ping, find_node,
//! get_peers, announce_peer) on top of a dynamically-splitting routing
//! table and an iterative closest-node lookup, plus two extensions:
//! secure node IDs derived from the node's IP ([BEP-0042]) and storage of
//! immutable and ed25519-signed mutable values ([BEP-0044]).
//!
//! [BEP-0005]: http://www.bittorrent.org/beps/bep_0005.html
//! [BEP-0042]: http://www.bittorrent.org/beps/bep_0042.html
//! [BEP-0044]: http://www.bittorrent.org/beps/bep_0044.html

pub mod bep42;
pub mod errors;
mod lookup;
mod node;
mod state;
pub mod storage;
mod token_store;

pub use crate::node::{Config, Dht};
pub use crate::state::DhtState;
pub use crate::storage::{MutableItem, MutableUpdate, StorageItem};
pub use crate::token_store::TokenStore;

pub use ed25519_dalek::SigningKey;
pub use krpc_encoding::{Addr, NodeID, NodeInfo};
