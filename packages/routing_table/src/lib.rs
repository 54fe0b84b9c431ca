//! Kademlia routing table: a dynamically-splitting ordered set of K-buckets
//! over the 160 bit ID space, with liveness-based eviction and periodic
//! refresh targets.

mod bucket;
pub mod errors;
mod node;
mod prober;
mod table;

pub use crate::node::{Node, NodeSnapshot, NodeState};
pub use crate::prober::PingProber;
pub use crate::table::{RoutingTable, DEFAULT_CLOSEST, DEFAULT_K};
