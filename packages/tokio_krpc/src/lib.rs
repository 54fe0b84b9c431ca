//! Transaction-oriented KRPC over a single UDP socket: outbound queries are
//! correlated with responses through locally allocated 4 byte transaction
//! IDs, inbound queries are surfaced as a stream, and everything shares one
//! socket.

mod active_transactions;
pub mod errors;
mod inbound;
mod recv_transport;
mod response_future;
mod send_transport;

pub use crate::active_transactions::{ActiveTransactions, TransactionId};
pub use crate::inbound::{InboundQuery, Responder};
pub use crate::recv_transport::RecvTransport;
pub use crate::send_transport::{
    FindNodeResponse, PortType, PutMutableArgs, SendTransport, DEFAULT_QUERY_TIMEOUT,
};
