use crate::active_transactions::{transaction_id_to_bytes, ActiveTransactions};
use crate::errors::{ErrorKind, Result};
use crate::response_future::ResponseFuture;
use failure::ResultExt;
use krpc_encoding::{Envelope, NodeID, NodeInfo, Query, Response};
use serde_bytes::ByteBuf;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time;

/// Queries which get no response within this window fail with
/// [`ErrorKind::Timeout`].
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// The send half of a KRPC endpoint. Builds queries, allocates transaction
/// IDs and awaits the matching response.
pub struct SendTransport {
    socket: Arc<UdpSocket>,

    /// Collection of in-flight transactions awaiting a response
    transactions: ActiveTransactions,

    timeout: Duration,
}

/// Response to a `find_node` query.
#[derive(Debug)]
pub struct FindNodeResponse {
    pub id: NodeID,
    pub nodes: Vec<NodeInfo>,
}

/// How an announced peer's port is derived.
pub enum PortType {
    /// Use the source port of the announce datagram.
    Implied,

    /// Use an explicit port.
    Port(u16),
}

/// The mutable-item fields of a `put` query. Absent for immutable values.
pub struct PutMutableArgs {
    /// Ed25519 public key (32 bytes)
    pub k: ByteBuf,

    /// Salt mixed into the target (at most 64 bytes)
    pub salt: Option<ByteBuf>,

    /// Sequence number of the record
    pub seq: i64,

    /// Ed25519 signature over the record (64 bytes)
    pub sig: ByteBuf,

    /// Expected stored sequence number, for compare-and-swap
    pub cas: Option<i64>,
}

impl SendTransport {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        transactions: ActiveTransactions,
        timeout: Duration,
    ) -> SendTransport {
        SendTransport {
            socket,
            transactions,
            timeout,
        }
    }

    /// Sends `query` to `address` and waits for the matching response.
    ///
    /// A remote `y='e'` message fails the returned future with
    /// [`ErrorKind::Remote`]; silence beyond the configured timeout fails it
    /// with [`ErrorKind::Timeout`]. A zero timeout waits forever.
    pub async fn request(&self, address: SocketAddr, query: Query) -> Result<Response> {
        let transaction_id = self.transactions.add_transaction()?;
        let envelope = Envelope::query(transaction_id_to_bytes(transaction_id), query);
        let encoded = envelope.encode().context(ErrorKind::EncodeError)?;

        self.socket
            .send_to(&encoded, address)
            .await
            .with_context(|_| ErrorKind::SendError { to: address })?;

        let response_future = ResponseFuture::new(transaction_id, self.transactions.clone());

        if self.timeout == Duration::from_secs(0) {
            response_future.await
        } else {
            match time::timeout(self.timeout, response_future).await {
                Ok(result) => result,
                Err(_) => Err(ErrorKind::Timeout { to: address }.into()),
            }
        }
    }

    pub async fn ping(&self, id: NodeID, address: SocketAddr) -> Result<NodeID> {
        let response = self.request(address, Query::Ping { id }).await?;
        require_id(&response)
    }

    pub async fn find_node(
        &self,
        id: NodeID,
        address: SocketAddr,
        target: NodeID,
    ) -> Result<FindNodeResponse> {
        let response = self.request(address, Query::FindNode { id, target }).await?;
        let responder = require_id(&response)?;

        Ok(FindNodeResponse {
            id: responder,
            nodes: response
                .nodes
                .ok_or(ErrorKind::MalformedResponse { field: "nodes" })?,
        })
    }

    pub async fn get_peers(
        &self,
        id: NodeID,
        address: SocketAddr,
        info_hash: NodeID,
    ) -> Result<Response> {
        self.request(address, Query::GetPeers { id, info_hash })
            .await
    }

    pub async fn announce_peer(
        &self,
        id: NodeID,
        address: SocketAddr,
        info_hash: NodeID,
        token: Vec<u8>,
        port_type: PortType,
    ) -> Result<NodeID> {
        let (implied_port, port) = match port_type {
            PortType::Implied => (true, None),
            PortType::Port(port) => (false, Some(port)),
        };

        let response = self
            .request(
                address,
                Query::AnnouncePeer {
                    id,
                    implied_port,
                    info_hash,
                    port,
                    token,
                },
            )
            .await?;

        require_id(&response)
    }

    pub async fn get(&self, id: NodeID, address: SocketAddr, target: NodeID) -> Result<Response> {
        self.request(address, Query::Get { id, target }).await
    }

    pub async fn put(
        &self,
        id: NodeID,
        address: SocketAddr,
        token: Vec<u8>,
        v: ByteBuf,
        mutable: Option<PutMutableArgs>,
    ) -> Result<NodeID> {
        let (cas, k, salt, seq, sig) = match mutable {
            Some(args) => (
                args.cas,
                Some(args.k),
                args.salt,
                Some(args.seq),
                Some(args.sig),
            ),
            None => (None, None, None, None, None),
        };

        let response = self
            .request(
                address,
                Query::Put {
                    cas,
                    id,
                    k,
                    salt,
                    seq,
                    sig,
                    token,
                    v,
                },
            )
            .await?;

        require_id(&response)
    }
}

fn require_id(response: &Response) -> Result<NodeID> {
    response
        .id
        .ok_or_else(|| ErrorKind::MalformedResponse { field: "id" }.into())
}
