use crate::errors::{ErrorKind, Result};
use failure::ResultExt;
use krpc_encoding::{Envelope, KRPCError, Query, Response};
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// A query received from a remote node, paired with the handle used to
/// answer it.
pub struct InboundQuery {
    /// Transport address the datagram was received from. Authoritative for
    /// token binding regardless of the `id` the sender claims.
    pub sender: SocketAddrV4,

    pub query: Query,

    pub responder: Responder,
}

/// One-shot handle sending a response or error back to the querying node,
/// echoing its transaction ID.
pub struct Responder {
    socket: Arc<UdpSocket>,
    peer: SocketAddrV4,
    transaction_id: Vec<u8>,
}

impl Responder {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddrV4,
        transaction_id: Vec<u8>,
    ) -> Responder {
        Responder {
            socket,
            peer,
            transaction_id,
        }
    }

    pub async fn respond(self, response: Response) -> Result<()> {
        let envelope = Envelope::response(self.transaction_id.clone(), response);
        self.send(&envelope).await
    }

    pub async fn error(self, error: KRPCError) -> Result<()> {
        let envelope = Envelope::error(self.transaction_id.clone(), error);
        self.send(&envelope).await
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let encoded = envelope.encode().context(ErrorKind::EncodeError)?;

        self.socket
            .send_to(&encoded, std::net::SocketAddr::V4(self.peer))
            .await
            .with_context(|_| ErrorKind::SendError {
                to: std::net::SocketAddr::V4(self.peer),
            })?;

        Ok(())
    }
}
