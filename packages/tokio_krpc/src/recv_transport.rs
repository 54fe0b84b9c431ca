use crate::active_transactions::{transaction_id_from_bytes, ActiveTransactions};
use crate::errors::{ErrorKind, Result};
use crate::inbound::{InboundQuery, Responder};
use crate::send_transport::SendTransport;
use failure::ResultExt;
use futures::channel::mpsc;
use krpc_encoding::{Envelope, MessageType};
use log::{debug, warn};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// The receive half of a KRPC endpoint. Owns the socket loop which routes
/// responses and errors to their transactions and surfaces inbound queries
/// as a stream.
pub struct RecvTransport {
    socket: Arc<UdpSocket>,
    transactions: ActiveTransactions,
}

impl RecvTransport {
    pub async fn bind(addr: SocketAddr) -> Result<RecvTransport> {
        let socket = UdpSocket::bind(addr).await.context(ErrorKind::BindError)?;

        Ok(RecvTransport {
            socket: Arc::new(socket),
            transactions: ActiveTransactions::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr().context(ErrorKind::BindError)?)
    }

    /// Shared transaction map, used at teardown to reject everything
    /// outstanding.
    pub fn transactions(&self) -> ActiveTransactions {
        self.transactions.clone()
    }

    /// Builds the matching send half with the given query timeout. A zero
    /// duration disables the timeout.
    pub fn send_transport(&self, timeout: Duration) -> SendTransport {
        SendTransport::new(self.socket.clone(), self.transactions.clone(), timeout)
    }

    /// Spawns the socket loop. Inbound queries arrive on the returned
    /// receiver; responses and errors resolve their transactions inline.
    ///
    /// The loop runs until the task is aborted or the query receiver is
    /// dropped. Malformed datagrams and unknown transactions are logged and
    /// dropped; receive errors do not stop the loop.
    pub fn serve(&self) -> (mpsc::UnboundedReceiver<InboundQuery>, JoinHandle<()>) {
        let (queries_tx, queries_rx) = mpsc::unbounded();
        let socket = self.socket.clone();
        let transactions = self.transactions.clone();

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];

            loop {
                let (len, sender) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(cause) => {
                        warn!("socket receive error: {}", cause);
                        continue;
                    }
                };

                let sender = match sender {
                    SocketAddr::V4(sender) => sender,
                    SocketAddr::V6(..) => {
                        debug!("dropping datagram from IPv6 sender {}", sender);
                        continue;
                    }
                };

                if !handle_datagram(&buf[..len], sender, &socket, &transactions, &queries_tx) {
                    break;
                }
            }
        });

        (queries_rx, handle)
    }
}

/// Returns `false` once the query receiver has gone away and the loop
/// should stop.
fn handle_datagram(
    datagram: &[u8],
    sender: SocketAddrV4,
    socket: &Arc<UdpSocket>,
    transactions: &ActiveTransactions,
    queries_tx: &mpsc::UnboundedSender<InboundQuery>,
) -> bool {
    let envelope = match Envelope::decode(datagram) {
        Ok(envelope) => envelope,
        Err(cause) => {
            debug!("dropping malformed datagram from {}: {}", sender, cause);
            return true;
        }
    };

    match envelope.message_type {
        MessageType::Query { query } => {
            let responder = Responder::new(socket.clone(), sender, envelope.transaction_id);
            let inbound = InboundQuery {
                sender,
                query,
                responder,
            };

            queries_tx.unbounded_send(inbound).is_ok()
        }
        MessageType::Response { response } => {
            match transaction_id_from_bytes(&envelope.transaction_id) {
                Some(transaction_id) => match transactions.resolve(transaction_id, response) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(
                            "dropping response for unknown transaction {:x} from {}",
                            transaction_id, sender
                        );
                    }
                    Err(cause) => warn!("failed to resolve transaction: {}", cause),
                },
                None => debug!("dropping response with malformed transaction id from {}", sender),
            }

            true
        }
        MessageType::Error { error } => {
            match transaction_id_from_bytes(&envelope.transaction_id) {
                Some(transaction_id) => match transactions.fail(transaction_id, error) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(
                            "dropping error for unknown transaction {:x} from {}",
                            transaction_id, sender
                        );
                    }
                    Err(cause) => warn!("failed to fail transaction: {}", cause),
                },
                None => debug!("dropping error with malformed transaction id from {}", sender),
            }

            true
        }
    }
}
