use crate::errors::{ErrorKind, Result};
use byteorder::{ByteOrder, NetworkEndian};
use krpc_encoding::{KRPCError, Response};
use log::debug;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::task::{Poll, Waker};

/// Locally allocated identifier correlating a query with its response. Sent
/// on the wire as 4 big-endian bytes.
pub type TransactionId = u32;

pub(crate) fn transaction_id_to_bytes(transaction_id: TransactionId) -> Vec<u8> {
    let mut bytes = vec![0u8; 4];
    NetworkEndian::write_u32(&mut bytes, transaction_id);
    bytes
}

pub(crate) fn transaction_id_from_bytes(bytes: &[u8]) -> Option<TransactionId> {
    if bytes.len() != 4 {
        return None;
    }

    Some(NetworkEndian::read_u32(bytes))
}

/// State of one in-flight transaction.
enum TxState {
    AwaitingResponse { waker: Option<Waker> },
    GotResponse { response: Response },
    GotError { error: KRPCError },
    Cancelled,
}

/// Collection of in-flight transactions awaiting a response.
///
/// Cloning is cheap and shares the same underlying map between the send and
/// receive halves of a transport.
#[derive(Clone)]
pub struct ActiveTransactions {
    transactions: Arc<Mutex<HashMap<TransactionId, TxState>>>,
}

impl ActiveTransactions {
    pub fn new() -> ActiveTransactions {
        ActiveTransactions {
            transactions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allocates a transaction ID unique among the outstanding set by
    /// rejection sampling, and registers it as awaiting a response.
    pub fn add_transaction(&self) -> Result<TransactionId> {
        let mut map = self
            .transactions
            .lock()
            .map_err(|_| ErrorKind::LockPoisoned)?;

        let mut rng = rand::thread_rng();
        let transaction_id = loop {
            let candidate: TransactionId = rng.gen();
            if !map.contains_key(&candidate) {
                break candidate;
            }
        };

        map.insert(
            transaction_id,
            TxState::AwaitingResponse { waker: None },
        );

        Ok(transaction_id)
    }

    /// Resolves a transaction with the peer's response. Returns `false` when
    /// the transaction is unknown, in which case the caller drops the
    /// message.
    pub fn resolve(&self, transaction_id: TransactionId, response: Response) -> Result<bool> {
        self.complete(transaction_id, TxState::GotResponse { response })
    }

    /// Fails a transaction with a remote-signalled KRPC error.
    pub fn fail(&self, transaction_id: TransactionId, error: KRPCError) -> Result<bool> {
        self.complete(transaction_id, TxState::GotError { error })
    }

    fn complete(&self, transaction_id: TransactionId, next: TxState) -> Result<bool> {
        let mut map = self
            .transactions
            .lock()
            .map_err(|_| ErrorKind::LockPoisoned)?;

        match map.get_mut(&transaction_id) {
            Some(state @ TxState::AwaitingResponse { .. }) => {
                let previous = std::mem::replace(state, next);
                if let TxState::AwaitingResponse { waker: Some(waker) } = previous {
                    waker.wake();
                }
                Ok(true)
            }
            Some(_) => {
                debug!("transaction {:x} completed twice", transaction_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Polled by [`ResponseFuture`]. Parks the waker until the receive side
    /// completes the transaction.
    ///
    /// [`ResponseFuture`]: crate::response_future::ResponseFuture
    pub(crate) fn poll_response(
        &self,
        transaction_id: TransactionId,
        waker: &Waker,
    ) -> Poll<Result<Response>> {
        let mut map = match self.transactions.lock() {
            Ok(map) => map,
            Err(_) => return Poll::Ready(Err(ErrorKind::LockPoisoned.into())),
        };

        match map.get_mut(&transaction_id) {
            None => Poll::Ready(Err(ErrorKind::Disposed.into())),
            Some(TxState::AwaitingResponse { waker: parked }) => {
                *parked = Some(waker.clone());
                Poll::Pending
            }
            Some(_) => match map.remove(&transaction_id) {
                Some(TxState::GotResponse { response }) => Poll::Ready(Ok(response)),
                Some(TxState::GotError { error }) => {
                    Poll::Ready(Err(ErrorKind::Remote { error }.into()))
                }
                _ => Poll::Ready(Err(ErrorKind::Disposed.into())),
            },
        }
    }

    /// Forgets a transaction, usually because its future was dropped after a
    /// timeout.
    pub fn remove(&self, transaction_id: TransactionId) {
        if let Ok(mut map) = self.transactions.lock() {
            map.remove(&transaction_id);
        }
    }

    /// Rejects every outstanding transaction with the disposal sentinel and
    /// wakes their futures.
    pub fn cancel_all(&self) {
        if let Ok(mut map) = self.transactions.lock() {
            for state in map.values_mut() {
                let previous = std::mem::replace(state, TxState::Cancelled);
                if let TxState::AwaitingResponse { waker: Some(waker) } = previous {
                    waker.wake();
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.transactions.lock().map(|map| map.len()).unwrap_or(0)
    }
}

impl Default for ActiveTransactions {
    fn default() -> ActiveTransactions {
        ActiveTransactions::new()
    }
}
