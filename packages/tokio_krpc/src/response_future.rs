use crate::active_transactions::{ActiveTransactions, TransactionId};
use crate::errors::Result;
use krpc_encoding::Response;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A future which resolves when the response for a transaction appears in
/// the shared transaction map.
///
/// Dropping the future deregisters the transaction, so a response arriving
/// after a timeout is treated as unknown and dropped.
pub(crate) struct ResponseFuture {
    transaction_id: TransactionId,
    transactions: ActiveTransactions,
}

impl ResponseFuture {
    pub(crate) fn new(
        transaction_id: TransactionId,
        transactions: ActiveTransactions,
    ) -> ResponseFuture {
        ResponseFuture {
            transaction_id,
            transactions,
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.transactions
            .poll_response(self.transaction_id, cx.waker())
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        self.transactions.remove(self.transaction_id);
    }
}
