//! Bounded retry of transactional work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::context::Transaction;
use super::error::{TransactionError, TransactionResult};
use crate::store::WriteSetStore;

/// A unit of work executed inside a fresh transaction per attempt.
///
/// `run` must be safe to call again: everything it wants to persist goes
/// through the transaction, which is discarded on failure.
#[async_trait]
pub trait TransactionalWork: Send + Sync {
    /// Value produced by a committed attempt.
    type Output: Send;

    /// Stage writes and register listeners on `tx`.
    async fn run(&self, tx: &mut Transaction) -> TransactionResult<Self::Output>;
}

/// Runs work in transactions, retrying transient failures.
pub struct TransactionRunner<S: ?Sized> {
    store: Arc<S>,
    max_transient_retries: u32,
    retry_backoff: Duration,
}

impl<S> TransactionRunner<S>
where
    S: WriteSetStore + ?Sized,
{
    /// Create a runner committing to `store`.
    #[must_use]
    pub fn new(store: Arc<S>, max_transient_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            store,
            max_transient_retries,
            retry_backoff,
        }
    }

    /// Run `work` until it commits, fails permanently, or runs out of
    /// transient retries.
    ///
    /// # Errors
    ///
    /// Returns the permanent failure as-is, or
    /// `TransactionError::RetriesExhausted` wrapping the last transient one.
    pub async fn execute<W>(&self, work: &W) -> TransactionResult<W::Output>
    where
        W: TransactionalWork + ?Sized,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);

            let mut tx = Transaction::begin();
            let tx_id = tx.id().clone();
            let result = match work.run(&mut tx).await {
                Ok(output) => tx.commit(self.store.as_ref()).await.map(|()| output),
                Err(err) => {
                    tx.rollback().await;
                    Err(err)
                }
            };

            match result {
                Ok(output) => return Ok(output),
                Err(err) if err.is_transient() && attempt <= self.max_transient_retries => {
                    warn!(
                        transaction_id = %tx_id,
                        attempt,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    let delay = self.retry_backoff.saturating_mul(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) if err.is_transient() => {
                    debug!(transaction_id = %tx_id, attempt, "Transient retries exhausted");
                    return Err(TransactionError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<S: ?Sized> std::fmt::Debug for TransactionRunner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRunner")
            .field("max_transient_retries", &self.max_transient_retries)
            .field("retry_backoff", &self.retry_backoff)
            .finish_non_exhaustive()
    }
}
