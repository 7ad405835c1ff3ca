//! Capability interfaces consumed by the engine
//!
//! The ledger (read calls, log queries, lookups, event delivery) and the
//! wallet (current account, current network, sign & broadcast) are external
//! collaborators. Everything in the engine talks to them through these
//! traits so the JSON-RPC adapter and the in-memory test ledger are
//! interchangeable.

use crate::cancel::CancelToken;
use crate::types::{
    ActionKind, Address, BlockInfo, CounterValue, LedgerLog, LogFilter, Receipt, TxHash, TxInfo,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

/// Read-side ledger capability
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Chain id of the node
    async fn chain_id(&self) -> Result<u64>;

    /// Latest block number
    async fn block_number(&self) -> Result<u64>;

    /// `getCount()` on the counter contract
    async fn get_count(&self, contract: Address) -> Result<CounterValue>;

    /// Logs of one event kind over an inclusive block range, in ledger order
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<LedgerLog>>;

    /// Transaction lookup; `None` when the node does not know it
    async fn get_transaction(&self, hash: TxHash) -> Result<Option<TxInfo>>;

    /// Block lookup; `None` when the block does not exist
    async fn get_block(&self, number: u64) -> Result<Option<BlockInfo>>;

    /// Receipt lookup; `None` while the transaction is unconfirmed
    async fn get_receipt(&self, hash: TxHash) -> Result<Option<Receipt>>;

    /// Best-effort revert reason for a failed transaction
    async fn revert_reason(&self, hash: TxHash) -> Result<Option<String>>;

    /// Register a push-style listener for one event kind
    async fn subscribe(&self, contract: Address, kind: ActionKind) -> Result<EventSubscription>;
}

/// Wallet capability supplied by the account provider
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Connected account, `None` when disconnected
    async fn account(&self) -> Result<Option<Address>>;

    /// Chain the wallet is currently on
    async fn chain_id(&self) -> Result<Option<u64>>;

    /// Sign and broadcast a call to `to`.
    ///
    /// Implementations report a declined signature or a pre-flight failure
    /// as [`Error::WriteRejected`].
    async fn send_transaction(&self, kind: ActionKind, to: Address, data: Vec<u8>)
        -> Result<TxHash>;
}

/// Live event delivery for one event kind.
///
/// Dropping the subscription unsubscribes: the producer observes the
/// cancellation and tears down whatever it registered with the node.
pub struct EventSubscription {
    kind: ActionKind,
    receiver: mpsc::Receiver<LedgerLog>,
    cancel: CancelToken,
}

impl EventSubscription {
    /// Create a subscription and the sender half the producer feeds.
    ///
    /// The producer should stop once `cancel` fires or the sender errors.
    pub fn channel(kind: ActionKind, buffer: usize) -> (Self, mpsc::Sender<LedgerLog>, CancelToken) {
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancelToken::new();
        (
            Self {
                kind,
                receiver: rx,
                cancel: cancel.clone(),
            },
            tx,
            cancel,
        )
    }

    /// Event kind delivered
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Next delivered log, `None` once the producer has stopped
    pub async fn next(&mut self) -> Option<LedgerLog> {
        self.receiver.recv().await
    }

    /// Stop delivery
    pub fn unsubscribe(self) {}
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Apply the per-call timeout; expiry becomes a retryable [`Error::Timeout`]
pub async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let err = bounded::<(), _>(Duration::from_secs(15), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_secs(15)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bounded_passes_result() {
        let value = bounded(Duration::from_secs(1), async { Ok(5u8) })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let (sub, tx, cancel) = EventSubscription::channel(ActionKind::Increment, 4);
        assert_eq!(sub.kind(), ActionKind::Increment);
        assert!(!cancel.is_cancelled());
        sub.unsubscribe();
        assert!(cancel.is_cancelled());
        assert!(tx.is_closed());
    }
}
