//! Write coordinator: submission and confirmation tracking of counter writes
//!
//! Each accepted write gets its own tracker task that polls for the receipt.
//! Writes are tracked independently; increments and decrements may be in
//! flight together. The busy signal is the OR over everything pending.

use crate::abi;
use crate::cancel::CancelToken;
use crate::guard::NetworkGuard;
use crate::ledger::{bounded, LedgerClient, WalletProvider};
use crate::logger::{SessionEvent, SessionLogger};
use crate::reader::ReadSynchronizer;
use crate::types::{ActionKind, TxHash};
use crate::{Error, Result, SyncConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Lifecycle of a submitted write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Lifecycle {
    /// Accepted by the wallet
    Submitted,
    /// Waiting for a receipt
    Pending,
    /// Included successfully; the value has been re-read
    Confirmed {
        /// Inclusion block
        block_number: u64,
    },
    /// Reverted, or tracking was abandoned
    Failed {
        /// Operator-facing failure
        error: String,
        /// Decoded revert reason
        reason: Option<String>,
    },
}

impl Lifecycle {
    /// Whether no further transition will happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::Failed { .. })
    }
}

/// Handle to one submitted write
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    id: TxHash,
    kind: ActionKind,
    lifecycle: watch::Receiver<Lifecycle>,
}

impl PendingTransaction {
    /// Transaction hash
    pub fn id(&self) -> TxHash {
        self.id
    }

    /// Write kind
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.borrow().clone()
    }

    /// Wait for the terminal state
    pub async fn settled(&mut self) -> Lifecycle {
        let settled = self
            .lifecycle
            .wait_for(Lifecycle::is_terminal)
            .await
            .map(|state| state.clone());
        // Tracker gone without a terminal state
        settled.unwrap_or_else(|_| self.lifecycle())
    }
}

/// Writes in flight, per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFlags {
    /// Increments in flight
    pub increments: usize,
    /// Decrements in flight
    pub decrements: usize,
}

impl PendingFlags {
    /// Any write in flight
    pub fn busy(&self) -> bool {
        self.increments + self.decrements > 0
    }

    /// A write of `kind` is in flight
    pub fn is_pending(&self, kind: ActionKind) -> bool {
        match kind {
            ActionKind::Increment => self.increments > 0,
            ActionKind::Decrement => self.decrements > 0,
        }
    }
}

/// Terminal result of a tracked write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Transaction hash
    pub id: TxHash,
    /// Write kind
    pub kind: ActionKind,
    /// Terminal lifecycle state
    pub lifecycle: Lifecycle,
}

struct WriterInner {
    ledger: Arc<dyn LedgerClient>,
    wallet: Arc<dyn WalletProvider>,
    reader: ReadSynchronizer,
    config: SyncConfig,
    logger: Arc<SessionLogger>,
    in_flight: Mutex<HashMap<TxHash, ActionKind>>,
    flags: watch::Sender<PendingFlags>,
    outcomes: broadcast::Sender<WriteOutcome>,
    cancel: CancelToken,
}

/// Write coordinator
#[derive(Clone)]
pub struct WriteCoordinator {
    inner: Arc<WriterInner>,
}

impl WriteCoordinator {
    /// Create a coordinator that refreshes `reader` after every confirmation
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        wallet: Arc<dyn WalletProvider>,
        reader: ReadSynchronizer,
        config: SyncConfig,
        logger: Arc<SessionLogger>,
    ) -> Self {
        let (flags, _) = watch::channel(PendingFlags::default());
        let (outcomes, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(WriterInner {
                ledger,
                wallet,
                reader,
                config,
                logger,
                in_flight: Mutex::new(HashMap::new()),
                flags,
                outcomes,
                cancel: CancelToken::new(),
            }),
        }
    }

    /// Submit a write.
    ///
    /// Fails with [`Error::NetworkMismatch`] or [`Error::NotConnected`] when
    /// `guard` does not allow interaction, and with [`Error::WriteRejected`]
    /// when the wallet declines. No handle exists in either case.
    pub async fn submit(&self, kind: ActionKind, guard: &NetworkGuard) -> Result<PendingTransaction> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let contract = guard.check()?;

        let sent = self
            .inner
            .wallet
            .send_transaction(kind, contract, abi::write_calldata(kind))
            .await;
        let id = match sent {
            Ok(id) => id,
            Err(e) => {
                let e = match e {
                    Error::WriteRejected { .. } => e,
                    other => Error::WriteRejected {
                        kind,
                        message: other.to_string(),
                    },
                };
                self.inner.logger.log(SessionEvent::WriteFailed {
                    kind,
                    tx: None,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Submitted);
        self.inner.in_flight.lock().insert(id, kind);
        self.inner.publish_flags();
        self.inner
            .logger
            .log(SessionEvent::WriteSubmitted { kind, tx: id });

        tokio::spawn(track(self.inner.clone(), id, kind, lifecycle_tx));

        Ok(PendingTransaction {
            id,
            kind,
            lifecycle: lifecycle_rx,
        })
    }

    /// Writes currently in flight
    pub fn pending(&self) -> PendingFlags {
        *self.inner.flags.borrow()
    }

    /// Receiver notified whenever the in-flight set changes
    pub fn subscribe_pending(&self) -> watch::Receiver<PendingFlags> {
        self.inner.flags.subscribe()
    }

    /// Stream of terminal outcomes
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<WriteOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Stop tracking; in-flight writes end as failed
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

impl WriterInner {
    fn publish_flags(&self) {
        let flags = self
            .in_flight
            .lock()
            .values()
            .fold(PendingFlags::default(), |mut flags, kind| {
                match kind {
                    ActionKind::Increment => flags.increments += 1,
                    ActionKind::Decrement => flags.decrements += 1,
                }
                flags
            });
        self.flags.send_if_modified(|current| {
            if *current == flags {
                false
            } else {
                *current = flags;
                true
            }
        });
    }

    fn finish(
        &self,
        id: TxHash,
        kind: ActionKind,
        lifecycle_tx: &watch::Sender<Lifecycle>,
        lifecycle: Lifecycle,
    ) {
        self.in_flight.lock().remove(&id);
        self.publish_flags();
        lifecycle_tx.send_replace(lifecycle.clone());
        let _ = self.outcomes.send(WriteOutcome {
            id,
            kind,
            lifecycle,
        });
    }
}

async fn track(
    inner: Arc<WriterInner>,
    id: TxHash,
    kind: ActionKind,
    lifecycle_tx: watch::Sender<Lifecycle>,
) {
    lifecycle_tx.send_replace(Lifecycle::Pending);

    let receipt = loop {
        let lookup = inner
            .cancel
            .run_until_cancelled(bounded(
                inner.config.call_timeout,
                inner.ledger.get_receipt(id),
            ))
            .await;
        match lookup {
            None => {
                let error = Error::Cancelled.to_string();
                inner.logger.log(SessionEvent::WriteFailed {
                    kind,
                    tx: Some(id),
                    error: error.clone(),
                });
                inner.finish(id, kind, &lifecycle_tx, Lifecycle::Failed { error, reason: None });
                return;
            }
            Some(Ok(Some(receipt))) => break receipt,
            Some(Ok(None)) => {}
            Some(Err(e)) => debug!("Receipt lookup for {} failed: {}", id, e),
        }
        // Cancellation is picked up by the next lookup
        let _ = inner
            .cancel
            .run_until_cancelled(tokio::time::sleep(inner.config.receipt_poll_interval))
            .await;
    };

    if receipt.success {
        inner.logger.log(SessionEvent::WriteConfirmed {
            kind,
            tx: id,
            block_number: receipt.block_number,
        });
        inner.reader.refresh().await;
        inner.finish(
            id,
            kind,
            &lifecycle_tx,
            Lifecycle::Confirmed {
                block_number: receipt.block_number,
            },
        );
    } else {
        let reason = match bounded(inner.config.call_timeout, inner.ledger.revert_reason(id)).await
        {
            Ok(reason) => reason,
            Err(e) => {
                warn!("Revert reason for {} unavailable: {}", id, e);
                None
            }
        };
        let error = Error::WriteReverted {
            reason: reason.clone(),
        };
        inner.logger.log(SessionEvent::WriteFailed {
            kind,
            tx: Some(id),
            error: error.to_string(),
        });
        inner.finish(
            id,
            kind,
            &lifecycle_tx,
            Lifecycle::Failed {
                error: error.to_string(),
                reason,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{address, MockLedger, MockWallet, MOCK_CHAIN_ID};
    use crate::types::CounterValue;
    use std::time::Duration;

    struct Fixture {
        ledger: Arc<MockLedger>,
        wallet: Arc<MockWallet>,
        reader: ReadSynchronizer,
        writer: WriteCoordinator,
        guard: NetworkGuard,
    }

    fn fixture(count: u64) -> Fixture {
        let ledger = MockLedger::with_count(count);
        let wallet = MockWallet::connected(ledger.clone(), address(1));
        let logger = Arc::new(SessionLogger::default());
        let reader = ReadSynchronizer::new(ledger.clone(), SyncConfig::default(), logger.clone());
        let writer = WriteCoordinator::new(
            ledger.clone(),
            wallet.clone(),
            reader.clone(),
            SyncConfig::default(),
            logger,
        );
        let mut guard = NetworkGuard::new();
        guard.set_account(Some(address(1)));
        guard.set_active_network(Some(MOCK_CHAIN_ID));
        guard.set_config(Some(MOCK_CHAIN_ID), Some(ledger.contract()));
        Fixture {
            ledger,
            wallet,
            reader,
            writer,
            guard,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_confirms_and_refreshes() {
        let f = fixture(0);
        f.reader.schedule_polling(f.ledger.contract());
        f.ledger.set_auto_mine(false);

        let mut tx = f.writer.submit(ActionKind::Increment, &f.guard).await.unwrap();
        assert_eq!(tx.kind(), ActionKind::Increment);
        assert!(f.writer.pending().busy());
        assert!(f.writer.pending().is_pending(ActionKind::Increment));
        assert!(!f.writer.pending().is_pending(ActionKind::Decrement));

        // The value is never moved ahead of confirmation
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.reader.current_value(), Some(CounterValue::from(0u64)));

        f.ledger.mine(tx.id());
        let state = tx.settled().await;
        assert!(matches!(state, Lifecycle::Confirmed { .. }));
        assert_eq!(f.reader.current_value(), Some(CounterValue::from(1u64)));
        assert!(!f.writer.pending().busy());
        f.reader.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_failure_creates_no_handle() {
        let mut f = fixture(1);
        f.guard.set_active_network(Some(84_532));
        let err = f
            .writer
            .submit(ActionKind::Increment, &f.guard)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NetworkMismatch { .. }));

        f.guard.set_active_network(Some(MOCK_CHAIN_ID));
        f.guard.set_account(None);
        let err = f
            .writer
            .submit(ActionKind::Increment, &f.guard)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(!f.writer.pending().busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wallet_rejection() {
        let f = fixture(1);
        f.ledger.reject_sends(Some("User denied transaction signature"));
        let err = f
            .writer
            .submit(ActionKind::Decrement, &f.guard)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WriteRejected { kind: ActionKind::Decrement, .. }));
        assert!(err.is_user_visible());
        assert!(!f.writer.pending().busy());
        assert_eq!(f.ledger.count(), CounterValue::from(1u64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wallet_disconnect_maps_to_rejection() {
        let f = fixture(1);
        f.wallet.set_account(None);
        let err = f
            .writer
            .submit(ActionKind::Increment, &f.guard)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WriteRejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_surfaces_reason() {
        let f = fixture(0);
        f.reader.schedule_polling(f.ledger.contract());
        let mut outcomes = f.writer.subscribe_outcomes();

        let mut tx = f.writer.submit(ActionKind::Decrement, &f.guard).await.unwrap();
        let state = tx.settled().await;
        assert_eq!(
            state,
            Lifecycle::Failed {
                error: "Transaction reverted: Counter: underflow".to_string(),
                reason: Some("Counter: underflow".to_string()),
            }
        );
        assert_eq!(f.reader.current_value(), Some(CounterValue::from(0u64)));

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.id, tx.id());
        assert_eq!(outcome.lifecycle, state);
        f.reader.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_kinds_tracked_independently() {
        let f = fixture(1);
        f.ledger.set_auto_mine(false);
        let mut inc = f.writer.submit(ActionKind::Increment, &f.guard).await.unwrap();
        let mut dec = f.writer.submit(ActionKind::Decrement, &f.guard).await.unwrap();
        assert_eq!(
            f.writer.pending(),
            PendingFlags {
                increments: 1,
                decrements: 1
            }
        );

        f.ledger.mine(dec.id());
        assert!(matches!(dec.settled().await, Lifecycle::Confirmed { .. }));
        assert!(f.writer.pending().busy());
        assert!(!f.writer.pending().is_pending(ActionKind::Decrement));

        f.ledger.mine(inc.id());
        assert!(matches!(inc.settled().await, Lifecycle::Confirmed { .. }));
        assert!(!f.writer.pending().busy());
        assert_eq!(f.ledger.count(), CounterValue::from(1u64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_tracking() {
        let f = fixture(1);
        f.ledger.set_auto_mine(false);
        let mut tx = f.writer.submit(ActionKind::Increment, &f.guard).await.unwrap();
        f.writer.shutdown();
        assert!(matches!(tx.settled().await, Lifecycle::Failed { .. }));
        assert!(!f.writer.pending().busy());
        assert!(matches!(
            f.writer.submit(ActionKind::Increment, &f.guard).await,
            Err(Error::Cancelled)
        ));
    }
}
