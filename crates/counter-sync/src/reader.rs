//! Read synchronizer: keeps the cached counter value in step with the ledger
//!
//! Three things cause a `getCount` read: the polling cadence, event
//! deliveries from the live subscriptions, and explicit refreshes (issued by
//! the write coordinator after a confirmation). Event payloads are never
//! trusted as the value; they only schedule a re-read.
//!
//! Triggers that arrive while the polling task is busy collapse into a
//! single follow-up read. Every read carries a sequence number and a result
//! is only committed if no later-issued read has committed first, so the
//! cached value never moves backwards because of a slow response.

use crate::cancel::CancelToken;
use crate::ledger::{bounded, LedgerClient};
use crate::logger::{SessionEvent, SessionLogger};
use crate::types::{ActionKind, Address, CounterValue};
use crate::{Error, SyncConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

struct Run {
    contract: Address,
    cancel: CancelToken,
    trigger: Arc<Notify>,
}

struct ReaderInner {
    ledger: Arc<dyn LedgerClient>,
    config: SyncConfig,
    logger: Arc<SessionLogger>,
    value: watch::Sender<Option<CounterValue>>,
    tracked: Mutex<Option<Address>>,
    run: Mutex<Option<Run>>,
    issued: AtomicU64,
    committed: Mutex<u64>,
}

/// Read synchronizer
#[derive(Clone)]
pub struct ReadSynchronizer {
    inner: Arc<ReaderInner>,
}

impl ReadSynchronizer {
    /// Create an idle synchronizer with no cached value
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        config: SyncConfig,
        logger: Arc<SessionLogger>,
    ) -> Self {
        let (value, _) = watch::channel(None);
        Self {
            inner: Arc::new(ReaderInner {
                ledger,
                config,
                logger,
                value,
                tracked: Mutex::new(None),
                run: Mutex::new(None),
                issued: AtomicU64::new(0),
                committed: Mutex::new(0),
            }),
        }
    }

    /// Last fetched value, `None` before the first successful read
    pub fn current_value(&self) -> Option<CounterValue> {
        *self.inner.value.borrow()
    }

    /// Receiver notified whenever the cached value changes
    pub fn subscribe(&self) -> watch::Receiver<Option<CounterValue>> {
        self.inner.value.subscribe()
    }

    /// Whether polling and subscriptions are active
    pub fn is_running(&self) -> bool {
        self.inner.run.lock().is_some()
    }

    /// Start polling `contract` on the configured cadence and subscribe to
    /// both counter events.
    ///
    /// Returns `true` if a new run was started, `false` if `contract` was
    /// already being polled. Switching to another contract drops the cached
    /// value.
    pub fn schedule_polling(&self, contract: Address) -> bool {
        let run = {
            let mut run = self.inner.run.lock();
            if let Some(current) = run.as_ref() {
                if current.contract == contract {
                    return false;
                }
                current.cancel.cancel();
            }
            let next = Run {
                contract,
                cancel: CancelToken::new(),
                trigger: Arc::new(Notify::new()),
            };
            let handles = (next.cancel.clone(), next.trigger.clone());
            *run = Some(next);
            handles
        };

        let switched = {
            let mut tracked = self.inner.tracked.lock();
            let switched = tracked.map_or(false, |t| t != contract);
            *tracked = Some(contract);
            switched
        };
        if switched {
            self.inner.value.send_replace(None);
        }

        let (cancel, trigger) = run;
        tokio::spawn(poll_loop(
            self.inner.clone(),
            contract,
            cancel.clone(),
            trigger.clone(),
        ));
        for kind in ActionKind::ALL {
            tokio::spawn(subscription_loop(
                self.inner.clone(),
                contract,
                kind,
                cancel.clone(),
                trigger.clone(),
            ));
        }
        self.inner.logger.log(SessionEvent::Polling { active: true });
        true
    }

    /// Stop polling and drop subscriptions; the cached value is kept.
    ///
    /// Ticks and subscription registrations still scheduled are dropped
    /// silently.
    pub fn stop(&self) {
        if let Some(run) = self.inner.run.lock().take() {
            run.cancel.cancel();
            self.inner.logger.log(SessionEvent::Polling { active: false });
        }
    }

    /// Ask the polling task for an out-of-band read.
    ///
    /// Requests made while a read is in flight coalesce into one.
    pub fn request_refresh(&self) {
        if let Some(run) = self.inner.run.lock().as_ref() {
            run.trigger.notify_one();
        }
    }

    /// Read now and wait for the result.
    ///
    /// Does nothing while stopped. Returns the cached value afterwards,
    /// which may come from a later read that overtook this one.
    pub async fn refresh(&self) -> Option<CounterValue> {
        let contract = self.inner.run.lock().as_ref().map(|r| r.contract);
        if let Some(contract) = contract {
            self.inner.read_once(contract).await;
        }
        self.current_value()
    }
}

impl ReaderInner {
    async fn read_once(&self, contract: Address) {
        let seq = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        match bounded(self.config.call_timeout, self.ledger.get_count(contract)).await {
            Ok(value) => self.commit(seq, contract, value),
            Err(e) => {
                let error = Error::ReadFailure(e.to_string());
                self.logger.log(SessionEvent::ReadFailed {
                    error: error.to_string(),
                });
            }
        }
    }

    fn commit(&self, seq: u64, contract: Address, value: CounterValue) {
        if *self.tracked.lock() != Some(contract) {
            debug!("Dropping read for {} after contract switch", contract);
            return;
        }
        let mut committed = self.committed.lock();
        if seq <= *committed {
            debug!(
                "Dropping read #{} (value {}), read #{} already committed",
                seq, value, *committed
            );
            return;
        }
        *committed = seq;
        let changed = self.value.send_if_modified(|current| {
            if *current == Some(value) {
                false
            } else {
                *current = Some(value);
                true
            }
        });
        drop(committed);
        if changed {
            self.logger.log(SessionEvent::ValueUpdated { value });
        }
    }
}

async fn poll_loop(
    inner: Arc<ReaderInner>,
    contract: Address,
    cancel: CancelToken,
    trigger: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let woke = cancel
            .run_until_cancelled(async {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = trigger.notified() => {}
                }
            })
            .await;
        if woke.is_none() {
            break;
        }
        inner.read_once(contract).await;
    }
    debug!("Polling for {} stopped", contract);
}

async fn subscription_loop(
    inner: Arc<ReaderInner>,
    contract: Address,
    kind: ActionKind,
    cancel: CancelToken,
    trigger: Arc<Notify>,
) {
    loop {
        let registered = cancel
            .run_until_cancelled(bounded(
                inner.config.call_timeout,
                inner.ledger.subscribe(contract, kind),
            ))
            .await;
        let mut subscription = match registered {
            None => return,
            Some(Ok(subscription)) => subscription,
            Some(Err(e)) => {
                warn!("Subscribing to {} events failed: {}", kind, e);
                if cancel
                    .run_until_cancelled(tokio::time::sleep(inner.config.poll_interval))
                    .await
                    .is_none()
                {
                    return;
                }
                continue;
            }
        };

        loop {
            match cancel.run_until_cancelled(subscription.next()).await {
                None => return,
                Some(Some(log)) => {
                    debug!(
                        kind = %log.kind,
                        block_number = log.block_number,
                        "Counter event delivered, scheduling re-read"
                    );
                    trigger.notify_one();
                }
                Some(None) => {
                    warn!("{} subscription closed, re-registering", kind);
                    break;
                }
            }
        }
    }
}
