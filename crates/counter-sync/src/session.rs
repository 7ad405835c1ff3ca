//! Counter session: the orchestrator the UI talks to
//!
//! Inputs arrive as named change notifications (configuration, account,
//! network). Each one re-evaluates the network guard and starts or stops
//! polling. Polling and subscriptions run iff the configuration is ready
//! with an address and the wallet is not on the wrong network. The activity
//! feed is rebuilt whenever polling (re)starts, whenever the counter value
//! changes, and whenever one of our writes confirms.
//!
//! Everything the UI renders is published as an immutable [`SessionSnapshot`].

use crate::activity::{ActivityReconstructor, Feed};
use crate::cancel::CancelToken;
use crate::config::ConfigState;
use crate::guard::{NetworkGuard, NetworkStatus};
use crate::ledger::{LedgerClient, WalletProvider};
use crate::logger::{SessionEvent, SessionLogger};
use crate::reader::ReadSynchronizer;
use crate::types::{ActionKind, Address, CounterValue};
use crate::warning::{Decision, DecrementWarning, WarningPolicy};
use crate::writer::{Lifecycle, PendingFlags, PendingTransaction, WriteCoordinator, WriteOutcome};
use crate::{Result, SyncConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// What the UI should show in place of the controls, if anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    /// Configuration is being fetched
    Loading,
    /// Configuration failed; retry pending
    ConfigError(String),
    /// Configuration ready but no contract deployed
    NotConfigured,
    /// Wallet is on another chain
    WrongNetwork {
        /// Chain the wallet is on
        active: u64,
        /// Chain the contract lives on
        expected: u64,
        /// Display name of the expected chain
        label: String,
    },
    /// No wallet account connected
    Disconnected,
    /// Controls enabled
    Ready,
}

/// Read-only view of the whole session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Configuration status
    pub config: ConfigState,
    /// Guard inputs and derived flags
    pub network: NetworkStatus,
    /// Last fetched counter value
    pub value: Option<CounterValue>,
    /// Activity feed, newest first
    pub feed: Feed,
    /// Writes in flight per kind
    pub pending: PendingFlags,
    /// Active decrement warning
    pub warning: Option<DecrementWarning>,
    /// Polling and subscriptions running
    pub polling: bool,
}

impl SessionSnapshot {
    /// Both controls disabled while anything is in flight
    pub fn busy(&self) -> bool {
        self.pending.busy()
    }

    /// Banner/placeholder selection
    pub fn view(&self) -> ViewState {
        match &self.config {
            ConfigState::Loading => return ViewState::Loading,
            ConfigState::Error { message } => return ViewState::ConfigError(message.clone()),
            ConfigState::Ready(config) if config.contract_address.is_none() => {
                return ViewState::NotConfigured
            }
            ConfigState::Ready(_) => {}
        }
        if let (true, Some(active), Some(expected)) = (
            self.network.mismatched,
            self.network.active_id,
            self.network.expected_id,
        ) {
            return ViewState::WrongNetwork {
                active,
                expected,
                label: self
                    .network
                    .expected_label
                    .clone()
                    .unwrap_or_else(|| format!("chain {}", expected)),
            };
        }
        if !self.network.connected {
            return ViewState::Disconnected;
        }
        ViewState::Ready
    }
}

/// Result of a decrement request
#[derive(Debug, Clone)]
pub enum DecrementOutcome {
    /// Forwarded to the write coordinator
    Submitted(PendingTransaction),
    /// Held by the warning policy
    Warned(DecrementWarning),
}

struct SessionInner {
    wallet: Arc<dyn WalletProvider>,
    logger: Arc<SessionLogger>,
    guard: Mutex<NetworkGuard>,
    config_state: Mutex<ConfigState>,
    warning: Mutex<WarningPolicy>,
    reader: ReadSynchronizer,
    writer: WriteCoordinator,
    activity: ActivityReconstructor,
    snapshot: watch::Sender<SessionSnapshot>,
    cancel: CancelToken,
}

/// Counter session
#[derive(Clone)]
pub struct CounterSession {
    inner: Arc<SessionInner>,
}

impl CounterSession {
    /// Create a session in the `Loading` state.
    ///
    /// Must be called within a Tokio runtime; the value watcher is spawned
    /// immediately.
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        wallet: Arc<dyn WalletProvider>,
        config: SyncConfig,
    ) -> Self {
        let logger = Arc::new(SessionLogger::new(config.log_history_cap));
        Self::with_logger(ledger, wallet, config, logger)
    }

    /// Create a session that records into `logger`
    pub fn with_logger(
        ledger: Arc<dyn LedgerClient>,
        wallet: Arc<dyn WalletProvider>,
        config: SyncConfig,
        logger: Arc<SessionLogger>,
    ) -> Self {
        let reader = ReadSynchronizer::new(ledger.clone(), config.clone(), logger.clone());
        let writer = WriteCoordinator::new(
            ledger.clone(),
            wallet.clone(),
            reader.clone(),
            config.clone(),
            logger.clone(),
        );
        let activity = ActivityReconstructor::new(ledger, config, logger.clone());
        let (snapshot, _) = watch::channel(SessionSnapshot {
            config: ConfigState::Loading,
            network: NetworkGuard::new().status(),
            value: None,
            feed: activity.feed(),
            pending: PendingFlags::default(),
            warning: None,
            polling: false,
        });

        let session = Self {
            inner: Arc::new(SessionInner {
                wallet,
                logger,
                guard: Mutex::new(NetworkGuard::new()),
                config_state: Mutex::new(ConfigState::Loading),
                warning: Mutex::new(WarningPolicy::new()),
                reader,
                writer,
                activity,
                snapshot,
                cancel: CancelToken::new(),
            }),
        };
        let outcomes = session.inner.writer.subscribe_outcomes();
        tokio::spawn(watch_components(session.clone(), outcomes));
        session
    }

    /// Session logger
    pub fn logger(&self) -> &Arc<SessionLogger> {
        &self.inner.logger
    }

    /// Configuration changed
    pub fn apply_config(&self, state: ConfigState) {
        let changed = {
            let mut current = self.inner.config_state.lock();
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        };
        if !changed {
            return;
        }
        let (status, detail) = match &state {
            ConfigState::Loading => ("loading", None),
            ConfigState::Ready(config) => (
                "ready",
                Some(
                    config
                        .contract_address
                        .map_or_else(|| "no contract deployed".to_string(), |a| a.to_string()),
                ),
            ),
            ConfigState::Error { message } => ("error", Some(message.clone())),
        };
        self.inner.logger.log(SessionEvent::ConfigChanged {
            status: status.to_string(),
            detail,
        });

        let changed = self
            .inner
            .guard
            .lock()
            .set_config(state.chain_id(), state.contract_address());
        self.after_guard_change(changed);
    }

    /// Follow a configuration loader until the session shuts down
    pub fn attach_config(&self, mut states: watch::Receiver<ConfigState>) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                let state = states.borrow_and_update().clone();
                session.apply_config(state);
                let next = session.inner.cancel.run_until_cancelled(states.changed()).await;
                if !matches!(next, Some(Ok(()))) {
                    break;
                }
            }
        });
    }

    /// Wallet account changed (`None` on disconnect)
    pub fn on_account_changed(&self, account: Option<Address>) {
        let changed = self.inner.guard.lock().set_account(account);
        self.after_guard_change(changed);
    }

    /// Wallet network changed
    pub fn on_network_changed(&self, chain_id: Option<u64>) {
        let changed = self.inner.guard.lock().set_active_network(chain_id);
        self.after_guard_change(changed);
    }

    /// Query the wallet and apply any account or network change
    pub async fn sync_wallet(&self) -> Result<()> {
        let account = self.inner.wallet.account().await?;
        let chain_id = self.inner.wallet.chain_id().await?;
        self.on_account_changed(account);
        self.on_network_changed(chain_id);
        Ok(())
    }

    fn after_guard_change(&self, changed: bool) {
        if changed {
            let status = self.inner.guard.lock().status();
            self.inner.logger.log(SessionEvent::NetworkStatus {
                can_interact: status.can_interact,
                mismatched: status.mismatched,
                active: status.active_id,
                expected: status.expected_id,
            });
        }
        self.reconcile();
        self.publish();
    }

    /// Start or stop polling to match the current inputs
    fn reconcile(&self) {
        let target = {
            let ready = self.inner.config_state.lock().ready().is_some();
            let guard = self.inner.guard.lock();
            guard
                .contract_address()
                .filter(|_| ready && !guard.mismatched())
        };
        match target {
            Some(contract) => {
                if self.inner.reader.schedule_polling(contract) {
                    self.spawn_rescan(contract);
                }
            }
            None => self.inner.reader.stop(),
        }
    }

    fn spawn_rescan(&self, contract: Address) {
        let activity = self.inner.activity.clone();
        tokio::spawn(async move {
            if let Err(e) = activity.rescan(contract).await {
                debug!("Activity rescan failed: {}", e);
            }
        });
    }

    /// Contract currently polled, if any
    fn polled_contract(&self) -> Option<Address> {
        if !self.inner.reader.is_running() {
            return None;
        }
        self.inner.guard.lock().contract_address()
    }

    /// Submit an increment
    pub async fn increment(&self) -> Result<PendingTransaction> {
        let guard = self.inner.guard.lock().clone();
        self.inner.writer.submit(ActionKind::Increment, &guard).await
    }

    /// Request a decrement; held by the warning policy at a known zero
    pub async fn decrement(&self) -> Result<DecrementOutcome> {
        let guard = self.inner.guard.lock().clone();
        guard.check()?;

        let decision = self
            .inner
            .warning
            .lock()
            .request_decrement(self.inner.reader.current_value());
        match decision {
            Decision::Submit => {
                let pending = self.inner.writer.submit(ActionKind::Decrement, &guard).await?;
                Ok(DecrementOutcome::Submitted(pending))
            }
            Decision::Warn(warning) => {
                self.inner.logger.log(SessionEvent::WarningRaised {
                    reason: warning.reason.clone(),
                });
                self.publish();
                Ok(DecrementOutcome::Warned(warning))
            }
        }
    }

    /// Dismiss the active warning without submitting
    pub fn dismiss_warning(&self) -> bool {
        let dismissed = self.inner.warning.lock().dismiss();
        if dismissed {
            self.publish();
        }
        dismissed
    }

    /// Submit the held decrement regardless of the current value.
    ///
    /// Returns `Ok(None)` when no warning was active.
    pub async fn proceed_anyway(&self) -> Result<Option<PendingTransaction>> {
        if !self.inner.warning.lock().proceed_anyway() {
            return Ok(None);
        }
        self.publish();
        let guard = self.inner.guard.lock().clone();
        let pending = self.inner.writer.submit(ActionKind::Decrement, &guard).await?;
        Ok(Some(pending))
    }

    /// Current counter value
    pub fn current_value(&self) -> Option<CounterValue> {
        self.inner.reader.current_value()
    }

    /// Ask for an out-of-band read
    pub fn request_refresh(&self) {
        self.inner.reader.request_refresh();
    }

    /// Terminal outcomes of tracked writes
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<WriteOutcome> {
        self.inner.writer.subscribe_outcomes()
    }

    /// Current snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Receiver notified whenever the snapshot changes
    pub fn subscribe_snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    fn build_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            config: self.inner.config_state.lock().clone(),
            network: self.inner.guard.lock().status(),
            value: self.inner.reader.current_value(),
            feed: self.inner.activity.feed(),
            pending: self.inner.writer.pending(),
            warning: self.inner.warning.lock().active().cloned(),
            polling: self.inner.reader.is_running(),
        }
    }

    fn publish(&self) {
        let next = self.build_snapshot();
        self.inner.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Stop polling, subscriptions, receipt tracking and background tasks
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.reader.stop();
        self.inner.writer.shutdown();
        self.publish();
    }
}

/// Republish on component changes and rescan the feed on value changes
enum Wake {
    Value,
    Confirmed,
    Refresh,
}

async fn watch_components(
    session: CounterSession,
    mut outcomes: broadcast::Receiver<WriteOutcome>,
) {
    let mut values = session.inner.reader.subscribe();
    let mut feed = session.inner.activity.subscribe();
    let mut pending = session.inner.writer.subscribe_pending();
    let cancel = session.inner.cancel.clone();
    let mut last_value = *values.borrow_and_update();

    loop {
        let woke = cancel
            .run_until_cancelled(async {
                tokio::select! {
                    r = values.changed() => r.ok().map(|_| Wake::Value),
                    r = feed.changed() => r.ok().map(|_| Wake::Refresh),
                    r = pending.changed() => r.ok().map(|_| Wake::Refresh),
                    r = outcomes.recv() => match r {
                        Ok(WriteOutcome { lifecycle: Lifecycle::Confirmed { .. }, .. }) => {
                            Some(Wake::Confirmed)
                        }
                        Ok(_) => Some(Wake::Refresh),
                        // Missed outcomes may include confirmations
                        Err(broadcast::error::RecvError::Lagged(_)) => Some(Wake::Confirmed),
                        Err(broadcast::error::RecvError::Closed) => None,
                    },
                }
            })
            .await;
        let wake = match woke {
            None => break,
            Some(Some(wake)) => wake,
            Some(None) => {
                warn!("Session component channel closed");
                break;
            }
        };

        match wake {
            Wake::Value => {
                let value = *values.borrow_and_update();
                // The first value after a (re)start is covered by the start rescan
                if matches!((last_value, value), (Some(a), Some(b)) if a != b) {
                    if let Some(contract) = session.polled_contract() {
                        session.spawn_rescan(contract);
                    }
                }
                last_value = value;
            }
            Wake::Confirmed => {
                if let Some(contract) = session.polled_contract() {
                    debug!("Write confirmed, rescanning activity");
                    session.spawn_rescan(contract);
                }
            }
            Wake::Refresh => {}
        }
        session.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::testing::{address, MockLedger, MockWallet, MOCK_CHAIN_ID};
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn ready(contract: Option<Address>) -> ConfigState {
        ConfigState::Ready(AppConfig {
            contract_address: contract,
            chain_id: MOCK_CHAIN_ID,
        })
    }

    fn session(ledger: &Arc<MockLedger>) -> (CounterSession, Arc<MockWallet>) {
        let wallet = MockWallet::connected(ledger.clone(), address(1));
        let session = CounterSession::new(ledger.clone(), wallet.clone(), SyncConfig::default());
        (session, wallet)
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_progression() {
        let ledger = MockLedger::with_count(2);
        let (session, _wallet) = session(&ledger);
        assert_eq!(session.snapshot().view(), ViewState::Loading);

        session.apply_config(ConfigState::Error {
            message: "backend down".into(),
        });
        assert_eq!(
            session.snapshot().view(),
            ViewState::ConfigError("backend down".into())
        );

        session.apply_config(ready(Some(ledger.contract())));
        assert_eq!(session.snapshot().view(), ViewState::Disconnected);

        session.sync_wallet().await.unwrap();
        settle().await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.view(), ViewState::Ready);
        assert!(snapshot.network.can_interact);
        assert!(snapshot.polling);
        assert_eq!(snapshot.value, Some(CounterValue::from(2u64)));
        session.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_network_stops_polling() {
        let ledger = MockLedger::with_count(1);
        let (session, wallet) = session(&ledger);
        session.apply_config(ready(Some(ledger.contract())));
        session.sync_wallet().await.unwrap();
        settle().await;
        assert!(session.snapshot().polling);

        wallet.set_chain_id(Some(84_532));
        session.sync_wallet().await.unwrap();
        let snapshot = session.snapshot();
        assert!(!snapshot.polling);
        assert!(matches!(
            snapshot.view(),
            ViewState::WrongNetwork {
                active: 84_532,
                expected: MOCK_CHAIN_ID,
                ..
            }
        ));
        let calls = ledger.get_count_calls();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ledger.get_count_calls(), calls);

        assert!(session.increment().await.is_err());

        wallet.set_chain_id(Some(MOCK_CHAIN_ID));
        session.sync_wallet().await.unwrap();
        assert!(session.snapshot().polling);
        session.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_dismiss_and_proceed() {
        let ledger = MockLedger::with_count(0);
        let (session, _wallet) = session(&ledger);
        session.apply_config(ready(Some(ledger.contract())));
        session.sync_wallet().await.unwrap();
        settle().await;

        let outcome = session.decrement().await.unwrap();
        assert!(matches!(outcome, DecrementOutcome::Warned(_)));
        assert!(session.snapshot().warning.is_some());
        assert!(ledger.pending().is_empty());

        assert!(session.dismiss_warning());
        assert!(session.snapshot().warning.is_none());
        assert!(session.proceed_anyway().await.unwrap().is_none());

        session.decrement().await.unwrap();
        let mut tx = session.proceed_anyway().await.unwrap().unwrap();
        let state = tx.settled().await;
        assert!(matches!(
            state,
            crate::writer::Lifecycle::Failed { reason: Some(ref r), .. } if r == "Counter: underflow"
        ));
        assert_eq!(session.current_value(), Some(CounterValue::from(0u64)));
        session.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_change_rescans_feed() {
        let ledger = MockLedger::with_count(0);
        let (session, _wallet) = session(&ledger);
        session.apply_config(ready(Some(ledger.contract())));
        session.sync_wallet().await.unwrap();
        settle().await;
        assert!(session.snapshot().feed.is_empty());

        let mut tx = session.increment().await.unwrap();
        tx.settled().await;
        settle().await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.value, Some(CounterValue::from(1u64)));
        assert_eq!(snapshot.feed.len(), 1);
        assert_eq!(snapshot.feed[0].account, Some(address(1)));
        assert!(!snapshot.busy());
        session.shutdown();
    }
}
