//! Structured logging for session observability
//!
//! Every notable transition of the session is emitted as a `tracing` record
//! and kept in a bounded in-memory history that can be exported as JSON.

#![allow(missing_docs)]

use crate::types::{ActionKind, CounterValue, TxHash};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

/// Session event type
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Configuration state changed
    ConfigChanged { status: String, detail: Option<String> },
    /// Guard inputs re-evaluated
    NetworkStatus {
        can_interact: bool,
        mismatched: bool,
        active: Option<u64>,
        expected: Option<u64>,
    },
    /// Polling and subscriptions started or stopped
    Polling { active: bool },
    /// New counter value committed
    ValueUpdated { value: CounterValue },
    /// Read call failed, cached value kept
    ReadFailed { error: String },
    /// Write accepted by the wallet
    WriteSubmitted { kind: ActionKind, tx: TxHash },
    /// Write confirmed on-chain
    WriteConfirmed {
        kind: ActionKind,
        tx: TxHash,
        block_number: u64,
    },
    /// Write rejected or reverted
    WriteFailed {
        kind: ActionKind,
        tx: Option<TxHash>,
        error: String,
    },
    /// Decrement intercepted at zero
    WarningRaised { reason: String },
    /// Activity feed replaced
    FeedCommitted { run: u64, entries: usize },
    /// Activity run superseded by a newer one
    FeedDiscarded { run: u64, committed: u64 },
    /// Activity scan failed, previous feed kept
    FeedScanFailed { run: u64, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Session logger
pub struct SessionLogger {
    events: Mutex<VecDeque<LoggedEvent>>,
    cap: usize,
}

impl SessionLogger {
    /// Create new logger keeping at most `cap` events
    pub fn new(cap: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            cap: cap.max(1),
        }
    }

    /// Record an event and emit its tracing record
    pub fn log(&self, event: SessionEvent) {
        match &event {
            SessionEvent::ConfigChanged { status, detail } => info!(
                event = "config_changed",
                status = %status,
                detail = ?detail,
                "Configuration state changed"
            ),
            SessionEvent::NetworkStatus {
                can_interact,
                mismatched,
                active,
                expected,
            } => {
                if *mismatched {
                    warn!(
                        event = "network_mismatch",
                        active = ?active,
                        expected = ?expected,
                        "Wallet is on the wrong network"
                    );
                } else {
                    debug!(
                        event = "network_status",
                        can_interact = %can_interact,
                        active = ?active,
                        expected = ?expected,
                        "Network guard re-evaluated"
                    );
                }
            }
            SessionEvent::Polling { active } => info!(
                event = "polling",
                active = %active,
                "Counter polling {}",
                if *active { "started" } else { "stopped" }
            ),
            SessionEvent::ValueUpdated { value } => debug!(
                event = "value_updated",
                value = %value,
                "Counter value updated"
            ),
            SessionEvent::ReadFailed { error } => warn!(
                event = "read_failed",
                error = %error,
                "Counter read failed, keeping cached value"
            ),
            SessionEvent::WriteSubmitted { kind, tx } => info!(
                event = "write_submitted",
                kind = %kind,
                tx = %tx,
                "Transaction submitted"
            ),
            SessionEvent::WriteConfirmed {
                kind,
                tx,
                block_number,
            } => info!(
                event = "write_confirmed",
                kind = %kind,
                tx = %tx,
                block_number = %block_number,
                "Transaction confirmed"
            ),
            SessionEvent::WriteFailed { kind, tx, error } => error!(
                event = "write_failed",
                kind = %kind,
                tx = ?tx,
                error = %error,
                "Transaction failed"
            ),
            SessionEvent::WarningRaised { reason } => info!(
                event = "warning_raised",
                reason = %reason,
                "Decrement intercepted"
            ),
            SessionEvent::FeedCommitted { run, entries } => debug!(
                event = "feed_committed",
                run = %run,
                entries = %entries,
                "Activity feed committed"
            ),
            SessionEvent::FeedDiscarded { run, committed } => debug!(
                event = "feed_discarded",
                run = %run,
                committed = %committed,
                "Stale activity run discarded"
            ),
            SessionEvent::FeedScanFailed { run, error } => warn!(
                event = "feed_scan_failed",
                run = %run,
                error = %error,
                "Activity scan failed, keeping previous feed"
            ),
        }

        let mut events = self.events.lock();
        if events.len() == self.cap {
            events.pop_front();
        }
        events.push_back(LoggedEvent {
            at: Utc::now(),
            event,
        });
    }

    /// Copy of the recorded history, oldest first
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().iter().map(|e| e.event.clone()).collect()
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// History as a JSON array
    pub fn export_json(&self) -> serde_json::Result<String> {
        let events = self.events.lock();
        serde_json::to_string(&*events)
    }

    /// Clear all events
    pub fn clear(&self) {
        self.events.lock().clear();
        debug!("Session log cleared");
    }
}

impl Default for SessionLogger {
    fn default() -> Self {
        Self::new(crate::SyncConfig::default().log_history_cap)
    }
}

/// Initialize logging for the session.
///
/// Honors `RUST_LOG`; defaults to `info`. Safe to call more than once.
pub fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let result = if json {
        builder
            .with_file(true)
            .with_line_number(true)
            .json()
            .try_init()
    } else {
        builder.try_init()
    };
    if result.is_ok() {
        info!("Session logging initialized");
    }
}
