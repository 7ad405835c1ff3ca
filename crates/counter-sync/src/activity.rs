//! Activity reconstructor: rebuilds the recent-mutations feed from event logs
//!
//! A run scans a bounded window of recent blocks for both event kinds,
//! merges them newest block first, keeps the newest entries, and enriches
//! those with the sender and block time. Runs may overlap. Each run takes a
//! sequence number when it starts, and its result is committed only if no
//! later-started run has committed already. In-flight calls of a superseded
//! run are not cancelled; their results are dropped at commit time.

use crate::ledger::{bounded, LedgerClient};
use crate::logger::{SessionEvent, SessionLogger};
use crate::types::{block_time, ActionKind, ActivityEntry, Address, LedgerLog, LogFilter, TxHash};
use crate::{Error, Result, SyncConfig};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Displayed feed, shared read-only
pub type Feed = Arc<Vec<ActivityEntry>>;

/// Result of one reconstruction run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run's feed is now displayed
    Committed {
        /// Run sequence number
        run: u64,
        /// Entries in the committed feed
        entries: usize,
    },
    /// A later-started run committed first; this result was dropped
    Superseded {
        /// Run sequence number
        run: u64,
        /// Sequence number of the displayed feed
        committed: u64,
    },
}

/// Inclusive block window ending at `latest`
pub fn scan_window(latest: u64, lookback: u64) -> (u64, u64) {
    (latest.saturating_sub(lookback), latest)
}

/// Merge per-kind scan results into the display order.
///
/// Increments are placed before decrements and the result is stably sorted
/// by descending block, so logs sharing a block keep scan order. Only the
/// newest `cap` entries are kept.
pub fn merge_logs(increments: Vec<LedgerLog>, decrements: Vec<LedgerLog>, cap: usize) -> Vec<LedgerLog> {
    let mut merged = increments;
    merged.extend(decrements);
    merged.sort_by(|a, b| b.block_number.cmp(&a.block_number));
    merged.truncate(cap);
    merged
}

struct ActivityInner {
    ledger: Arc<dyn LedgerClient>,
    config: SyncConfig,
    logger: Arc<SessionLogger>,
    next_run: AtomicU64,
    committed: Mutex<u64>,
    feed: watch::Sender<Feed>,
}

/// Activity reconstructor
#[derive(Clone)]
pub struct ActivityReconstructor {
    inner: Arc<ActivityInner>,
}

impl ActivityReconstructor {
    /// Create a reconstructor with an empty feed
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        config: SyncConfig,
        logger: Arc<SessionLogger>,
    ) -> Self {
        let (feed, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(ActivityInner {
                ledger,
                config,
                logger,
                next_run: AtomicU64::new(0),
                committed: Mutex::new(0),
                feed,
            }),
        }
    }

    /// Currently displayed feed
    pub fn feed(&self) -> Feed {
        self.inner.feed.borrow().clone()
    }

    /// Receiver notified on every commit
    pub fn subscribe(&self) -> watch::Receiver<Feed> {
        self.inner.feed.subscribe()
    }

    /// Sequence number of the displayed feed, 0 before the first commit
    pub fn committed_run(&self) -> u64 {
        *self.inner.committed.lock()
    }

    /// Run one reconstruction for `contract`.
    ///
    /// A failed block-number lookup or log query aborts the run and leaves
    /// the displayed feed as it was. Enrichment failures never abort.
    pub async fn rescan(&self, contract: Address) -> Result<RunOutcome> {
        let inner = &self.inner;
        let run = inner.next_run.fetch_add(1, Ordering::SeqCst) + 1;

        let logs = match inner.scan(contract).await {
            Ok(logs) => logs,
            Err(e) => {
                inner.logger.log(SessionEvent::FeedScanFailed {
                    run,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let previous = inner.feed.borrow().clone();
        let known: HashMap<TxHash, &ActivityEntry> =
            previous.iter().map(|e| (e.transaction_id, e)).collect();
        let timeout = inner.config.call_timeout;
        let entries = join_all(logs.iter().map(|log| {
            let fallback = known.get(&log.transaction_id).copied();
            enrich(inner.ledger.as_ref(), timeout, log, fallback)
        }))
        .await;

        Ok(inner.commit(run, entries))
    }
}

impl ActivityInner {
    async fn scan(&self, contract: Address) -> Result<Vec<LedgerLog>> {
        let timeout = self.config.call_timeout;
        let latest = bounded(timeout, self.ledger.block_number()).await?;
        let (from_block, to_block) = scan_window(latest, self.config.activity_lookback_blocks);
        let filter = |kind| LogFilter {
            address: contract,
            kind,
            from_block,
            to_block,
        };
        let increments = filter(ActionKind::Increment);
        let decrements = filter(ActionKind::Decrement);

        let (increments, decrements) = tokio::try_join!(
            bounded(timeout, self.ledger.get_logs(&increments)),
            bounded(timeout, self.ledger.get_logs(&decrements)),
        )?;
        debug!(
            from_block,
            to_block,
            increments = increments.len(),
            decrements = decrements.len(),
            "Scanned counter logs"
        );
        Ok(merge_logs(increments, decrements, self.config.activity_feed_cap))
    }

    fn commit(&self, run: u64, entries: Vec<ActivityEntry>) -> RunOutcome {
        let mut committed = self.committed.lock();
        if run < *committed {
            let committed = *committed;
            self.logger
                .log(SessionEvent::FeedDiscarded { run, committed });
            return RunOutcome::Superseded { run, committed };
        }
        *committed = run;
        let count = entries.len();
        self.feed.send_replace(Arc::new(entries));
        drop(committed);
        self.logger.log(SessionEvent::FeedCommitted {
            run,
            entries: count,
        });
        RunOutcome::Committed {
            run,
            entries: count,
        }
    }
}

/// Fill in sender and timestamp for one log.
///
/// Lookup failures are contained: the field falls back to what the
/// previously displayed entry for the same transaction had, else `None`.
async fn enrich(
    ledger: &dyn LedgerClient,
    timeout: Duration,
    log: &LedgerLog,
    fallback: Option<&ActivityEntry>,
) -> ActivityEntry {
    let mut entry = ActivityEntry::from_log(log);
    let (tx, block) = tokio::join!(
        bounded(timeout, ledger.get_transaction(log.transaction_id)),
        bounded(timeout, ledger.get_block(log.block_number)),
    );

    entry.account = match tx {
        Ok(Some(info)) => Some(info.from),
        Ok(None) => {
            report(log, Error::EnrichmentFailure(format!("transaction {} not found", log.transaction_id)));
            fallback.and_then(|f| f.account)
        }
        Err(e) => {
            report(log, e);
            fallback.and_then(|f| f.account)
        }
    };
    entry.timestamp = match block {
        Ok(Some(info)) => block_time(info.timestamp),
        Ok(None) => {
            report(log, Error::EnrichmentFailure(format!("block {} not found", log.block_number)));
            fallback.and_then(|f| f.timestamp)
        }
        Err(e) => {
            report(log, e);
            fallback.and_then(|f| f.timestamp)
        }
    };
    entry
}

fn report(log: &LedgerLog, error: Error) {
    debug!(
        event = "enrichment_failed",
        tx = %log.transaction_id,
        block_number = log.block_number,
        error = %error,
        "Keeping activity entry with partial fields"
    );
}
