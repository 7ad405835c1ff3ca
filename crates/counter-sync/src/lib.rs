//! Client-side state synchronization for the counter contract
//!
//! Keeps a displayed counter value consistent with the ledger across
//! polling, event subscriptions and write confirmations, tracks submitted
//! writes through their lifecycle, and rebuilds a bounded activity feed from
//! event logs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod abi;
pub mod activity;
pub mod cancel;
pub mod config;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod logger;
pub mod reader;
pub mod rpc;
pub mod session;
pub mod types;
pub mod warning;
pub mod writer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use activity::{merge_logs, scan_window, ActivityReconstructor, Feed, RunOutcome};
pub use cancel::CancelToken;
pub use config::{
    AppConfig, ConfigLoader, ConfigSource, ConfigState, HttpConfigSource, RetryConfig,
    StaticConfigSource, SyncConfig,
};
pub use error::{Error, Result};
pub use guard::{NetworkGuard, NetworkStatus};
pub use ledger::{EventSubscription, LedgerClient, WalletProvider};
pub use logger::{init_logging, SessionEvent, SessionLogger};
pub use reader::ReadSynchronizer;
pub use rpc::{JsonRpcLedger, NodeWallet};
pub use session::{CounterSession, DecrementOutcome, SessionSnapshot, ViewState};
pub use types::{
    ActionKind, ActivityEntry, Address, BlockInfo, CounterValue, LedgerLog, LogFilter, Receipt,
    TxHash, TxInfo,
};
pub use warning::{Decision, DecrementWarning, WarningPolicy};
pub use writer::{Lifecycle, PendingFlags, PendingTransaction, WriteCoordinator, WriteOutcome};
