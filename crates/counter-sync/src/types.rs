//! Domain types shared by every component of the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use alloy::primitives::{Address, TxHash, U256};

/// The ledger's counter value, a `uint256` on the contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterValue(pub U256);

impl CounterValue {
    /// Floor of the counter; decrementing here reverts
    pub const ZERO: CounterValue = CounterValue(U256::ZERO);

    /// Whether the counter sits at its floor
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Value after an increment, `None` on overflow
    pub fn incremented(self) -> Option<Self> {
        self.0.checked_add(U256::from(1u64)).map(Self)
    }

    /// Value after a decrement, `None` at zero
    pub fn decremented(self) -> Option<Self> {
        self.0.checked_sub(U256::from(1u64)).map(Self)
    }
}

impl From<U256> for CounterValue {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl From<u64> for CounterValue {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutation kind, shared by writes and the events they emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// `increment()` / `CounterIncremented`
    Increment,
    /// `decrement()` / `CounterDecremented`
    Decrement,
}

impl ActionKind {
    /// Both kinds, in log-scan merge order
    pub const ALL: [ActionKind; 2] = [ActionKind::Increment, ActionKind::Decrement];
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Increment => write!(f, "Increment"),
            Self::Decrement => write!(f, "Decrement"),
        }
    }
}

/// Raw log returned by a log query or a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerLog {
    /// Which event this is
    pub kind: ActionKind,
    /// Block the log was included in
    pub block_number: u64,
    /// Transaction that emitted it
    pub transaction_id: TxHash,
    /// `newCount` argument
    pub new_count: CounterValue,
}

/// Log query parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    /// Emitting contract
    pub address: Address,
    /// Event kind (selects the topic)
    pub kind: ActionKind,
    /// First block, inclusive
    pub from_block: u64,
    /// Last block, inclusive
    pub to_block: u64,
}

/// Subset of a transaction needed for enrichment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInfo {
    /// Originating account
    pub from: Address,
}

/// Subset of a block needed for enrichment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

/// Terminal receipt of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Transaction id
    pub transaction_id: TxHash,
    /// Inclusion block
    pub block_number: u64,
    /// `false` when execution reverted
    pub success: bool,
}

/// One entry of the activity feed.
///
/// Structural fields come from the log scan; `account` and `timestamp` are
/// filled in by follow-up lookups and stay `None` when those fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    /// Increment or decrement
    pub kind: ActionKind,
    /// Originating account
    pub account: Option<Address>,
    /// Counter value after the mutation
    pub resulting_value: CounterValue,
    /// Inclusion block
    pub block_number: u64,
    /// Emitting transaction
    pub transaction_id: TxHash,
    /// Block timestamp
    pub timestamp: Option<DateTime<Utc>>,
}

impl ActivityEntry {
    /// Build an unenriched entry from a scanned log
    pub fn from_log(log: &LedgerLog) -> Self {
        Self {
            kind: log.kind,
            account: None,
            resulting_value: log.new_count,
            block_number: log.block_number,
            transaction_id: log.transaction_id,
            timestamp: None,
        }
    }

    /// Whether both descriptive fields are populated
    pub fn is_enriched(&self) -> bool {
        self.account.is_some() && self.timestamp.is_some()
    }
}

/// Convert a block timestamp to UTC
pub fn block_time(timestamp: u64) -> Option<DateTime<Utc>> {
    i64::try_from(timestamp)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}
