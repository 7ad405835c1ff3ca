//! In-memory ledger and wallet for tests
//!
//! `MockLedger` behaves like a single-node chain hosting the counter
//! contract: every mined transaction gets its own block, decrementing at zero
//! reverts with `Counter: underflow`, and subscribers receive every emitted
//! event. Mining can be switched to manual so tests control confirmation
//! order, and individual calls can be delayed or failed.

use crate::abi;
use crate::cancel::CancelToken;
use crate::ledger::{EventSubscription, LedgerClient, WalletProvider};
use crate::types::{
    ActionKind, Address, BlockInfo, CounterValue, LedgerLog, LogFilter, Receipt, TxHash, TxInfo,
};
use crate::{Error, Result};
use alloy::primitives::keccak256;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Timestamp of block zero
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
/// Seconds between mock blocks
pub const BLOCK_TIME_SECS: u64 = 2;
/// Chain id the mock reports
pub const MOCK_CHAIN_ID: u64 = 31_337;

/// Deterministic test address
pub fn address(n: u8) -> Address {
    Address::with_last_byte(n)
}

/// Counter contract address used by the mock
pub fn contract_address() -> Address {
    let mut bytes = [0u8; 20];
    bytes[0] = 0xc0;
    bytes[19] = 0x01;
    Address::new(bytes)
}

#[derive(Debug, Clone)]
struct QueuedTx {
    hash: TxHash,
    kind: ActionKind,
    from: Address,
}

#[derive(Default)]
struct ChainState {
    count: CounterValue,
    block_number: u64,
    nonce: u64,
    logs: Vec<LedgerLog>,
    transactions: HashMap<TxHash, TxInfo>,
    receipts: HashMap<TxHash, Receipt>,
    revert_reasons: HashMap<TxHash, String>,
    mempool: Vec<QueuedTx>,
    subscribers: Vec<(ActionKind, mpsc::Sender<LedgerLog>, CancelToken)>,
}

#[derive(Default)]
struct Faults {
    fail_reads: u32,
    fail_log_queries: u32,
    fail_tx_lookups: HashSet<TxHash>,
    fail_block_lookups: HashSet<u64>,
    read_delay: Option<Duration>,
    log_delays: Vec<Duration>,
    reject_sends: Option<String>,
}

/// In-memory counter chain
pub struct MockLedger {
    contract: Address,
    chain: Mutex<ChainState>,
    faults: Mutex<Faults>,
    auto_mine: Mutex<bool>,
    get_count_calls: AtomicUsize,
    log_query_calls: AtomicUsize,
}

impl MockLedger {
    /// Empty chain at block 1 with the counter at zero and auto-mining on
    pub fn new() -> Arc<Self> {
        Self::with_count(0)
    }

    /// Chain whose counter starts at `count`
    pub fn with_count(count: u64) -> Arc<Self> {
        Arc::new(Self {
            contract: contract_address(),
            chain: Mutex::new(ChainState {
                count: CounterValue::from(count),
                block_number: 1,
                ..Default::default()
            }),
            faults: Mutex::new(Faults::default()),
            auto_mine: Mutex::new(true),
            get_count_calls: AtomicUsize::new(0),
            log_query_calls: AtomicUsize::new(0),
        })
    }

    /// Counter contract address
    pub fn contract(&self) -> Address {
        self.contract
    }

    /// Ledger truth
    pub fn count(&self) -> CounterValue {
        self.chain.lock().count
    }

    /// Number of `getCount` calls served so far
    pub fn get_count_calls(&self) -> usize {
        self.get_count_calls.load(Ordering::SeqCst)
    }

    /// Number of log queries served so far
    pub fn log_query_calls(&self) -> usize {
        self.log_query_calls.load(Ordering::SeqCst)
    }

    /// Toggle automatic mining of submitted transactions
    pub fn set_auto_mine(&self, enabled: bool) {
        *self.auto_mine.lock() = enabled;
    }

    /// Fail the next `n` `getCount` calls
    pub fn fail_next_reads(&self, n: u32) {
        self.faults.lock().fail_reads = n;
    }

    /// Fail the next `n` log queries
    pub fn fail_next_log_queries(&self, n: u32) {
        self.faults.lock().fail_log_queries = n;
    }

    /// Fail every lookup of this transaction
    pub fn fail_transaction_lookup(&self, hash: TxHash) {
        self.faults.lock().fail_tx_lookups.insert(hash);
    }

    /// Fail every lookup of this block
    pub fn fail_block_lookup(&self, number: u64) {
        self.faults.lock().fail_block_lookups.insert(number);
    }

    /// Delay every `getCount` call
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.faults.lock().read_delay = delay;
    }

    /// Delays applied to successive log queries, in call order
    pub fn queue_log_delays(&self, delays: impl IntoIterator<Item = Duration>) {
        self.faults.lock().log_delays.extend(delays);
    }

    /// Reject every signing request with `message`
    pub fn reject_sends(&self, message: Option<&str>) {
        self.faults.lock().reject_sends = message.map(str::to_string);
    }

    /// Add empty blocks
    pub fn advance_blocks(&self, n: u64) {
        self.chain.lock().block_number += n;
    }

    /// Submit a transaction from `from`, mining it if auto-mining is on
    pub fn submit(&self, kind: ActionKind, from: Address) -> TxHash {
        let queued = {
            let mut chain = self.chain.lock();
            chain.nonce += 1;
            let mut seed = chain.nonce.to_be_bytes().to_vec();
            seed.extend_from_slice(from.as_slice());
            let hash = keccak256(&seed);
            chain.transactions.insert(hash, TxInfo { from });
            let queued = QueuedTx { hash, kind, from };
            chain.mempool.push(queued.clone());
            queued
        };
        if *self.auto_mine.lock() {
            self.mine(queued.hash);
        }
        queued.hash
    }

    /// A mutation by some other account, mined immediately
    pub fn external(&self, kind: ActionKind, from: Address) -> TxHash {
        let hash = self.submit(kind, from);
        self.mine(hash);
        hash
    }

    /// Hashes still waiting in the mempool, in submission order
    pub fn pending(&self) -> Vec<TxHash> {
        self.chain.lock().mempool.iter().map(|q| q.hash).collect()
    }

    /// Mine one queued transaction in its own block.
    ///
    /// Returns `false` if the hash is not in the mempool.
    pub fn mine(&self, hash: TxHash) -> bool {
        let mut chain = self.chain.lock();
        let Some(pos) = chain.mempool.iter().position(|q| q.hash == hash) else {
            return false;
        };
        let tx = chain.mempool.remove(pos);
        chain.block_number += 1;
        let block_number = chain.block_number;

        let new_count = match tx.kind {
            ActionKind::Increment => chain.count.incremented(),
            ActionKind::Decrement => chain.count.decremented(),
        };

        let success = match new_count {
            Some(count) => {
                chain.count = count;
                let log = LedgerLog {
                    kind: tx.kind,
                    block_number,
                    transaction_id: tx.hash,
                    new_count: count,
                };
                chain.logs.push(log.clone());
                chain.subscribers.retain(|(kind, sender, cancel)| {
                    if cancel.is_cancelled() || sender.is_closed() {
                        return false;
                    }
                    if *kind == log.kind {
                        let _ = sender.try_send(log.clone());
                    }
                    true
                });
                true
            }
            None => {
                chain
                    .revert_reasons
                    .insert(tx.hash, "Counter: underflow".to_string());
                false
            }
        };

        chain.receipts.insert(
            tx.hash,
            Receipt {
                transaction_id: tx.hash,
                block_number,
                success,
            },
        );
        tracing::trace!(from = %tx.from, kind = %tx.kind, block_number, success, "mock mined");
        true
    }

    fn unavailable(what: &str) -> Error {
        Error::Rpc {
            code: -32603,
            message: format!("mock {} unavailable", what),
        }
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn chain_id(&self) -> Result<u64> {
        Ok(MOCK_CHAIN_ID)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.chain.lock().block_number)
    }

    async fn get_count(&self, contract: Address) -> Result<CounterValue> {
        self.get_count_calls.fetch_add(1, Ordering::SeqCst);
        let (fail, delay) = {
            let mut faults = self.faults.lock();
            let fail = faults.fail_reads > 0;
            if fail {
                faults.fail_reads -= 1;
            }
            (fail, faults.read_delay)
        };
        // Snapshot the value when the call is issued, like a node answering
        // at the block it was asked against.
        let value = self.chain.lock().count;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Self::unavailable("eth_call"));
        }
        if contract != self.contract {
            return Err(Error::Rpc {
                code: -32000,
                message: "execution reverted".to_string(),
            });
        }
        Ok(value)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<LedgerLog>> {
        self.log_query_calls.fetch_add(1, Ordering::SeqCst);
        let (fail, delay) = {
            let mut faults = self.faults.lock();
            let fail = faults.fail_log_queries > 0;
            if fail {
                faults.fail_log_queries -= 1;
            }
            let delay = if faults.log_delays.is_empty() {
                None
            } else {
                Some(faults.log_delays.remove(0))
            };
            (fail, delay)
        };
        let logs: Vec<LedgerLog> = {
            let chain = self.chain.lock();
            if filter.address != self.contract {
                Vec::new()
            } else {
                chain
                    .logs
                    .iter()
                    .filter(|log| {
                        log.kind == filter.kind
                            && log.block_number >= filter.from_block
                            && log.block_number <= filter.to_block
                    })
                    .cloned()
                    .collect()
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Self::unavailable("eth_getLogs"));
        }
        Ok(logs)
    }

    async fn get_transaction(&self, hash: TxHash) -> Result<Option<TxInfo>> {
        if self.faults.lock().fail_tx_lookups.contains(&hash) {
            return Err(Self::unavailable("eth_getTransactionByHash"));
        }
        Ok(self.chain.lock().transactions.get(&hash).cloned())
    }

    async fn get_block(&self, number: u64) -> Result<Option<BlockInfo>> {
        if self.faults.lock().fail_block_lookups.contains(&number) {
            return Err(Self::unavailable("eth_getBlockByNumber"));
        }
        let latest = self.chain.lock().block_number;
        Ok((number <= latest).then(|| BlockInfo {
            timestamp: GENESIS_TIMESTAMP + number * BLOCK_TIME_SECS,
        }))
    }

    async fn get_receipt(&self, hash: TxHash) -> Result<Option<Receipt>> {
        Ok(self.chain.lock().receipts.get(&hash).cloned())
    }

    async fn revert_reason(&self, hash: TxHash) -> Result<Option<String>> {
        Ok(self.chain.lock().revert_reasons.get(&hash).cloned())
    }

    async fn subscribe(&self, contract: Address, kind: ActionKind) -> Result<EventSubscription> {
        let (subscription, sender, cancel) = EventSubscription::channel(kind, 64);
        if contract == self.contract {
            self.chain.lock().subscribers.push((kind, sender, cancel));
        }
        Ok(subscription)
    }
}

/// Wallet connected to a [`MockLedger`]
pub struct MockWallet {
    ledger: Arc<MockLedger>,
    account: Mutex<Option<Address>>,
    chain_id: Mutex<Option<u64>>,
}

impl MockWallet {
    /// Wallet connected as `account` on the mock chain
    pub fn connected(ledger: Arc<MockLedger>, account: Address) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            account: Mutex::new(Some(account)),
            chain_id: Mutex::new(Some(MOCK_CHAIN_ID)),
        })
    }

    /// Switch account (`None` disconnects)
    pub fn set_account(&self, account: Option<Address>) {
        *self.account.lock() = account;
    }

    /// Switch network
    pub fn set_chain_id(&self, chain_id: Option<u64>) {
        *self.chain_id.lock() = chain_id;
    }
}

#[async_trait]
impl WalletProvider for MockWallet {
    async fn account(&self) -> Result<Option<Address>> {
        Ok(*self.account.lock())
    }

    async fn chain_id(&self) -> Result<Option<u64>> {
        Ok(*self.chain_id.lock())
    }

    async fn send_transaction(
        &self,
        kind: ActionKind,
        to: Address,
        data: Vec<u8>,
    ) -> Result<TxHash> {
        if let Some(message) = self.ledger.faults.lock().reject_sends.clone() {
            return Err(Error::WriteRejected { kind, message });
        }
        let from = (*self.account.lock()).ok_or(Error::NotConnected)?;
        if to != self.ledger.contract() || data != abi::write_calldata(kind) {
            return Err(Error::WriteRejected {
                kind,
                message: "unexpected call".to_string(),
            });
        }
        Ok(self.ledger.submit(kind, from))
    }
}
