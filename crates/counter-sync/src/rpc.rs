//! JSON-RPC ledger and wallet adapters
//!
//! `JsonRpcLedger` talks to an Ethereum node through an alloy HTTP provider.
//! Event delivery is emulated with log filters (`eth_newFilter` /
//! `eth_getFilterChanges`), which every HTTP node supports. `NodeWallet`
//! signs through the node's unlocked accounts, as a local Hardhat node
//! provides.

use crate::abi;
use crate::cancel::CancelToken;
use crate::ledger::{bounded, EventSubscription, LedgerClient, WalletProvider};
use crate::types::{
    ActionKind, Address, BlockInfo, CounterValue, LedgerLog, LogFilter, Receipt, TxHash, TxInfo,
};
use crate::{Error, Result, SyncConfig};
use alloy::network::{Ethereum, ReceiptResponse, TransactionResponse};
use alloy::primitives::{hex, Bytes, U256};
use alloy::providers::{DynProvider, Provider, RootProvider};
use alloy::rpc::json_rpc::ErrorPayload;
use alloy::rpc::types::{
    BlockId, BlockNumberOrTag, Filter, Log, TransactionInput, TransactionRequest,
};
use alloy::transports::http::reqwest::Url;
use alloy::transports::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace, warn};

fn connect(url: &str) -> Result<DynProvider> {
    let url: Url = url
        .parse()
        .map_err(|_| Error::InvalidEndpoint(url.to_string()))?;
    Ok(RootProvider::<Ethereum>::new_http(url).erased())
}

fn counter_filter(address: Address, kind: ActionKind) -> Filter {
    Filter::new()
        .address(address)
        .event_signature(abi::event_topic(kind))
}

/// Convert a node log to a counter log; pending and reorged-out logs yield `None`
fn into_ledger_log(log: Log) -> Result<Option<LedgerLog>> {
    if log.removed {
        return Ok(None);
    }
    let (Some(block_number), Some(transaction_id)) = (log.block_number, log.transaction_hash)
    else {
        return Ok(None);
    };
    let topic0 = log
        .topics()
        .first()
        .ok_or_else(|| Error::Decode("log without topics".to_string()))?;
    let Some(kind) = abi::kind_for_topic(topic0) else {
        return Ok(None);
    };
    Ok(Some(LedgerLog {
        kind,
        block_number,
        transaction_id,
        new_count: abi::decode_count(&log.data().data)?,
    }))
}

fn collect_logs(raw: Vec<Log>) -> Result<Vec<LedgerLog>> {
    let mut logs = Vec::with_capacity(raw.len());
    for log in raw {
        if let Some(log) = into_ledger_log(log)? {
            logs.push(log);
        }
    }
    Ok(logs)
}

/// Pull a revert reason out of a node error response.
///
/// Prefers ABI-encoded `Error(string)` data, either as a bare hex string or
/// nested under `data`; falls back to Hardhat's
/// "reverted with reason string '...'" message.
fn revert_reason_from_payload(payload: &ErrorPayload) -> Option<String> {
    let data = payload
        .data
        .as_ref()
        .and_then(|raw| serde_json::from_str::<Value>(raw.get()).ok())
        .and_then(|value| match value {
            Value::String(s) => Some(s),
            Value::Object(map) => map.get("data").and_then(Value::as_str).map(str::to_string),
            _ => None,
        });
    if let Some(reason) = data
        .and_then(|d| hex::decode(d).ok())
        .and_then(|bytes| abi::revert_reason(&bytes))
    {
        return Some(reason);
    }
    const MARKER: &str = "reverted with reason string '";
    let message = payload.message.as_ref();
    let start = message.find(MARKER)? + MARKER.len();
    let rest = &message[start..];
    rest.rfind('\'').map(|end| rest[..end].to_string())
}

/// Ledger client over HTTP JSON-RPC
#[derive(Clone)]
pub struct JsonRpcLedger {
    provider: DynProvider,
    url: String,
    config: SyncConfig,
}

impl JsonRpcLedger {
    /// Connect to the node at `url`
    pub fn new(url: impl Into<String>, config: SyncConfig) -> Result<Self> {
        let url = url.into();
        Ok(Self {
            provider: connect(&url)?,
            url,
            config,
        })
    }

    /// Node endpoint
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LedgerClient for JsonRpcLedger {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.provider.get_chain_id().await?)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn get_count(&self, contract: Address) -> Result<CounterValue> {
        let request = TransactionRequest::default()
            .to(contract)
            .input(TransactionInput::new(Bytes::from(abi::get_count_calldata())));
        let output = self.provider.call(request).await?;
        abi::decode_count(&output)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<LedgerLog>> {
        let query = counter_filter(filter.address, filter.kind)
            .from_block(filter.from_block)
            .to_block(filter.to_block);
        trace!(kind = %filter.kind, from = filter.from_block, to = filter.to_block, "eth_getLogs");
        collect_logs(self.provider.get_logs(&query).await?)
    }

    async fn get_transaction(&self, hash: TxHash) -> Result<Option<TxInfo>> {
        let tx = self.provider.get_transaction_by_hash(hash).await?;
        Ok(tx.map(|tx| TxInfo {
            from: TransactionResponse::from(&tx),
        }))
    }

    async fn get_block(&self, number: u64) -> Result<Option<BlockInfo>> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await?;
        Ok(block.map(|block| BlockInfo {
            timestamp: block.header.timestamp,
        }))
    }

    async fn get_receipt(&self, hash: TxHash) -> Result<Option<Receipt>> {
        let Some(receipt) = self.provider.get_transaction_receipt(hash).await? else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };
        Ok(Some(Receipt {
            transaction_id: receipt.transaction_hash,
            block_number,
            success: ReceiptResponse::status(&receipt),
        }))
    }

    async fn revert_reason(&self, hash: TxHash) -> Result<Option<String>> {
        let Some(tx) = self.provider.get_transaction_by_hash(hash).await? else {
            return Ok(None);
        };
        let mut replay = TransactionRequest::default()
            .from(TransactionResponse::from(&tx))
            .input(TransactionInput::new(
                alloy::consensus::Transaction::input(&tx).clone(),
            ));
        if let Some(to) = alloy::consensus::Transaction::to(&tx) {
            replay = replay.to(to);
        }
        let block = tx
            .block_number
            .map(BlockId::number)
            .unwrap_or_else(BlockId::latest);

        match self.provider.call(replay).block(block).await {
            // Replay succeeded, so the node gives no reason to report
            Ok(_) => Ok(None),
            Err(e) => match e.as_error_resp() {
                Some(payload) => Ok(revert_reason_from_payload(payload)),
                None => Err(e.into()),
            },
        }
    }

    async fn subscribe(&self, contract: Address, kind: ActionKind) -> Result<EventSubscription> {
        let filter = counter_filter(contract, kind).from_block(BlockNumberOrTag::Latest);
        let filter_id = self.provider.new_filter(&filter).await?;
        debug!("Installed {} filter {}", kind, filter_id);

        let (subscription, sender, cancel) = EventSubscription::channel(kind, 64);
        let ledger = self.clone();
        tokio::spawn(async move {
            poll_filter(ledger, filter_id, sender, cancel).await;
        });
        Ok(subscription)
    }
}

async fn poll_filter(
    ledger: JsonRpcLedger,
    filter_id: U256,
    sender: tokio::sync::mpsc::Sender<LedgerLog>,
    cancel: CancelToken,
) {
    let interval = ledger.config.subscription_poll_interval;
    let timeout = ledger.config.call_timeout;
    'poll: loop {
        if cancel
            .run_until_cancelled(tokio::time::sleep(interval))
            .await
            .is_none()
        {
            break;
        }
        let changes = bounded(timeout, async {
            Ok(ledger
                .provider
                .get_filter_changes::<Log>(filter_id)
                .await?)
        })
        .await;
        let logs = match changes.and_then(collect_logs) {
            Ok(logs) => logs,
            Err(Error::Timeout(_)) => continue,
            Err(e) => {
                // Filters expire on node restarts; the subscriber re-registers
                warn!("Filter {} dropped: {}", filter_id, e);
                break;
            }
        };
        for log in logs {
            if sender.send(log).await.is_err() {
                break 'poll;
            }
        }
    }

    let uninstalled = bounded(timeout, async {
        Ok(ledger.provider.uninstall_filter(filter_id).await?)
    })
    .await;
    if let Err(e) = uninstalled {
        debug!("Uninstalling filter {} failed: {}", filter_id, e);
    }
}

/// Wallet backed by a node's unlocked accounts
pub struct NodeWallet {
    provider: DynProvider,
    account: Option<Address>,
}

impl NodeWallet {
    /// Use the first account the node reports
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            provider: connect(url)?,
            account: None,
        })
    }

    /// Sign with a specific unlocked account
    pub fn with_account(mut self, account: Address) -> Self {
        self.account = Some(account);
        self
    }
}

fn rejection(kind: ActionKind, error: TransportError) -> Error {
    let message = match error.as_error_resp() {
        Some(payload) => {
            revert_reason_from_payload(payload).unwrap_or_else(|| payload.message.to_string())
        }
        None => error.to_string(),
    };
    Error::WriteRejected { kind, message }
}

#[async_trait]
impl WalletProvider for NodeWallet {
    async fn account(&self) -> Result<Option<Address>> {
        if let Some(account) = self.account {
            return Ok(Some(account));
        }
        let accounts = self.provider.get_accounts().await?;
        Ok(accounts.first().copied())
    }

    async fn chain_id(&self) -> Result<Option<u64>> {
        Ok(Some(self.provider.get_chain_id().await?))
    }

    async fn send_transaction(
        &self,
        kind: ActionKind,
        to: Address,
        calldata: Vec<u8>,
    ) -> Result<TxHash> {
        let from = self.account().await?.ok_or(Error::NotConnected)?;
        let request = TransactionRequest::default()
            .from(from)
            .to(to)
            .input(TransactionInput::new(Bytes::from(calldata)));
        let pending = self
            .provider
            .send_transaction(request)
            .await
            .map_err(|e| rejection(kind, e))?;
        Ok(*pending.tx_hash())
    }
}
