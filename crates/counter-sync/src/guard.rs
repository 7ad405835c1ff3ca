//! Network guard: decides whether the operator may interact with the contract
//!
//! Holds the last value of each input and recomputes on every named change
//! notification. There is no other state.

use crate::types::Address;
use crate::{Error, Result};
use counter_params::Network;
use serde::Serialize;

/// Derived view of the guard inputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Connected account
    pub account: Option<Address>,
    /// Wallet reports a connected account
    pub connected: bool,
    /// Chain the wallet is on
    pub active_id: Option<u64>,
    /// Chain the contract lives on
    pub expected_id: Option<u64>,
    /// Both ids known and different
    pub mismatched: bool,
    /// All interaction preconditions hold
    pub can_interact: bool,
    /// Label of the expected network, for the banner
    pub expected_label: Option<String>,
}

/// Network guard inputs
#[derive(Debug, Clone, Default)]
pub struct NetworkGuard {
    account: Option<Address>,
    active_id: Option<u64>,
    expected_id: Option<u64>,
    contract_address: Option<Address>,
}

impl NetworkGuard {
    /// Guard with no inputs known
    pub fn new() -> Self {
        Self::default()
    }

    /// Account changed; returns whether the derived status changed
    pub fn set_account(&mut self, account: Option<Address>) -> bool {
        self.apply(|g| g.account = account)
    }

    /// Wallet network changed
    pub fn set_active_network(&mut self, chain_id: Option<u64>) -> bool {
        self.apply(|g| g.active_id = chain_id)
    }

    /// Configuration changed
    pub fn set_config(&mut self, expected_id: Option<u64>, contract: Option<Address>) -> bool {
        self.apply(|g| {
            g.expected_id = expected_id;
            g.contract_address = contract;
        })
    }

    fn apply(&mut self, f: impl FnOnce(&mut Self)) -> bool {
        let before = self.status();
        f(self);
        before != self.status()
    }

    /// Connected account
    pub fn account(&self) -> Option<Address> {
        self.account
    }

    /// Configured contract
    pub fn contract_address(&self) -> Option<Address> {
        self.contract_address
    }

    /// Active and expected ids are both known and differ
    pub fn mismatched(&self) -> bool {
        matches!((self.active_id, self.expected_id), (Some(a), Some(e)) if a != e)
    }

    /// `isConnected && activeId == expectedId && contractAddress != null`
    pub fn can_interact(&self) -> bool {
        self.account.is_some()
            && self.active_id.is_some()
            && self.active_id == self.expected_id
            && self.contract_address.is_some()
    }

    /// Contract to interact with, or the reason interaction is blocked
    pub fn check(&self) -> Result<Address> {
        if let (Some(active), Some(expected)) = (self.active_id, self.expected_id) {
            if active != expected {
                return Err(Error::NetworkMismatch { active, expected });
            }
        }
        match self.contract_address {
            Some(contract) if self.can_interact() => Ok(contract),
            _ => Err(Error::NotConnected),
        }
    }

    /// Snapshot of derived state
    pub fn status(&self) -> NetworkStatus {
        NetworkStatus {
            account: self.account,
            connected: self.account.is_some(),
            active_id: self.active_id,
            expected_id: self.expected_id,
            mismatched: self.mismatched(),
            can_interact: self.can_interact(),
            expected_label: self.expected_id.map(Network::label_for),
        }
    }
}
