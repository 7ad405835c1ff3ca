//! Chains the counter contract can be deployed on

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Network type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    /// Local Hardhat node
    Localhost,
    /// Base Sepolia testnet
    BaseSepolia,
}

/// Network configuration
#[derive(Debug, Clone)]
pub struct Network {
    /// Network type
    pub network_type: NetworkType,
    /// Short machine name
    pub name: &'static str,
    /// Label shown to the operator
    pub label: &'static str,
    /// EIP-155 chain id
    pub chain_id: u64,
    /// Default JSON-RPC endpoint
    pub rpc_url: &'static str,
    /// Block explorer base URL, if the chain has one
    pub explorer_url: Option<&'static str>,
}

impl Network {
    /// Get local Hardhat parameters
    pub const fn localhost() -> Self {
        Self {
            network_type: NetworkType::Localhost,
            name: "localhost",
            label: "Local Hardhat Network",
            chain_id: 31_337,
            rpc_url: "http://127.0.0.1:8545",
            explorer_url: None,
        }
    }

    /// Get Base Sepolia parameters
    pub const fn base_sepolia() -> Self {
        Self {
            network_type: NetworkType::BaseSepolia,
            name: "base-sepolia",
            label: "Base Sepolia Testnet",
            chain_id: 84_532,
            rpc_url: "https://sepolia.base.org",
            explorer_url: Some("https://sepolia.basescan.org"),
        }
    }

    /// Get network by type
    pub const fn from_type(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::Localhost => Self::localhost(),
            NetworkType::BaseSepolia => Self::base_sepolia(),
        }
    }

    /// Look up a known network by chain id
    pub fn from_chain_id(chain_id: u64) -> Result<Self> {
        match chain_id {
            31_337 => Ok(Self::localhost()),
            84_532 => Ok(Self::base_sepolia()),
            other => Err(Error::UnknownChainId(other)),
        }
    }

    /// Label for any chain id; unknown ids are shown as `chain <id>`
    pub fn label_for(chain_id: u64) -> String {
        match Self::from_chain_id(chain_id) {
            Ok(network) => network.label.to_string(),
            Err(_) => format!("chain {}", chain_id),
        }
    }

    /// Explorer page for a contract address
    pub fn explorer_address_url(&self, address: &str) -> Option<String> {
        self.explorer_url
            .map(|base| format!("{}/address/{}", base, address))
    }
}

impl FromStr for NetworkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "localhost" | "hardhat" | "local" => Ok(NetworkType::Localhost),
            "base-sepolia" | "basesepolia" | "base_sepolia" => Ok(NetworkType::BaseSepolia),
            other => Err(Error::InvalidNetwork(other.to_string())),
        }
    }
}

/// Shorten a hex address to `0x1234...abcd` for display.
///
/// Strings too short to shorten are returned unchanged.
pub fn short_address(address: &str) -> String {
    let chars = address.chars().count();
    if chars <= 10 {
        return address.to_string();
    }
    let head_end = address
        .char_indices()
        .nth(6)
        .map_or(address.len(), |(i, _)| i);
    let tail_start = address
        .char_indices()
        .nth(chars - 4)
        .map_or(address.len(), |(i, _)| i);
    format!("{}...{}", &address[..head_end], &address[tail_start..])
}
