//! Counter dApp network parameters and constants
//!
//! This crate provides the chains the counter contract is deployed on,
//! their RPC endpoints and explorer links, and the backend defaults the
//! sync engine falls back to.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod network;

pub use network::{short_address, Network, NetworkType};

/// Default backend base URL serving `/api/config`
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:4010";

/// Chain id assumed when none is configured (local Hardhat node)
pub const DEFAULT_CHAIN_ID: u64 = 31_337;

/// Error types for parameter operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid network specified
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    /// Chain id not known to this build
    #[error("Unknown chain id: {0}")]
    UnknownChainId(u64),
}

/// Result type for parameter operations
pub type Result<T> = std::result::Result<T, Error>;
