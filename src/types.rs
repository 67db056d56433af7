//! Domain types shared across the guard.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};

/// Name of the event stream whose cursor tracks `WithdrawStarted` processing.
pub const WITHDRAW_STARTED_STREAM: &str = "withdraw_started";

/// A confirmed `WithdrawStarted` event observed on the custody contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawStartedEvent {
    pub withdrawal_id: B256,
    pub user: Address,
    pub token: Address,
    pub amount: U256,
    pub nonce: U256,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// A confirmed `WithdrawFinalized` event observed on the custody contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawFinalizedEvent {
    pub withdrawal_id: B256,
    pub success: bool,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// A confirmed `Deposited` event observed on the custody contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositedEvent {
    pub user: Address,
    pub token: Address,
    pub amount: U256,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// A finalized withdrawal recorded for limit tracking.
///
/// Persisted only when the guard approved the request and the finalize
/// transaction succeeded on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawal {
    pub withdrawal_id: B256,
    pub user: Address,
    pub token: Address,
    pub amount: U256,
    pub block_number: u64,
    pub tx_hash: B256,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of processing one `WithdrawStarted` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
    Error,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
            Decision::Error => "error",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
