use alloy::primitives::{Address, B256, U256};
use sqlx::FromRow;

use crate::types::{Decision, WithdrawStartedEvent};

// Amounts are stored as decimal TEXT to preserve full uint256 precision;
// aggregation happens in-process in U256, never in SQL.

/// A finalized withdrawal row, as stored.
#[derive(Debug, Clone, FromRow)]
pub struct WithdrawalRow {
    pub id: i64,
    pub withdrawal_id: String,
    pub user_address: String,
    pub token_address: String,
    pub amount: String,
    pub block_number: i64,
    pub tx_hash: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// A processed-event row, as stored. One row exists for every observed
/// `WithdrawStarted` event regardless of outcome.
#[derive(Debug, Clone, FromRow)]
pub struct WithdrawEventRow {
    pub id: i64,
    pub withdrawal_id: String,
    pub user_address: String,
    pub token_address: String,
    pub amount: String,
    pub decision: String,
    pub reason: String,
    pub block_number: i64,
    pub tx_hash: String,
    pub log_index: i64,
    /// Unix seconds.
    pub created_at: i64,
}

/// For inserting new processed-event rows.
#[derive(Debug, Clone)]
pub struct NewWithdrawEvent {
    pub withdrawal_id: B256,
    pub user: Address,
    pub token: Address,
    pub amount: U256,
    pub decision: Decision,
    pub reason: String,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl NewWithdrawEvent {
    /// Build the processed-event row for an observed event and its outcome.
    pub fn from_event(
        event: &WithdrawStartedEvent,
        decision: Decision,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            withdrawal_id: event.withdrawal_id,
            user: event.user,
            token: event.token,
            amount: event.amount,
            decision,
            reason: reason.into(),
            block_number: event.block_number,
            tx_hash: event.tx_hash,
            log_index: event.log_index,
        }
    }
}
