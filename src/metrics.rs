//! Prometheus metrics for the guard.
//!
//! Collected into the default registry and exposed on the health server's
//! /metrics endpoint.

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge, CounterVec, Gauge};

lazy_static! {
    /// Processed WithdrawStarted events by decision outcome.
    pub static ref WITHDRAWALS_PROCESSED: CounterVec = register_counter_vec!(
        "nitewatch_withdrawals_processed_total",
        "Total number of WithdrawStarted events processed",
        &["decision"]
    ).unwrap();

    /// Block number of the most recently processed event.
    pub static ref LAST_EVENT_BLOCK: Gauge = register_gauge!(
        "nitewatch_last_event_block",
        "Block number of the most recently processed WithdrawStarted event"
    ).unwrap();

    /// RPC failures by stage (connect, subscribe, get_logs, head).
    pub static ref RPC_ERRORS: CounterVec = register_counter_vec!(
        "nitewatch_rpc_errors_total",
        "Total number of node RPC failures",
        &["stage"]
    ).unwrap();

    /// Whether the guard is up and running.
    pub static ref UP: Gauge = register_gauge!(
        "nitewatch_up",
        "Whether the guard is up and running"
    ).unwrap();
}

/// Record a processed event and its decision.
pub fn record_decision(decision: &str, block_number: u64) {
    WITHDRAWALS_PROCESSED.with_label_values(&[decision]).inc();
    LAST_EVENT_BLOCK.set(block_number as f64);
}

/// Record an RPC failure.
pub fn record_rpc_error(stage: &str) {
    RPC_ERRORS.with_label_values(&[stage]).inc();
}
