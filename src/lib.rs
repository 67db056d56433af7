//! Nitewatch — custody guard daemon.
//!
//! Holds the independent guard role of a two-phase withdrawal protocol on an
//! EVM custody contract: tails `WithdrawStarted` events, checks each request
//! against global and per-user rate limits over a persisted ledger, and
//! finalizes or rejects it on chain. Exposed as a library so integration
//! tests and embedders can drive the components directly.

pub mod api;
pub mod checker;
pub mod config;
pub mod contracts;
pub mod db;
pub mod listener;
pub mod metrics;
pub mod service;
pub mod types;
pub mod worker;
