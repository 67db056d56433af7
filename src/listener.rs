//! Custody contract event ingestion.
//!
//! Each watcher runs two conceptual tasks over one output channel: a live
//! WebSocket log subscription and, when resuming from a saved cursor, a
//! historical reconciliation pass that pages `eth_getLogs` up to the head.
//! The consumer deduplicates through the processed-event table, which is the
//! single source of ordering truth; this layer only guarantees per-source
//! order.

use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::pubsub::PubSubFrontend;
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use eyre::{eyre, Result};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::contracts::ICustody;
use crate::metrics;
use crate::types::{DepositedEvent, WithdrawFinalizedEvent, WithdrawStartedEvent};

const MAX_BACKOFF_ATTEMPTS: u32 = 5;
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const RECONCILE_BLOCK_STEP: u64 = 10_000;
const RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Subscribes to custody contract events. Each method runs until shutdown is
/// signalled, the sink's receiver is dropped, or the back-off limit is
/// exhausted (an error).
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn watch_withdraw_started(
        &self,
        sink: mpsc::Sender<WithdrawStartedEvent>,
        from_block: u64,
        from_log_index: u64,
        shutdown: mpsc::Receiver<()>,
    ) -> Result<()>;

    async fn watch_withdraw_finalized(
        &self,
        sink: mpsc::Sender<WithdrawFinalizedEvent>,
        from_block: u64,
        from_log_index: u64,
        shutdown: mpsc::Receiver<()>,
    ) -> Result<()>;

    async fn watch_deposited(
        &self,
        sink: mpsc::Sender<DepositedEvent>,
        from_block: u64,
        from_log_index: u64,
        shutdown: mpsc::Receiver<()>,
    ) -> Result<()>;
}

/// WebSocket-backed [`EventListener`] for the custody contract.
pub struct ChainListener {
    ws_url: String,
    contract_address: Address,
}

impl ChainListener {
    pub fn new(ws_url: impl Into<String>, contract_address: Address) -> Self {
        Self {
            ws_url: ws_url.into(),
            contract_address,
        }
    }

    async fn listen_decoded<T: Send + 'static>(
        &self,
        stream_label: &'static str,
        topic: B256,
        decode: fn(&Log) -> Option<T>,
        sink: mpsc::Sender<T>,
        mut from_block: u64,
        mut from_log_index: u64,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        let mut attempts: u32 = 0;

        loop {
            if attempts > MAX_BACKOFF_ATTEMPTS {
                return Err(eyre!(
                    "back-off limit reached for {} subscription",
                    stream_label
                ));
            }
            if attempts > 0 {
                let delay = backoff_delay(attempts);
                info!(
                    stream = stream_label,
                    attempts,
                    delay_secs = delay.as_secs(),
                    "backing off before reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => return Ok(()),
                }
            }

            let provider = match ProviderBuilder::new()
                .on_ws(WsConnect::new(self.ws_url.clone()))
                .await
            {
                Ok(provider) => provider,
                Err(e) => {
                    error!(stream = stream_label, error = %e, "failed to connect WebSocket provider");
                    metrics::record_rpc_error("connect");
                    attempts += 1;
                    continue;
                }
            };

            // Broad address-only filter; topic matching happens client-side
            // so one subscription serves any event of the contract.
            let filter = Filter::new().address(self.contract_address);
            let subscription = match provider.subscribe_logs(&filter).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!(stream = stream_label, error = %e, "failed to subscribe to logs");
                    metrics::record_rpc_error("subscribe");
                    attempts += 1;
                    continue;
                }
            };
            let mut live = subscription.into_stream();
            info!(
                stream = stream_label,
                contract = %self.contract_address,
                "watching events"
            );
            attempts = 0;

            let (hist_tx, mut hist_rx) = mpsc::channel::<Log>(1);
            let mut reconcile: Option<JoinHandle<()>> = None;
            if from_block > 0 {
                let head = match tokio::time::timeout(RPC_TIMEOUT, provider.get_block_number()).await {
                    Ok(Ok(head)) => head,
                    Ok(Err(e)) => {
                        error!(stream = stream_label, error = %e, "failed to get latest block");
                        metrics::record_rpc_error("head");
                        attempts += 1;
                        continue;
                    }
                    Err(_) => {
                        error!(stream = stream_label, "timed out getting latest block");
                        metrics::record_rpc_error("head");
                        attempts += 1;
                        continue;
                    }
                };
                reconcile = Some(tokio::spawn(reconcile_block_range(
                    provider.clone(),
                    self.contract_address,
                    topic,
                    head,
                    from_block,
                    from_log_index,
                    hist_tx,
                )));
            } else {
                info!(stream = stream_label, "skipping historical log fetch");
                drop(hist_tx);
            }
            let mut hist_open = reconcile.is_some();

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!(stream = stream_label, "shutdown received, stopping listener");
                        if let Some(task) = reconcile.take() {
                            task.abort();
                        }
                        return Ok(());
                    }
                    maybe_log = hist_rx.recv(), if hist_open => {
                        match maybe_log {
                            Some(log) => {
                                debug!(
                                    stream = stream_label,
                                    block_number = ?log.block_number,
                                    log_index = ?log.log_index,
                                    "received historical event"
                                );
                                if !emit(decode, &log, &sink, stream_label).await {
                                    if let Some(task) = reconcile.take() {
                                        task.abort();
                                    }
                                    return Ok(());
                                }
                            }
                            None => hist_open = false,
                        }
                    }
                    maybe_log = live.next() => {
                        match maybe_log {
                            Some(log) => {
                                if log.topic0() != Some(&topic) {
                                    continue;
                                }
                                if let (Some(block), Some(index)) = (log.block_number, log.log_index) {
                                    from_block = block;
                                    from_log_index = index;
                                }
                                debug!(
                                    stream = stream_label,
                                    block_number = from_block,
                                    log_index = from_log_index,
                                    "received new event"
                                );
                                if !emit(decode, &log, &sink, stream_label).await {
                                    if let Some(task) = reconcile.take() {
                                        task.abort();
                                    }
                                    return Ok(());
                                }
                            }
                            None => {
                                // Error and clean close are treated the same:
                                // drop everything, reconnect, and reconcile the
                                // gap from the last seen position.
                                warn!(stream = stream_label, "subscription closed, resubscribing");
                                if let Some(task) = reconcile.take() {
                                    task.abort();
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl EventListener for ChainListener {
    async fn watch_withdraw_started(
        &self,
        sink: mpsc::Sender<WithdrawStartedEvent>,
        from_block: u64,
        from_log_index: u64,
        shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        self.listen_decoded(
            "withdraw_started",
            ICustody::WithdrawStarted::SIGNATURE_HASH,
            decode_withdraw_started,
            sink,
            from_block,
            from_log_index,
            shutdown,
        )
        .await
    }

    async fn watch_withdraw_finalized(
        &self,
        sink: mpsc::Sender<WithdrawFinalizedEvent>,
        from_block: u64,
        from_log_index: u64,
        shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        self.listen_decoded(
            "withdraw_finalized",
            ICustody::WithdrawFinalized::SIGNATURE_HASH,
            decode_withdraw_finalized,
            sink,
            from_block,
            from_log_index,
            shutdown,
        )
        .await
    }

    async fn watch_deposited(
        &self,
        sink: mpsc::Sender<DepositedEvent>,
        from_block: u64,
        from_log_index: u64,
        shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        self.listen_decoded(
            "deposited",
            ICustody::Deposited::SIGNATURE_HASH,
            decode_deposited,
            sink,
            from_block,
            from_log_index,
            shutdown,
        )
        .await
    }
}

/// Decode and forward one log. Returns false when the sink's receiver is
/// gone and the listener should stop.
async fn emit<T>(
    decode: fn(&Log) -> Option<T>,
    log: &Log,
    sink: &mpsc::Sender<T>,
    stream_label: &str,
) -> bool {
    match decode(log) {
        Some(event) => sink.send(event).await.is_ok(),
        None => {
            error!(
                stream = stream_label,
                tx_hash = ?log.transaction_hash,
                log_index = ?log.log_index,
                "failed to decode log, dropping"
            );
            true
        }
    }
}

/// One-shot pass fetching logs between a saved cursor and `head`, emitting
/// every log strictly after `(last_block, last_index)`.
async fn reconcile_block_range<P: Provider<PubSubFrontend> + 'static>(
    provider: P,
    contract_address: Address,
    topic: B256,
    head: u64,
    last_block: u64,
    last_index: u64,
    sink: mpsc::Sender<Log>,
) {
    let mut attempts: u32 = 0;
    let mut start = last_block;
    let mut end = start + RECONCILE_BLOCK_STEP;

    while head > start {
        if attempts > MAX_BACKOFF_ATTEMPTS {
            error!(start, end, "back-off limit reached, abandoning reconciliation");
            return;
        }
        if attempts > 0 {
            tokio::time::sleep(backoff_delay(attempts)).await;
        }
        if end > head {
            end = head;
        }

        let filter = Filter::new()
            .address(contract_address)
            .event_signature(topic)
            .from_block(start)
            .to_block(end);

        let logs = match tokio::time::timeout(RPC_TIMEOUT, provider.get_logs(&filter)).await {
            Err(_) => {
                error!(start, end, "timed out fetching historical logs");
                metrics::record_rpc_error("get_logs");
                attempts += 1;
                continue;
            }
            Ok(Ok(logs)) => logs,
            Ok(Err(e)) => {
                let msg = e.to_string();
                if msg.contains("Exceeded max range limit for eth_getLogs") {
                    let new_end = end - (end - start) / 2;
                    info!(start, old_end = end, new_end, "eth_getLogs range limit hit, halving window");
                    end = new_end;
                    continue;
                }
                if let Some((advised_start, advised_end)) = extract_advised_block_range(&msg) {
                    info!(
                        start = advised_start,
                        end = advised_end,
                        "retrying with node-advised block range"
                    );
                    start = advised_start;
                    end = advised_end;
                    continue;
                }
                error!(error = %e, start, end, "failed to fetch historical logs");
                metrics::record_rpc_error("get_logs");
                attempts += 1;
                continue;
            }
        };

        info!(count = logs.len(), start, end, "fetched historical logs");
        for log in logs {
            let (Some(block), Some(index)) = (log.block_number, log.log_index) else {
                continue;
            };
            if !is_after_cursor(block, index, last_block, last_index) {
                debug!(block, index, "skipping previously processed event");
                continue;
            }
            if sink.send(log).await.is_err() {
                return;
            }
        }

        start = end + 1;
        end += RECONCILE_BLOCK_STEP;
        attempts = 0;
    }
}

/// Strict lexicographic comparison against a cursor position.
fn is_after_cursor(block: u64, index: u64, cursor_block: u64, cursor_index: u64) -> bool {
    block > cursor_block || (block == cursor_block && index > cursor_index)
}

/// Exponential back-off: min(2^n − 1, cap) seconds.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = (1u64 << attempt.min(32)) - 1;
    BACKOFF_CAP.min(Duration::from_secs(secs))
}

/// Parse the block range a node advises in its "query returned more than
/// 10000 results" error, e.g. `... Try with this block range [0x64, 0xc8]`.
fn extract_advised_block_range(msg: &str) -> Option<(u64, u64)> {
    if !msg.contains("query returned more than 10000 results") {
        return None;
    }
    let open = msg.find('[')?;
    let close = msg[open..].find(']')? + open;
    let (from, to) = msg[open + 1..close].split_once(',')?;
    let parse = |s: &str| u64::from_str_radix(s.trim().strip_prefix("0x")?, 16).ok();
    Some((parse(from)?, parse(to)?))
}

/// Decode a `WithdrawStarted` log together with its on-chain position.
pub fn decode_withdraw_started(log: &Log) -> Option<WithdrawStartedEvent> {
    let decoded = log.log_decode::<ICustody::WithdrawStarted>().ok()?;
    let data = decoded.inner.data;
    Some(WithdrawStartedEvent {
        withdrawal_id: data.withdrawalId,
        user: data.user,
        token: data.token,
        amount: data.amount,
        nonce: data.nonce,
        block_number: log.block_number?,
        tx_hash: log.transaction_hash?,
        log_index: log.log_index?,
    })
}

/// Decode a `WithdrawFinalized` log together with its on-chain position.
pub fn decode_withdraw_finalized(log: &Log) -> Option<WithdrawFinalizedEvent> {
    let decoded = log.log_decode::<ICustody::WithdrawFinalized>().ok()?;
    let data = decoded.inner.data;
    Some(WithdrawFinalizedEvent {
        withdrawal_id: data.withdrawalId,
        success: data.success,
        block_number: log.block_number?,
        tx_hash: log.transaction_hash?,
        log_index: log.log_index?,
    })
}

/// Decode a `Deposited` log together with its on-chain position.
pub fn decode_deposited(log: &Log) -> Option<DepositedEvent> {
    let decoded = log.log_decode::<ICustody::Deposited>().ok()?;
    let data = decoded.inner.data;
    Some(DepositedEvent {
        user: data.user,
        token: data.token,
        amount: data.amount,
        block_number: log.block_number?,
        tx_hash: log.transaction_hash?,
        log_index: log.log_index?,
    })
}
