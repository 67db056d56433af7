//! Decision worker — submits finalize/reject transactions for observed
//! withdrawal requests.
//!
//! A single task owns the signing key, so nonces are consumed sequentially;
//! running concurrent workers against one key is not supported. Per event:
//! idempotency gate, policy check, finalize-or-reject submission, mined
//! wait, then one persisted processed-event row + cursor advance.

use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::pubsub::PubSubFrontend;
use alloy::signers::local::PrivateKeySigner;
use chrono::Utc;
use eyre::{Result, WrapErr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::checker::Checker;
use crate::contracts::ICustody;
use crate::db::{GuardStore, NewWithdrawEvent};
use crate::metrics;
use crate::types::{Decision, Withdrawal, WithdrawStartedEvent, WITHDRAW_STARTED_STREAM};

pub struct DecisionWorker {
    ws_url: String,
    contract_address: Address,
    signer: PrivateKeySigner,
    checker: Checker,
    store: Arc<dyn GuardStore>,
    ready: Arc<AtomicBool>,
}

impl DecisionWorker {
    pub fn new(
        ws_url: impl Into<String>,
        contract_address: Address,
        signer: PrivateKeySigner,
        checker: Checker,
        store: Arc<dyn GuardStore>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            contract_address,
            signer,
            checker,
            store,
            ready,
        }
    }

    /// Consume events until shutdown is signalled or the channel closes.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<WithdrawStartedEvent>,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .on_ws(WsConnect::new(self.ws_url.clone()))
            .await
            .wrap_err("Failed to connect worker WebSocket provider")?;

        self.ready.store(true, Ordering::SeqCst);
        info!(guard_address = %self.signer.address(), "decision worker ready");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("shutdown received, stopping decision worker");
                    return Ok(());
                }
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => self.process(&provider, event).await,
                        None => {
                            info!("event channel closed, stopping decision worker");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn process<P: Provider<PubSubFrontend>>(&self, provider: &P, event: WithdrawStartedEvent) {
        let withdrawal_id = format!("{:#x}", event.withdrawal_id);

        match self.store.has_processed(event.withdrawal_id).await {
            Ok(true) => {
                info!(withdrawal_id, "event already processed, skipping");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                // Not recorded: the event is re-observed after restart and
                // the idempotency gate reconciles.
                error!(withdrawal_id, error = %e, "failed idempotency check, dropping event");
                return;
            }
        }

        info!(
            withdrawal_id,
            user = %event.user,
            token = %event.token,
            amount = %event.amount,
            "processing withdrawal request"
        );

        let contract = ICustody::new(self.contract_address, provider);

        if let Err(policy_err) = self.checker.check(event.user, event.token, event.amount).await {
            warn!(withdrawal_id, reason = %policy_err, "withdrawal blocked by policy, rejecting");

            match contract.rejectWithdraw(event.withdrawal_id).send().await {
                Err(e) => {
                    error!(withdrawal_id, error = %e, "failed to reject withdrawal");
                    self.record(&event, Decision::Error, format!("reject tx failed: {e}"))
                        .await;
                }
                Ok(pending) => {
                    info!(withdrawal_id, tx_hash = %pending.tx_hash(), "sent reject transaction");
                    match pending.get_receipt().await {
                        Err(e) => {
                            error!(withdrawal_id, error = %e, "failed waiting for reject tx");
                            self.record(
                                &event,
                                Decision::Error,
                                format!("reject tx mining failed: {e}"),
                            )
                            .await;
                        }
                        Ok(receipt) if !receipt.status() => {
                            error!(withdrawal_id, "reject tx reverted on-chain");
                            self.record(
                                &event,
                                Decision::Error,
                                "reject tx reverted on-chain".to_string(),
                            )
                            .await;
                        }
                        Ok(_) => {
                            self.record(&event, Decision::Rejected, policy_err.to_string())
                                .await;
                        }
                    }
                }
            }
            return;
        }

        match contract.finalizeWithdraw(event.withdrawal_id).send().await {
            Err(e) => {
                error!(withdrawal_id, error = %e, "failed to finalize withdrawal");
                self.record(&event, Decision::Error, format!("finalize tx failed: {e}"))
                    .await;
            }
            Ok(pending) => {
                info!(withdrawal_id, tx_hash = %pending.tx_hash(), "sent finalize transaction");
                match pending.get_receipt().await {
                    Err(e) => {
                        error!(withdrawal_id, error = %e, "failed waiting for finalize tx");
                        self.record(
                            &event,
                            Decision::Error,
                            format!("finalize tx mining failed: {e}"),
                        )
                        .await;
                    }
                    Ok(receipt) if receipt.status() => {
                        info!(withdrawal_id, "withdrawal finalized on-chain");

                        let withdrawal = Withdrawal {
                            withdrawal_id: event.withdrawal_id,
                            user: event.user,
                            token: event.token,
                            amount: event.amount,
                            block_number: receipt.block_number.unwrap_or(event.block_number),
                            tx_hash: receipt.transaction_hash,
                            timestamp: Utc::now(),
                        };
                        if let Err(e) = self.checker.record(&withdrawal).await {
                            error!(withdrawal_id, error = %e, "failed to record finalized withdrawal");
                        }

                        self.record(&event, Decision::Approved, String::new()).await;
                    }
                    Ok(_) => {
                        error!(withdrawal_id, "finalize tx reverted on-chain");
                        self.record(
                            &event,
                            Decision::Error,
                            "finalize tx reverted on-chain".to_string(),
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn record(&self, event: &WithdrawStartedEvent, decision: Decision, reason: String) {
        let row = NewWithdrawEvent::from_event(event, decision, reason);
        if let Err(e) = self
            .store
            .record_processed(WITHDRAW_STARTED_STREAM, &row)
            .await
        {
            error!(
                withdrawal_id = %format!("{:#x}", event.withdrawal_id),
                error = %e,
                "failed to record withdraw event"
            );
        }
        metrics::record_decision(decision.as_str(), event.block_number);
    }
}
