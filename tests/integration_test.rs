//! End-to-end tests for the enforcement pipeline
//!
//! Run with: cargo test --test integration_test -- --nocapture
//!
//! Prerequisites:
//! - A dev node (e.g. anvil) reachable over WebSocket
//! - The custody contract deployed, with the guard key holding the guard
//!   role and the initiator key holding the initiator role
//! - NITEWATCH_TEST_RPC_URL, NITEWATCH_TEST_CONTRACT,
//!   NITEWATCH_TEST_GUARD_KEY, NITEWATCH_TEST_INITIATOR_KEY set
//!
//! Tests skip silently when the environment is not configured.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::signers::local::PrivateKeySigner;
use tokio::sync::mpsc;

use nitewatch::checker::{Checker, Limit};
use nitewatch::contracts::ICustody;
use nitewatch::db::{GuardStore, SqliteStore, WithdrawEventRow};
use nitewatch::listener::{decode_withdraw_started, ChainListener, EventListener};
use nitewatch::types::WithdrawStartedEvent;
use nitewatch::worker::DecisionWorker;

/// Test configuration loaded from environment variables
struct TestEnv {
    rpc_url: String,
    contract_address: Address,
    guard_key: String,
    initiator_key: String,
}

impl TestEnv {
    fn from_env() -> Option<Self> {
        Some(TestEnv {
            rpc_url: std::env::var("NITEWATCH_TEST_RPC_URL").ok()?,
            contract_address: std::env::var("NITEWATCH_TEST_CONTRACT")
                .ok()?
                .parse()
                .ok()?,
            guard_key: std::env::var("NITEWATCH_TEST_GUARD_KEY").ok()?,
            initiator_key: std::env::var("NITEWATCH_TEST_INITIATOR_KEY").ok()?,
        })
    }
}

/// Check node connectivity over WebSocket
async fn node_reachable(rpc_url: &str) -> bool {
    match ProviderBuilder::new()
        .on_ws(WsConnect::new(rpc_url.to_string()))
        .await
    {
        Ok(provider) => provider.get_block_number().await.is_ok(),
        Err(_) => false,
    }
}

struct Pipeline {
    store: Arc<SqliteStore>,
    shutdown_listener: mpsc::Sender<()>,
    shutdown_worker: mpsc::Sender<()>,
    listener_handle: tokio::task::JoinHandle<eyre::Result<()>>,
    worker_handle: tokio::task::JoinHandle<eyre::Result<()>>,
}

/// Spin up listener + worker against a fresh in-memory ledger.
async fn start_pipeline(env: &TestEnv, hourly_limit_wei: u64) -> Pipeline {
    let store = Arc::new(SqliteStore::connect_in_memory().await.unwrap());

    let global_limits = HashMap::from([(
        Address::ZERO,
        Limit {
            hourly: Some(U256::from(hourly_limit_wei)),
            daily: None,
        },
    )]);
    let checker = Checker::new(
        global_limits,
        HashMap::new(),
        store.clone() as Arc<dyn GuardStore>,
    );

    let guard_signer: PrivateKeySigner = env.guard_key.parse().unwrap();
    let worker = DecisionWorker::new(
        env.rpc_url.clone(),
        env.contract_address,
        guard_signer,
        checker,
        store.clone() as Arc<dyn GuardStore>,
        Arc::new(AtomicBool::new(false)),
    );
    let listener = ChainListener::new(env.rpc_url.clone(), env.contract_address);

    let (event_tx, event_rx) = mpsc::channel::<WithdrawStartedEvent>(100);
    let (shutdown_listener, shutdown_listener_rx) = mpsc::channel::<()>(1);
    let (shutdown_worker, shutdown_worker_rx) = mpsc::channel::<()>(1);

    let listener_handle = tokio::spawn(async move {
        listener
            .watch_withdraw_started(event_tx, 0, 0, shutdown_listener_rx)
            .await
    });
    let worker_handle =
        tokio::spawn(async move { worker.run(event_rx, shutdown_worker_rx).await });

    Pipeline {
        store,
        shutdown_listener,
        shutdown_worker,
        listener_handle,
        worker_handle,
    }
}

impl Pipeline {
    async fn shutdown(self) {
        let _ = self.shutdown_listener.send(()).await;
        let _ = self.shutdown_worker.send(()).await;
        let _ = self.listener_handle.await;
        let _ = self.worker_handle.await;
    }
}

/// Submit a startWithdraw as the initiator and return the observed event.
async fn start_withdraw(
    env: &TestEnv,
    user: Address,
    amount: U256,
    nonce: u64,
) -> WithdrawStartedEvent {
    let initiator: PrivateKeySigner = env.initiator_key.parse().unwrap();
    let provider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(initiator))
        .on_ws(WsConnect::new(env.rpc_url.clone()))
        .await
        .unwrap();
    let custody = ICustody::new(env.contract_address, &provider);

    let receipt = custody
        .startWithdraw(user, Address::ZERO, amount, U256::from(nonce))
        .send()
        .await
        .expect("startWithdraw sent")
        .get_receipt()
        .await
        .expect("startWithdraw mined");
    assert!(receipt.status(), "startWithdraw reverted");

    receipt
        .inner
        .logs()
        .iter()
        .find_map(decode_withdraw_started)
        .expect("WithdrawStarted event in receipt")
}

/// Poll until a processed-event row appears for the withdrawal id.
async fn wait_for_decision(
    store: &SqliteStore,
    withdrawal_id: B256,
    timeout: Duration,
) -> Option<WithdrawEventRow> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Some(row) = store.processed_event(withdrawal_id).await.unwrap() {
            return Some(row);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    None
}

const FIVE_TENTHS_ETH: u64 = 500_000_000_000_000_000;
const ONE_TENTH_ETH: u64 = 100_000_000_000_000_000;
// ~18.4 ETH in wei; far above any test amount.
const GENEROUS_HOURLY: u64 = u64::MAX;

#[tokio::test]
async fn test_happy_path_finalizes_and_records() {
    let Some(env) = TestEnv::from_env() else {
        eprintln!("skipping: NITEWATCH_TEST_* environment not set");
        return;
    };
    if !node_reachable(&env.rpc_url).await {
        eprintln!("skipping: node unreachable at {}", env.rpc_url);
        return;
    }

    let pipeline = start_pipeline(&env, GENEROUS_HOURLY).await;
    let user: Address = "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".parse().unwrap();

    let event = start_withdraw(&env, user, U256::from(FIVE_TENTHS_ETH), 1).await;
    let row = wait_for_decision(&pipeline.store, event.withdrawal_id, Duration::from_secs(30))
        .await
        .expect("decision recorded");

    assert_eq!(row.decision, "approved");
    assert_eq!(row.reason, "");

    // The finalized ledger row exists and feeds the rate limits.
    let finalized = pipeline
        .store
        .finalized_withdrawal(event.withdrawal_id)
        .await
        .unwrap()
        .expect("finalized row exists");
    assert_eq!(finalized.amount, U256::from(FIVE_TENTHS_ETH).to_string());

    let total = pipeline
        .store
        .total_withdrawn(Address::ZERO, chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)
        .await
        .unwrap();
    assert_eq!(total, U256::from(FIVE_TENTHS_ETH));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_over_limit_withdrawal_rejected() {
    let Some(env) = TestEnv::from_env() else {
        eprintln!("skipping: NITEWATCH_TEST_* environment not set");
        return;
    };
    if !node_reachable(&env.rpc_url).await {
        eprintln!("skipping: node unreachable at {}", env.rpc_url);
        return;
    }

    // Hourly cap below the requested amount: the guard must reject.
    let pipeline = start_pipeline(&env, ONE_TENTH_ETH).await;
    let user: Address = "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".parse().unwrap();

    let event = start_withdraw(&env, user, U256::from(FIVE_TENTHS_ETH), 2).await;
    let row = wait_for_decision(&pipeline.store, event.withdrawal_id, Duration::from_secs(30))
        .await
        .expect("decision recorded");

    assert_eq!(row.decision, "rejected");
    assert!(
        row.reason.contains("hourly limit exceeded"),
        "unexpected reason: {}",
        row.reason
    );

    // No finalized row was written.
    let total = pipeline
        .store
        .total_withdrawn(Address::ZERO, chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)
        .await
        .unwrap();
    assert_eq!(total, U256::ZERO);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_event_is_not_reprocessed() {
    let Some(env) = TestEnv::from_env() else {
        eprintln!("skipping: NITEWATCH_TEST_* environment not set");
        return;
    };
    if !node_reachable(&env.rpc_url).await {
        eprintln!("skipping: node unreachable at {}", env.rpc_url);
        return;
    }

    let pipeline = start_pipeline(&env, GENEROUS_HOURLY).await;
    let user: Address = "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".parse().unwrap();

    let event = start_withdraw(&env, user, U256::from(FIVE_TENTHS_ETH), 3).await;
    let first = wait_for_decision(&pipeline.store, event.withdrawal_id, Duration::from_secs(30))
        .await
        .expect("decision recorded");
    assert_eq!(first.decision, "approved");

    // Restart the pipeline from cursor zero so the event is re-observed via
    // reconciliation; the idempotency gate must make the replay a no-op.
    let store = pipeline.store.clone();
    pipeline.shutdown().await;
    let checker = Checker::new(
        HashMap::from([(
            Address::ZERO,
            Limit {
                hourly: Some(U256::from(GENEROUS_HOURLY)),
                daily: None,
            },
        )]),
        HashMap::new(),
        store.clone() as Arc<dyn GuardStore>,
    );
    let guard_signer: PrivateKeySigner = env.guard_key.parse().unwrap();
    let worker = DecisionWorker::new(
        env.rpc_url.clone(),
        env.contract_address,
        guard_signer,
        checker,
        store.clone() as Arc<dyn GuardStore>,
        Arc::new(AtomicBool::new(false)),
    );
    let listener = ChainListener::new(env.rpc_url.clone(), env.contract_address);

    let (event_tx, event_rx) = mpsc::channel::<WithdrawStartedEvent>(100);
    let (shutdown_listener, shutdown_listener_rx) = mpsc::channel::<()>(1);
    let (shutdown_worker, shutdown_worker_rx) = mpsc::channel::<()>(1);

    // from_block = 1 forces a reconciliation pass over the already
    // processed range.
    let listener_handle = tokio::spawn(async move {
        listener
            .watch_withdraw_started(event_tx, 1, 0, shutdown_listener_rx)
            .await
    });
    let worker_handle =
        tokio::spawn(async move { worker.run(event_rx, shutdown_worker_rx).await });

    // Give the replay time to land, then verify nothing changed.
    tokio::time::sleep(Duration::from_secs(5)).await;

    let row = store
        .processed_event(event.withdrawal_id)
        .await
        .unwrap()
        .expect("row still present");
    assert_eq!(row.id, first.id);
    assert_eq!(row.decision, "approved");

    let total = store
        .total_withdrawn(Address::ZERO, chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)
        .await
        .unwrap();
    assert_eq!(total, U256::from(FIVE_TENTHS_ETH));

    let _ = shutdown_listener.send(()).await;
    let _ = shutdown_worker.send(()).await;
    let _ = listener_handle.await;
    let _ = worker_handle.await;
}
