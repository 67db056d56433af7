//! Service aggregate: owns every long-lived component and drives the
//! listener, worker, and health server under one shutdown signal.

use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use eyre::{eyre, Result, WrapErr};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::checker::{Checker, Limit};
use crate::config::{Config, LimitsConfig};
use crate::db::{GuardStore, SqliteStore};
use crate::listener::{ChainListener, EventListener};
use crate::types::{WithdrawStartedEvent, WITHDRAW_STARTED_STREAM};
use crate::worker::DecisionWorker;

pub struct Service {
    config: Config,
    store: Arc<SqliteStore>,
    listener: Arc<dyn EventListener>,
    worker: DecisionWorker,
    worker_ready: Arc<AtomicBool>,
    chain_id: u64,
}

impl Service {
    /// Build the aggregate: open the ledger, parse limits, pin the chain id,
    /// and wire checker, listener, and worker together.
    pub async fn new(config: Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::connect(&config.db_path).await?);

        let global_limits = parse_limits_config(&config.limits)?;
        let user_overrides = parse_user_overrides(&config.per_user_overrides)?;

        let contract_address = config.blockchain.contract_address()?;

        // One connection up front validates the endpoint and pins the chain
        // id for the signer; listener and worker dial their own connections.
        let provider = ProviderBuilder::new()
            .on_ws(WsConnect::new(config.blockchain.rpc_url.clone()))
            .await
            .wrap_err("Failed to connect to blockchain RPC")?;
        let chain_id = provider
            .get_chain_id()
            .await
            .wrap_err("Failed to get chain ID")?;
        drop(provider);

        let signer: PrivateKeySigner = config
            .blockchain
            .private_key
            .parse()
            .wrap_err("Failed to parse private key")?;
        let signer = signer.with_chain_id(Some(chain_id));

        info!(
            chain_id,
            guard_address = %signer.address(),
            contract_address = %contract_address,
            "service initialized"
        );

        let checker = Checker::new(
            global_limits,
            user_overrides,
            store.clone() as Arc<dyn GuardStore>,
        );
        let listener: Arc<dyn EventListener> = Arc::new(ChainListener::new(
            config.blockchain.rpc_url.clone(),
            contract_address,
        ));
        let worker_ready = Arc::new(AtomicBool::new(false));
        let worker = DecisionWorker::new(
            config.blockchain.rpc_url.clone(),
            contract_address,
            signer,
            checker,
            store.clone() as Arc<dyn GuardStore>,
            worker_ready.clone(),
        );

        Ok(Self {
            config,
            store,
            listener,
            worker,
            worker_ready,
            chain_id,
        })
    }

    pub fn is_worker_ready(&self) -> bool {
        self.worker_ready.load(Ordering::SeqCst)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Run until a shutdown signal or the first task failure. Returns the
    /// failing task's error, which the CLI turns into exit code 1.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx_listener) = mpsc::channel::<()>(1);
        let (shutdown_tx2, shutdown_rx_worker) = mpsc::channel::<()>(1);
        let (shutdown_tx3, shutdown_rx_api) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            let _ = shutdown_tx.send(()).await;
            let _ = shutdown_tx2.send(()).await;
            let _ = shutdown_tx3.send(()).await;
        });

        let listen_addr = self.config.listen_socket_addr()?;
        let api_state = AppState {
            worker_ready: self.worker_ready.clone(),
        };

        let (from_block, from_log_index) = match self.store.cursor(WITHDRAW_STARTED_STREAM).await {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(error = %e, "failed to read withdraw_started cursor, starting from head");
                (0, 0)
            }
        };
        info!(from_block, from_log_index, "starting WithdrawStarted event watcher");

        let (event_tx, event_rx) = mpsc::channel::<WithdrawStartedEvent>(100);

        tokio::select! {
            result = self.listener.watch_withdraw_started(
                event_tx,
                from_block,
                from_log_index,
                shutdown_rx_listener,
            ) => {
                if let Err(e) = &result {
                    error!(error = %e, "event listener failed");
                }
                result
            }
            result = self.worker.run(event_rx, shutdown_rx_worker) => {
                if let Err(e) = &result {
                    error!(error = %e, "decision worker failed");
                }
                result
            }
            result = api::serve(listen_addr, api_state, shutdown_rx_api) => {
                if let Err(e) = &result {
                    error!(error = %e, "health endpoint server failed");
                }
                result
            }
        }
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}

fn parse_limits_config(limits: &LimitsConfig) -> Result<HashMap<Address, Limit>> {
    let mut parsed = HashMap::new();
    for (addr, entry) in limits {
        let token =
            Address::from_str(addr).map_err(|_| eyre!("invalid token address: {}", addr))?;
        let mut limit = Limit::default();
        if let Some(hourly) = &entry.hourly {
            limit.hourly = Some(
                U256::from_str_radix(hourly, 10)
                    .map_err(|_| eyre!("invalid hourly limit for {}: {}", addr, hourly))?,
            );
        }
        if let Some(daily) = &entry.daily {
            limit.daily = Some(
                U256::from_str_radix(daily, 10)
                    .map_err(|_| eyre!("invalid daily limit for {}: {}", addr, daily))?,
            );
        }
        parsed.insert(token, limit);
    }
    Ok(parsed)
}

fn parse_user_overrides(
    overrides: &HashMap<String, LimitsConfig>,
) -> Result<HashMap<Address, HashMap<Address, Limit>>> {
    let mut parsed = HashMap::new();
    for (user_addr, token_limits) in overrides {
        let user = Address::from_str(user_addr)
            .map_err(|_| eyre!("invalid user address in per_user_overrides: {}", user_addr))?;
        let limits = parse_limits_config(token_limits)
            .wrap_err_with(|| format!("per-user overrides for {}", user_addr))?;
        parsed.insert(user, limits);
    }
    Ok(parsed)
}
