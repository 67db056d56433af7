//! Durable guard ledger backed by SQLite.
//!
//! Three tables: finalized withdrawals (what the rate limits aggregate
//! over), the processed-event log (idempotency), and per-stream block
//! cursors. The processed-event insert and the cursor advance are a single
//! transaction.

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use crate::types::Withdrawal;

pub mod models;

pub use models::*;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The withdrawal id already exists in the finalized table.
    #[error("withdrawal {0} already recorded")]
    Duplicate(String),
    /// A persisted amount failed to parse back as an unsigned decimal.
    #[error("corrupted amount in withdrawal {withdrawal_id}: {value:?}")]
    CorruptAmount {
        withdrawal_id: String,
        value: String,
    },
    /// Summing a window of withdrawals overflowed u256.
    #[error("withdrawn total overflows u256")]
    TotalOverflow,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Storage operations the guard depends on. Object-safe so tests can inject
/// in-memory fakes.
#[async_trait]
pub trait GuardStore: Send + Sync {
    /// Insert a finalized withdrawal. Fails with [`StoreError::Duplicate`]
    /// if the withdrawal id already exists.
    async fn save_finalized(&self, w: &Withdrawal) -> Result<(), StoreError>;

    /// Sum of finalized amounts for `token` with `timestamp >= since`.
    async fn total_withdrawn(
        &self,
        token: Address,
        since: DateTime<Utc>,
    ) -> Result<U256, StoreError>;

    /// Same as [`GuardStore::total_withdrawn`], additionally filtered by user.
    async fn total_withdrawn_by_user(
        &self,
        user: Address,
        token: Address,
        since: DateTime<Utc>,
    ) -> Result<U256, StoreError>;

    /// Whether a processed-event row exists for this withdrawal id.
    async fn has_processed(&self, withdrawal_id: B256) -> Result<bool, StoreError>;

    /// Atomically insert the processed-event row (no-op on conflict) and
    /// advance the named stream cursor to the event's position.
    async fn record_processed(&self, stream: &str, ev: &NewWithdrawEvent)
        -> Result<(), StoreError>;

    /// Last fully processed `(block_number, log_index)` for a stream;
    /// `(0, 0)` when the stream has no cursor yet.
    async fn cursor(&self, stream: &str) -> Result<(u64, u64), StoreError>;
}

/// SQLite-backed [`GuardStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database file and run migrations.
    pub async fn connect(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .wrap_err_with(|| format!("Failed to open database {}", db_path))?;
        Self::with_pool(pool).await
    }

    /// In-memory database, used by tests.
    pub async fn connect_in_memory() -> Result<Self> {
        // A single connection: every :memory: connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .wrap_err("Failed to open in-memory database")?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .wrap_err("Failed to run database migrations")?;
        Ok(Self { pool })
    }

    /// Fetch a finalized-withdrawal row by withdrawal id.
    pub async fn finalized_withdrawal(
        &self,
        withdrawal_id: B256,
    ) -> Result<Option<WithdrawalRow>, StoreError> {
        let row = sqlx::query_as::<_, WithdrawalRow>(
            r#"SELECT id, withdrawal_id, user_address, token_address, amount, block_number,
                      tx_hash, timestamp
               FROM withdrawals WHERE withdrawal_id = ?"#,
        )
        .bind(hash_hex(withdrawal_id))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Fetch a processed-event row by withdrawal id.
    pub async fn processed_event(
        &self,
        withdrawal_id: B256,
    ) -> Result<Option<WithdrawEventRow>, StoreError> {
        let row = sqlx::query_as::<_, WithdrawEventRow>(
            r#"SELECT id, withdrawal_id, user_address, token_address, amount, decision, reason,
                      block_number, tx_hash, log_index, created_at
               FROM withdraw_events WHERE withdrawal_id = ?"#,
        )
        .bind(hash_hex(withdrawal_id))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn sum_filtered(
        &self,
        user: Option<Address>,
        token: Address,
        since: DateTime<Utc>,
    ) -> Result<U256, StoreError> {
        let rows: Vec<(String, String)> = match user {
            Some(user) => {
                sqlx::query_as(
                    r#"SELECT withdrawal_id, amount FROM withdrawals
                       WHERE user_address = ? AND token_address = ? AND timestamp >= ?"#,
                )
                .bind(addr_hex(user))
                .bind(addr_hex(token))
                .bind(since.timestamp())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"SELECT withdrawal_id, amount FROM withdrawals
                       WHERE token_address = ? AND timestamp >= ?"#,
                )
                .bind(addr_hex(token))
                .bind(since.timestamp())
                .fetch_all(&self.pool)
                .await?
            }
        };

        sum_amounts(&rows)
    }
}

#[async_trait]
impl GuardStore for SqliteStore {
    async fn save_finalized(&self, w: &Withdrawal) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO withdrawals
               (withdrawal_id, user_address, token_address, amount, block_number, tx_hash, timestamp)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(hash_hex(w.withdrawal_id))
        .bind(addr_hex(w.user))
        .bind(addr_hex(w.token))
        .bind(w.amount.to_string())
        .bind(w.block_number as i64)
        .bind(hash_hex(w.tx_hash))
        .bind(w.timestamp.timestamp())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(hash_hex(w.withdrawal_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn total_withdrawn(
        &self,
        token: Address,
        since: DateTime<Utc>,
    ) -> Result<U256, StoreError> {
        self.sum_filtered(None, token, since).await
    }

    async fn total_withdrawn_by_user(
        &self,
        user: Address,
        token: Address,
        since: DateTime<Utc>,
    ) -> Result<U256, StoreError> {
        self.sum_filtered(Some(user), token, since).await
    }

    async fn has_processed(&self, withdrawal_id: B256) -> Result<bool, StoreError> {
        let row: (bool,) = sqlx::query_as(
            r#"SELECT EXISTS(SELECT 1 FROM withdraw_events WHERE withdrawal_id = ?)"#,
        )
        .bind(hash_hex(withdrawal_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn record_processed(
        &self,
        stream: &str,
        ev: &NewWithdrawEvent,
    ) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO withdraw_events
               (withdrawal_id, user_address, token_address, amount, decision, reason,
                block_number, tx_hash, log_index, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(withdrawal_id) DO NOTHING"#,
        )
        .bind(hash_hex(ev.withdrawal_id))
        .bind(addr_hex(ev.user))
        .bind(addr_hex(ev.token))
        .bind(ev.amount.to_string())
        .bind(ev.decision.as_str())
        .bind(&ev.reason)
        .bind(ev.block_number as i64)
        .bind(hash_hex(ev.tx_hash))
        .bind(ev.log_index as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // The guard on the upsert keeps the cursor monotonic even when live
        // and historical emissions interleave out of order.
        sqlx::query(
            r#"INSERT INTO block_cursors (stream_name, block_number, log_index, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(stream_name) DO UPDATE SET
                   block_number = excluded.block_number,
                   log_index = excluded.log_index,
                   updated_at = excluded.updated_at
               WHERE excluded.block_number > block_cursors.block_number
                  OR (excluded.block_number = block_cursors.block_number
                      AND excluded.log_index > block_cursors.log_index)"#,
        )
        .bind(stream)
        .bind(ev.block_number as i64)
        .bind(ev.log_index as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cursor(&self, stream: &str) -> Result<(u64, u64), StoreError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"SELECT block_number, log_index FROM block_cursors WHERE stream_name = ?"#,
        )
        .bind(stream)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some((block, index)) => (block as u64, index as u64),
            None => (0, 0),
        })
    }
}

fn addr_hex(addr: Address) -> String {
    format!("{:#x}", addr)
}

fn hash_hex(hash: B256) -> String {
    format!("{:#x}", hash)
}

fn sum_amounts(rows: &[(String, String)]) -> Result<U256, StoreError> {
    let mut total = U256::ZERO;
    for (withdrawal_id, amount) in rows {
        let parsed = U256::from_str_radix(amount, 10).map_err(|_| StoreError::CorruptAmount {
            withdrawal_id: withdrawal_id.clone(),
            value: amount.clone(),
        })?;
        total = total.checked_add(parsed).ok_or(StoreError::TotalOverflow)?;
    }
    Ok(total)
}
