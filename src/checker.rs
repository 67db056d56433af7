//! Withdrawal rate-limit policy.
//!
//! Global per-token limits gate every request; a per-user override, when
//! configured for the `(user, token)` pair, is an additional check on top —
//! both must pass. Windows are epoch-aligned (hour and 24-hour boundaries on
//! unix time), not calendar-aligned.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::db::{GuardStore, StoreError};
use crate::types::Withdrawal;

const HOUR_SECS: i64 = 3600;
const DAY_SECS: i64 = 24 * 3600;

/// Rate limits for one token. Either side may be absent.
#[derive(Debug, Clone, Default)]
pub struct Limit {
    pub hourly: Option<U256>,
    pub daily: Option<U256>,
}

/// Why a withdrawal was blocked. Variants are matchable; the rendered
/// message is what gets persisted as the rejection reason.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("user address must not be zero")]
    InvalidUser,
    #[error("no limits configured for token {0}")]
    NoLimitsConfigured(Address),
    #[error("hourly limit exceeded for {token}: {total} > {limit}")]
    HourlyLimitExceeded {
        token: Address,
        total: U256,
        limit: U256,
    },
    #[error("daily limit exceeded for {token}: {total} > {limit}")]
    DailyLimitExceeded {
        token: Address,
        total: U256,
        limit: U256,
    },
    #[error("per-user hourly limit exceeded for user {user} token {token}: {total} > {limit}")]
    UserHourlyLimitExceeded {
        user: Address,
        token: Address,
        total: U256,
        limit: U256,
    },
    #[error("per-user daily limit exceeded for user {user} token {token}: {total} > {limit}")]
    UserDailyLimitExceeded {
        user: Address,
        token: Address,
        total: U256,
        limit: U256,
    },
    /// Adding the requested amount to the window total wrapped u256.
    /// Unreachable for real token supplies, but the guard fails closed.
    #[error("withdrawn total plus amount overflows u256")]
    AmountOverflow,
    #[error("failed to query withdrawn amounts: {0}")]
    Store(#[from] StoreError),
}

/// Pure policy object; reads the ledger, never writes except through
/// [`Checker::record`].
pub struct Checker {
    global_limits: HashMap<Address, Limit>,
    user_overrides: HashMap<Address, HashMap<Address, Limit>>,
    store: Arc<dyn GuardStore>,
    now_fn: fn() -> DateTime<Utc>,
}

impl Checker {
    pub fn new(
        global_limits: HashMap<Address, Limit>,
        user_overrides: HashMap<Address, HashMap<Address, Limit>>,
        store: Arc<dyn GuardStore>,
    ) -> Self {
        Self {
            global_limits,
            user_overrides,
            store,
            now_fn: Utc::now,
        }
    }

    /// Accept or reject `(user, token, amount)` against the configured
    /// limits and the persisted ledger.
    pub async fn check(
        &self,
        user: Address,
        token: Address,
        amount: U256,
    ) -> Result<(), PolicyError> {
        if amount.is_zero() {
            return Err(PolicyError::InvalidAmount);
        }
        if user == Address::ZERO {
            return Err(PolicyError::InvalidUser);
        }

        self.check_global_limits(token, amount).await?;
        self.check_user_limits(user, token, amount).await?;

        Ok(())
    }

    /// Record a finalized withdrawal into the ledger.
    pub async fn record(&self, w: &Withdrawal) -> Result<(), StoreError> {
        self.store.save_finalized(w).await
    }

    async fn check_global_limits(&self, token: Address, amount: U256) -> Result<(), PolicyError> {
        let limit = self
            .global_limits
            .get(&token)
            .ok_or(PolicyError::NoLimitsConfigured(token))?;

        let now = (self.now_fn)();

        if let Some(hourly) = limit.hourly {
            let since = truncate_to_window(now, HOUR_SECS);
            let total = self.store.total_withdrawn(token, since).await?;
            let new_total = total.checked_add(amount).ok_or(PolicyError::AmountOverflow)?;
            if new_total > hourly {
                return Err(PolicyError::HourlyLimitExceeded {
                    token,
                    total: new_total,
                    limit: hourly,
                });
            }
        }

        if let Some(daily) = limit.daily {
            let since = truncate_to_window(now, DAY_SECS);
            let total = self.store.total_withdrawn(token, since).await?;
            let new_total = total.checked_add(amount).ok_or(PolicyError::AmountOverflow)?;
            if new_total > daily {
                return Err(PolicyError::DailyLimitExceeded {
                    token,
                    total: new_total,
                    limit: daily,
                });
            }
        }

        Ok(())
    }

    fn resolve_user_limit(&self, user: Address, token: Address) -> Option<&Limit> {
        self.user_overrides.get(&user)?.get(&token)
    }

    async fn check_user_limits(
        &self,
        user: Address,
        token: Address,
        amount: U256,
    ) -> Result<(), PolicyError> {
        let Some(limit) = self.resolve_user_limit(user, token) else {
            return Ok(());
        };

        let now = (self.now_fn)();

        if let Some(hourly) = limit.hourly {
            let since = truncate_to_window(now, HOUR_SECS);
            let total = self.store.total_withdrawn_by_user(user, token, since).await?;
            let new_total = total.checked_add(amount).ok_or(PolicyError::AmountOverflow)?;
            if new_total > hourly {
                return Err(PolicyError::UserHourlyLimitExceeded {
                    user,
                    token,
                    total: new_total,
                    limit: hourly,
                });
            }
        }

        if let Some(daily) = limit.daily {
            let since = truncate_to_window(now, DAY_SECS);
            let total = self.store.total_withdrawn_by_user(user, token, since).await?;
            let new_total = total.checked_add(amount).ok_or(PolicyError::AmountOverflow)?;
            if new_total > daily {
                return Err(PolicyError::UserDailyLimitExceeded {
                    user,
                    token,
                    total: new_total,
                    limit: daily,
                });
            }
        }

        Ok(())
    }
}

/// Truncate to the enclosing window boundary, aligned to epoch seconds
/// divisible by the window length.
fn truncate_to_window(now: DateTime<Utc>, window_secs: i64) -> DateTime<Utc> {
    let rem = now.timestamp().rem_euclid(window_secs);
    now - Duration::seconds(rem) - Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos()))
}
