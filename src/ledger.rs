//! Credits and per-download cost.
//!
//! Every balance mutation for a user runs under that user's lock, so two
//! debits can never both pass the balance check.

use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::error::LedgerError;
use crate::core::metrics;
use crate::core::plans::Plan;
use crate::storage::{keys, AnalyticsEvent, Cache, Persistence, UserUpdate};

/// Credits charged for a download of `file_size_mb` on `plan`.
///
/// Free plans cost nothing; paid plans cost one credit per started 100 MB
/// (at least one), scaled by the plan multiplier and never below one.
pub fn calculate_cost(file_size_mb: f64, plan: &Plan) -> i64 {
    if !plan.uses_credits() {
        return 0;
    }
    let base = ((file_size_mb / 100.0).floor() as i64).max(1);
    let scaled = (base as f64 * plan.cost_multiplier).floor() as i64;
    scaled.max(1)
}

pub struct Ledger {
    store: Arc<dyn Persistence>,
    cache: Arc<dyn Cache>,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Persistence>, cache: Arc<dyn Cache>) -> Self {
        Self {
            store,
            cache,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, user_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn forget_lock(&self, user_id: i64) {
        // Only the map holds it once every caller is done.
        self.locks.remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub async fn balance(&self, user_id: i64) -> Result<i64, LedgerError> {
        let user = self
            .store
            .get_user(user_id)
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))?
            .ok_or(LedgerError::UserNotFound(user_id))?;
        Ok(user.credits)
    }

    /// Removes `amount` credits. Returns the new balance.
    ///
    /// Fails without touching the balance when it is lower than `amount`.
    pub async fn debit(&self, user_id: i64, amount: i64, reason: &str) -> Result<i64, LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let new_balance = self.mutate(user_id, -amount, reason, "credits_deducted").await?;
        metrics::record_credits("debited", amount);
        log::info!(
            "Debited {} credits from user {} ({}), balance {}",
            amount,
            user_id,
            reason,
            new_balance
        );
        Ok(new_balance)
    }

    /// Adds `amount` credits unconditionally. Returns the new balance.
    pub async fn credit(&self, user_id: i64, amount: i64, reason: &str) -> Result<i64, LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let new_balance = self.mutate(user_id, amount, reason, "credits_added").await?;
        metrics::record_credits("credited", amount);
        log::info!(
            "Credited {} credits to user {} ({}), balance {}",
            amount,
            user_id,
            reason,
            new_balance
        );
        Ok(new_balance)
    }

    /// Gives back credits for a service that failed after its debit.
    pub async fn refund(&self, user_id: i64, amount: i64, reason: &str) -> Result<i64, LedgerError> {
        let new_balance = self.credit(user_id, amount, &format!("refund_{}", reason)).await?;
        metrics::record_credits("refunded", amount);
        Ok(new_balance)
    }

    async fn mutate(&self, user_id: i64, delta: i64, reason: &str, event: &str) -> Result<i64, LedgerError> {
        let lock = self.lock_for(user_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply(user_id, delta, reason, event).await
        };
        drop(lock);
        self.forget_lock(user_id);
        result
    }

    async fn apply(&self, user_id: i64, delta: i64, reason: &str, event: &str) -> Result<i64, LedgerError> {
        let storage = |e: crate::core::error::AppError| LedgerError::Storage(e.to_string());

        let user = self
            .store
            .get_user(user_id)
            .await
            .map_err(storage)?
            .ok_or(LedgerError::UserNotFound(user_id))?;

        let new_balance = user.credits + delta;
        if new_balance < 0 {
            return Err(LedgerError::InsufficientCredits {
                balance: user.credits,
                requested: -delta,
            });
        }

        self.store
            .update_user(user_id, UserUpdate::credits(new_balance))
            .await
            .map_err(storage)?
            .ok_or(LedgerError::UserNotFound(user_id))?;

        if let Err(e) = self.cache.delete(&keys::user(user_id)).await {
            log::warn!("Failed to invalidate cached user {}: {}", user_id, e);
        }

        let audit = AnalyticsEvent::new(
            event,
            Some(user_id),
            json!({ "amount": delta.abs(), "reason": reason, "new_balance": new_balance }),
        );
        if let Err(e) = self.store.create_analytics_event(audit).await {
            log::warn!("Failed to record {} event for user {}: {}", event, user_id, e);
        }

        Ok(new_balance)
    }
}
