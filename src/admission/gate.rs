//! Outer admission gate: account status, channel membership, request rate
//! and in-flight allowance, then the plan rules.

use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::admission::controller::{AdmissionController, AdmissionDecision, DenialReason};
use crate::core::config::Settings;
use crate::core::error::AppResult;
use crate::core::metrics;
use crate::core::plans::PlanRegistry;
use crate::core::rate_limiter::RateLimiter;
use crate::storage::{keys, Cache, Persistence, User, UserStatus};

/// Status and membership lookups are cached this long.
pub const GATE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Answers whether a user belongs to a channel.
#[async_trait]
pub trait MembershipChecker: Send + Sync {
    async fn is_member(&self, user_id: i64, channel: &str) -> AppResult<bool>;
}

pub struct AdmissionGate {
    controller: AdmissionController,
    store: Arc<dyn Persistence>,
    cache: Arc<dyn Cache>,
    plans: Arc<PlanRegistry>,
    membership: Option<Arc<dyn MembershipChecker>>,
    rate_limiter: RateLimiter,
    admin_ids: Vec<i64>,
    required_channels: Vec<String>,
}

impl AdmissionGate {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn Persistence>,
        cache: Arc<dyn Cache>,
        plans: Arc<PlanRegistry>,
        membership: Option<Arc<dyn MembershipChecker>>,
    ) -> Self {
        let required_channels = if settings.check_subscription {
            settings.required_channels.clone()
        } else {
            Vec::new()
        };

        Self {
            controller: AdmissionController::new(store.clone(), plans.clone(), settings.max_file_size_mb),
            store,
            cache,
            plans,
            membership,
            rate_limiter: RateLimiter::from_settings(settings),
            admin_ids: settings.admin_ids.clone(),
            required_channels,
        }
    }

    pub fn controller(&self) -> &AdmissionController {
        &self.controller
    }

    /// Runs every check in order and returns the first denial, or the admission.
    pub async fn check(&self, user_id: i64) -> AppResult<AdmissionDecision> {
        let decision = self.check_inner(user_id).await?;
        if let AdmissionDecision::Denied(reason) = &decision {
            metrics::record_admission_denial(reason.code());
            log::info!("Admission denied for user {}: {}", user_id, reason);
        }
        Ok(decision)
    }

    async fn check_inner(&self, user_id: i64) -> AppResult<AdmissionDecision> {
        let Some(user) = self.store.get_user(user_id).await? else {
            return Ok(AdmissionDecision::Denied(DenialReason::UserNotFound));
        };

        match self.user_status(&user).await {
            UserStatus::Banned => return Ok(AdmissionDecision::Denied(DenialReason::Banned)),
            UserStatus::Restricted => return Ok(AdmissionDecision::Denied(DenialReason::Restricted)),
            UserStatus::Active | UserStatus::Premium => {}
        }

        let missing = self.missing_channels(user_id).await;
        if !missing.is_empty() {
            return Ok(AdmissionDecision::Denied(DenialReason::NotSubscribed { channels: missing }));
        }

        let is_admin = user.is_admin || self.admin_ids.contains(&user_id);
        if !is_admin {
            if let Err(reset_in) = self.rate_limiter.check(user_id).await {
                return Ok(AdmissionDecision::Denied(DenialReason::RateLimited {
                    retry_after_secs: reset_in.as_secs().max(1),
                }));
            }
        }

        let plan = self.plans.resolve(&user.plan);
        let active = self.store.count_active_downloads(user_id).await?;
        if active >= plan.concurrent_downloads {
            return Ok(AdmissionDecision::Denied(DenialReason::TooManyActive {
                limit: plan.concurrent_downloads,
            }));
        }

        self.controller.evaluate(user_id).await
    }

    /// Cached status, falling back to the stored row.
    async fn user_status(&self, user: &User) -> UserStatus {
        let key = keys::user(user.id);
        match self.cache.hget(&key, "status").await {
            Ok(Some(cached)) => {
                if let Ok(status) = UserStatus::from_str(&cached) {
                    return status;
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Status cache lookup failed for user {}: {}", user.id, e),
        }

        let status = user.status;
        let cached = async {
            self.cache.hset(&key, "status", &status.to_string()).await?;
            self.cache.expire(&key, GATE_CACHE_TTL).await
        };
        if let Err(e) = cached.await {
            log::warn!("Failed to cache status for user {}: {}", user.id, e);
        }
        status
    }

    /// Required channels the user is not a member of.
    ///
    /// A failed lookup skips that channel rather than denying.
    async fn missing_channels(&self, user_id: i64) -> Vec<String> {
        let Some(membership) = &self.membership else {
            return Vec::new();
        };

        let mut missing = Vec::new();
        for channel in &self.required_channels {
            let key = keys::subscription(user_id, channel);
            let cached = match self.cache.get(&key).await {
                Ok(value) => value.and_then(|v| v.parse::<bool>().ok()),
                Err(e) => {
                    log::warn!("Subscription cache lookup failed: {}", e);
                    None
                }
            };

            let is_member = match cached {
                Some(is_member) => is_member,
                None => match membership.is_member(user_id, channel).await {
                    Ok(is_member) => {
                        if let Err(e) = self
                            .cache
                            .set(&key, &is_member.to_string(), Some(GATE_CACHE_TTL))
                            .await
                        {
                            log::warn!("Failed to cache subscription {}: {}", key, e);
                        }
                        is_member
                    }
                    Err(e) => {
                        log::warn!("Membership check for {} in {} failed: {}", user_id, channel, e);
                        continue;
                    }
                },
            };

            if !is_member {
                missing.push(channel.clone());
            }
        }
        missing
    }
}
