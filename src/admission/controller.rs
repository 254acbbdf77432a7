//! Plan-based admission decision.
//!
//! Read-only: loads the user, today's download count and the most recent
//! download, then applies the plan rules in a fixed order, stopping at the
//! first failed rule.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use strum::IntoStaticStr;

use crate::core::error::AppResult;
use crate::core::plans::{Feature, Plan, PlanId, PlanRegistry};
use crate::storage::{Persistence, User};

/// Why a request was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    UserNotFound,
    DailyLimitExceeded { limit: u32, used: u32 },
    NoCredits,
    WaitTime { wait_seconds: u64 },
    Banned,
    Restricted,
    NotSubscribed { channels: Vec<String> },
    RateLimited { retry_after_secs: u64 },
    TooManyActive { limit: u32 },
}

impl DenialReason {
    /// Stable machine-readable code (`daily_limit_exceeded`, ...).
    pub fn code(&self) -> &'static str {
        self.into()
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::UserNotFound => write!(f, "user not found"),
            DenialReason::DailyLimitExceeded { limit, used } => {
                write!(f, "daily limit reached ({}/{})", used, limit)
            }
            DenialReason::NoCredits => write!(f, "no credits left"),
            DenialReason::WaitTime { wait_seconds } => {
                write!(f, "please wait {} seconds before the next download", wait_seconds)
            }
            DenialReason::Banned => write!(f, "account banned"),
            DenialReason::Restricted => write!(f, "account restricted"),
            DenialReason::NotSubscribed { channels } => {
                write!(f, "join the required channels first: {}", channels.join(", "))
            }
            DenialReason::RateLimited { retry_after_secs } => {
                write!(f, "too many requests, retry in {} seconds", retry_after_secs)
            }
            DenialReason::TooManyActive { limit } => {
                write!(f, "too many downloads in progress (limit {})", limit)
            }
        }
    }
}

/// Limits resolved for an admitted request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub plan: PlanId,
    /// Downloads left today after this one is counted; `-1` = unlimited
    pub remaining: i64,
    pub max_file_size_mb: u32,
    pub features: Vec<Feature>,
    /// Advisory queue priority
    pub priority: u8,
}

impl Admission {
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.iter().any(|f| *f == feature || *f == Feature::All)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admitted(Admission),
    Denied(DenialReason),
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted(_))
    }
}

/// Everything the plan rules look at.
#[derive(Debug, Clone)]
pub struct AdmissionInput<'a> {
    pub user: Option<&'a User>,
    /// Today's downloads, failed ones excluded
    pub daily_count: u32,
    pub last_download_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Applies the plan rules. Pure.
pub fn decide(input: &AdmissionInput<'_>, plans: &PlanRegistry, max_file_size_cap_mb: u32) -> AdmissionDecision {
    let Some(user) = input.user else {
        return AdmissionDecision::Denied(DenialReason::UserNotFound);
    };
    let plan: &Plan = plans.resolve(&user.plan);

    if let Some(limit) = plan.daily_downloads {
        if input.daily_count >= limit {
            return AdmissionDecision::Denied(DenialReason::DailyLimitExceeded {
                limit,
                used: input.daily_count,
            });
        }
    }

    if plan.uses_credits() && user.credits <= 0 {
        return AdmissionDecision::Denied(DenialReason::NoCredits);
    }

    if plan.id.is_free() && plan.wait_time_secs > 0 {
        if let Some(last) = input.last_download_at {
            let elapsed_ms = (input.now - last).num_milliseconds().max(0) as u64;
            let wait_ms = plan.wait_time_secs * 1000;
            if elapsed_ms < wait_ms {
                return AdmissionDecision::Denied(DenialReason::WaitTime {
                    wait_seconds: (wait_ms - elapsed_ms) / 1000,
                });
            }
        }
    }

    let remaining = match plan.daily_downloads {
        Some(limit) => i64::from(limit) - i64::from(input.daily_count),
        None => -1,
    };

    AdmissionDecision::Admitted(Admission {
        plan: plan.id,
        remaining,
        max_file_size_mb: plan.max_file_size_mb.min(max_file_size_cap_mb),
        features: plan.features.clone(),
        priority: plan.priority,
    })
}

pub struct AdmissionController {
    store: Arc<dyn Persistence>,
    plans: Arc<PlanRegistry>,
    max_file_size_cap_mb: u32,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn Persistence>, plans: Arc<PlanRegistry>, max_file_size_cap_mb: u32) -> Self {
        Self {
            store,
            plans,
            max_file_size_cap_mb,
        }
    }

    pub async fn evaluate(&self, user_id: i64) -> AppResult<AdmissionDecision> {
        self.evaluate_at(user_id, Utc::now()).await
    }

    pub async fn evaluate_at(&self, user_id: i64, now: DateTime<Utc>) -> AppResult<AdmissionDecision> {
        let Some(user) = self.store.get_user(user_id).await? else {
            return Ok(AdmissionDecision::Denied(DenialReason::UserNotFound));
        };

        let daily_count = self.store.get_user_daily_download_count(user_id, true).await?;
        let last_download_at = self
            .store
            .get_user_downloads(user_id, 1, None)
            .await?
            .first()
            .map(|d| d.created_at);

        let decision = decide(
            &AdmissionInput {
                user: Some(&user),
                daily_count,
                last_download_at,
                now,
            },
            &self.plans,
            self.max_file_size_cap_mb,
        );

        if let AdmissionDecision::Denied(reason) = &decision {
            log::debug!("User {} denied: {}", user_id, reason);
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, NewDownload};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn input(user: &User, daily_count: u32, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> AdmissionInput<'_> {
        AdmissionInput {
            user: Some(user),
            daily_count,
            last_download_at: last,
            now,
        }
    }

    #[test]
    fn test_missing_user_is_denied() {
        let plans = PlanRegistry::default();
        let decision = decide(
            &AdmissionInput {
                user: None,
                daily_count: 0,
                last_download_at: None,
                now: Utc::now(),
            },
            &plans,
            2048,
        );
        assert_eq!(decision, AdmissionDecision::Denied(DenialReason::UserNotFound));
    }

    #[test]
    fn test_quota_reached_reports_used_equal_to_limit() {
        let plans = PlanRegistry::default();
        for (plan, credits) in [("free", 0), ("basic", 10), ("premium", 10)] {
            let user = User::new(1).with_plan(plan, credits);
            let limit = plans.resolve(plan).daily_downloads.unwrap();
            let decision = decide(&input(&user, limit, None, Utc::now()), &plans, 2048);
            assert_eq!(
                decision,
                AdmissionDecision::Denied(DenialReason::DailyLimitExceeded { limit, used: limit }),
                "plan {}",
                plan
            );
        }
    }

    #[test]
    fn test_unlimited_plan_ignores_daily_count() {
        let plans = PlanRegistry::default();
        let user = User::new(1).with_plan("unlimited", 5);
        match decide(&input(&user, 10_000, None, Utc::now()), &plans, 2048) {
            AdmissionDecision::Admitted(admission) => {
                assert_eq!(admission.remaining, -1);
                assert_eq!(admission.max_file_size_mb, 2048);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_paid_plan_without_credits() {
        let plans = PlanRegistry::default();
        for plan in ["basic", "premium", "unlimited"] {
            let user = User::new(1).with_plan(plan, 0);
            let decision = decide(&input(&user, 0, None, Utc::now()), &plans, 2048);
            assert_eq!(decision, AdmissionDecision::Denied(DenialReason::NoCredits));
        }
    }

    #[test]
    fn test_wait_time_is_floored() {
        let plans = PlanRegistry::default();
        let user = User::new(1);
        let now = Utc::now();

        for elapsed in [0, 1, 12, 29] {
            let last = now - Duration::seconds(elapsed);
            let decision = decide(&input(&user, 1, Some(last), now), &plans, 2048);
            assert_eq!(
                decision,
                AdmissionDecision::Denied(DenialReason::WaitTime {
                    wait_seconds: (30 - elapsed) as u64
                })
            );
        }

        let last = now - Duration::milliseconds(10_700);
        let decision = decide(&input(&user, 1, Some(last), now), &plans, 2048);
        assert_eq!(decision, AdmissionDecision::Denied(DenialReason::WaitTime { wait_seconds: 19 }));

        let last = now - Duration::seconds(30);
        assert!(decide(&input(&user, 1, Some(last), now), &plans, 2048).is_admitted());
    }

    #[test]
    fn test_paid_plans_skip_wait_time() {
        let plans = PlanRegistry::default();
        let user = User::new(1).with_plan("basic", 3);
        let now = Utc::now();
        assert!(decide(&input(&user, 0, Some(now), now), &plans, 2048).is_admitted());
    }

    #[test]
    fn test_admitted_limits() {
        let plans = PlanRegistry::default();
        let user = User::new(1);
        match decide(&input(&user, 2, None, Utc::now()), &plans, 50) {
            AdmissionDecision::Admitted(admission) => {
                assert_eq!(admission.plan, PlanId::Free);
                assert_eq!(admission.remaining, 3);
                assert_eq!(admission.max_file_size_mb, 50);
                assert!(admission.has_feature(Feature::BasicDownload));
                assert!(!admission.has_feature(Feature::PlaylistSupport));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_denial_codes() {
        assert_eq!(DenialReason::UserNotFound.code(), "user_not_found");
        assert_eq!(
            DenialReason::DailyLimitExceeded { limit: 5, used: 5 }.code(),
            "daily_limit_exceeded"
        );
        assert_eq!(DenialReason::WaitTime { wait_seconds: 3 }.code(), "wait_time");
        assert_eq!(DenialReason::TooManyActive { limit: 1 }.code(), "too_many_active");
    }

    #[tokio::test]
    async fn test_controller_reads_store() {
        let store = Arc::new(MemoryStore::new());
        store.create_user(User::new(8)).await.unwrap();
        let controller = AdmissionController::new(store.clone(), Arc::new(PlanRegistry::default()), 2048);

        assert!(controller.evaluate(8).await.unwrap().is_admitted());
        assert_eq!(
            controller.evaluate(9).await.unwrap(),
            AdmissionDecision::Denied(DenialReason::UserNotFound)
        );

        store.create_download(NewDownload::new(8, "https://youtu.be/a")).await.unwrap();
        let later = Utc::now() + Duration::seconds(5);
        match controller.evaluate_at(8, later).await.unwrap() {
            AdmissionDecision::Denied(DenialReason::WaitTime { wait_seconds }) => {
                assert!(wait_seconds <= 25);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
