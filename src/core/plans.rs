//! Closed plan registry.
//!
//! Plans are resolved once at startup from [`Settings`](crate::core::config::Settings)
//! (the free tier limits are configurable, the paid tiers are fixed) and never
//! re-read from storage. Unknown plan names stored on a user fall back to `free`.

use crate::core::config::Settings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Plan identifier as stored on the user row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanId {
    #[default]
    Free,
    Basic,
    Premium,
    Unlimited,
}

impl PlanId {
    /// Parses a stored plan name, falling back to `free` for anything unknown.
    pub fn parse_or_free(name: &str) -> Self {
        PlanId::from_str(name.trim()).unwrap_or_default()
    }

    pub fn is_free(self) -> bool {
        self == PlanId::Free
    }
}

/// Feature flags granted by a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    BasicDownload,
    AudioExtract,
    PlaylistSupport,
    NoWatermark,
    BatchDownload,
    CustomFilename,
    SubtitleDownload,
    /// Grants every feature
    All,
}

/// Limits and pricing of a single plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub id: PlanId,
    /// Display name
    pub name: &'static str,
    /// Downloads per day (`None` = unlimited)
    pub daily_downloads: Option<u32>,
    /// Maximum file size in MB
    pub max_file_size_mb: u32,
    /// Seconds between downloads (enforced for the free tier only)
    pub wait_time_secs: u64,
    /// Downloads a user may have in flight at once
    pub concurrent_downloads: u32,
    /// Advisory queue priority (higher is more important)
    pub priority: u8,
    pub features: Vec<Feature>,
    /// Credits granted on purchase; `Some` marks a credit-consuming plan
    pub credits: Option<i64>,
    /// Per-download cost multiplier applied by the ledger
    pub cost_multiplier: f64,
    /// Price in the configured currency
    pub price: Option<f64>,
}

impl Plan {
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.iter().any(|f| *f == feature || *f == Feature::All)
    }

    /// Whether downloads on this plan consume credits.
    pub fn uses_credits(&self) -> bool {
        !self.id.is_free() && self.credits.is_some()
    }

    /// The daily quota in the `-1 = unlimited` convention used by callers.
    pub fn daily_quota(&self) -> i64 {
        self.daily_downloads.map(i64::from).unwrap_or(-1)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        u64::from(self.max_file_size_mb) * 1024 * 1024
    }
}

/// Statically validated registry of every plan.
#[derive(Debug, Clone)]
pub struct PlanRegistry {
    plans: HashMap<PlanId, Plan>,
}

impl PlanRegistry {
    /// Builds the registry; the free tier takes its limits from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let plans = PlanId::iter()
            .map(|id| (id, Self::build(id, settings)))
            .collect();
        Self { plans }
    }

    fn build(id: PlanId, settings: &Settings) -> Plan {
        use Feature::*;

        match id {
            PlanId::Free => Plan {
                id,
                name: "Free",
                daily_downloads: Some(settings.free_daily_downloads),
                max_file_size_mb: settings.free_max_file_size_mb,
                wait_time_secs: settings.free_wait_time_seconds,
                concurrent_downloads: 1,
                priority: 1,
                features: vec![BasicDownload, AudioExtract],
                credits: None,
                cost_multiplier: 1.0,
                price: None,
            },
            PlanId::Basic => Plan {
                id,
                name: "Basic",
                daily_downloads: Some(50),
                max_file_size_mb: 500,
                wait_time_secs: 10,
                concurrent_downloads: 2,
                priority: 2,
                features: vec![BasicDownload, AudioExtract, PlaylistSupport, NoWatermark],
                credits: Some(100),
                cost_multiplier: 1.0,
                price: Some(4.99),
            },
            PlanId::Premium => Plan {
                id,
                name: "Premium",
                daily_downloads: Some(200),
                max_file_size_mb: 1024,
                wait_time_secs: 5,
                concurrent_downloads: 3,
                priority: 3,
                features: vec![
                    BasicDownload,
                    AudioExtract,
                    PlaylistSupport,
                    NoWatermark,
                    BatchDownload,
                    CustomFilename,
                    SubtitleDownload,
                ],
                credits: Some(250),
                cost_multiplier: 0.8,
                price: Some(9.99),
            },
            PlanId::Unlimited => Plan {
                id,
                name: "Unlimited",
                daily_downloads: None,
                max_file_size_mb: 2048,
                wait_time_secs: 0,
                concurrent_downloads: 5,
                priority: 4,
                features: vec![All],
                credits: Some(1000),
                cost_multiplier: 0.5,
                price: Some(19.99),
            },
        }
    }

    pub fn get(&self, id: PlanId) -> &Plan {
        // Every PlanId is inserted in `from_settings`.
        &self.plans[&id]
    }

    /// Resolves a stored plan name, falling back to the free plan.
    pub fn resolve(&self, name: &str) -> &Plan {
        self.get(PlanId::parse_or_free(name))
    }

    /// Plans in ascending tier order.
    pub fn iter(&self) -> impl Iterator<Item = &Plan> {
        PlanId::iter().map(move |id| self.get(id))
    }
}

impl Default for PlanRegistry {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}
