//! Persistence contract consumed by the pipelines and an in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::core::error::AppResult;
use crate::storage::models::{
    AnalyticsEvent, Download, DownloadStatus, DownloadUpdate, NewDownload, User, UserUpdate,
};

/// Key-addressed persistence, atomic at row granularity.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get_user(&self, user_id: i64) -> AppResult<Option<User>>;

    /// Inserts a user, replacing any existing row with the same id.
    async fn create_user(&self, user: User) -> AppResult<()>;

    /// Returns the updated user, or `None` when it does not exist.
    async fn update_user(&self, user_id: i64, update: UserUpdate) -> AppResult<Option<User>>;

    /// Downloads created today (UTC), optionally excluding failed ones.
    async fn get_user_daily_download_count(&self, user_id: i64, excluding_failed: bool) -> AppResult<u32>;

    /// Most recent first.
    async fn get_user_downloads(
        &self,
        user_id: i64,
        limit: usize,
        status: Option<DownloadStatus>,
    ) -> AppResult<Vec<Download>>;

    /// Downloads still owned by a pipeline.
    async fn count_active_downloads(&self, user_id: i64) -> AppResult<u32>;

    async fn create_download(&self, new: NewDownload) -> AppResult<i64>;

    async fn update_download(&self, download_id: i64, update: DownloadUpdate) -> AppResult<()>;

    async fn get_download(&self, download_id: i64) -> AppResult<Option<Download>>;

    async fn create_analytics_event(&self, event: AnalyticsEvent) -> AppResult<()>;
}

pub(crate) fn start_of_today() -> DateTime<Utc> {
    let today = Utc::now().date_naive();
    today.and_hms_opt(0, 0, 0).map(|t| t.and_utc()).unwrap_or_else(Utc::now)
}

#[derive(Default)]
struct MemoryInner {
    users: HashMap<i64, User>,
    downloads: BTreeMap<i64, Download>,
    events: Vec<AnalyticsEvent>,
    next_download_id: i64,
}

/// In-memory persistence used by tests and the CLI.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fully formed download record, e.g. with a backdated `created_at`.
    pub async fn insert_download(&self, download: Download) {
        let mut inner = self.inner.write().await;
        inner.next_download_id = inner.next_download_id.max(download.id);
        inner.downloads.insert(download.id, download);
    }

    /// Recorded analytics events, oldest first.
    pub async fn events(&self) -> Vec<AnalyticsEvent> {
        self.inner.read().await.events.clone()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn get_user(&self, user_id: i64) -> AppResult<Option<User>> {
        Ok(self.inner.read().await.users.get(&user_id).cloned())
    }

    async fn create_user(&self, user: User) -> AppResult<()> {
        self.inner.write().await.users.insert(user.id, user);
        Ok(())
    }

    async fn update_user(&self, user_id: i64, update: UserUpdate) -> AppResult<Option<User>> {
        let mut inner = self.inner.write().await;
        Ok(inner.users.get_mut(&user_id).map(|user| {
            update.apply(user);
            user.clone()
        }))
    }

    async fn get_user_daily_download_count(&self, user_id: i64, excluding_failed: bool) -> AppResult<u32> {
        let since = start_of_today();
        let inner = self.inner.read().await;
        let count = inner
            .downloads
            .values()
            .filter(|d| d.user_id == user_id && d.created_at >= since)
            .filter(|d| !(excluding_failed && d.status == DownloadStatus::Failed))
            .count();
        Ok(count as u32)
    }

    async fn get_user_downloads(
        &self,
        user_id: i64,
        limit: usize,
        status: Option<DownloadStatus>,
    ) -> AppResult<Vec<Download>> {
        let inner = self.inner.read().await;
        let mut downloads: Vec<Download> = inner
            .downloads
            .values()
            .filter(|d| d.user_id == user_id)
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        downloads.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        downloads.truncate(limit);
        Ok(downloads)
    }

    async fn count_active_downloads(&self, user_id: i64) -> AppResult<u32> {
        let inner = self.inner.read().await;
        let count = inner
            .downloads
            .values()
            .filter(|d| d.user_id == user_id && d.status.is_active())
            .count();
        Ok(count as u32)
    }

    async fn create_download(&self, new: NewDownload) -> AppResult<i64> {
        let mut inner = self.inner.write().await;
        inner.next_download_id += 1;
        let id = inner.next_download_id;
        inner.downloads.insert(id, new.into_download(id, Utc::now()));
        Ok(id)
    }

    async fn update_download(&self, download_id: i64, update: DownloadUpdate) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        match inner.downloads.get_mut(&download_id) {
            Some(download) => update.apply(download),
            None => log::warn!("update_download: download {} does not exist", download_id),
        }
        Ok(())
    }

    async fn get_download(&self, download_id: i64) -> AppResult<Option<Download>> {
        Ok(self.inner.read().await.downloads.get(&download_id).cloned())
    }

    async fn create_analytics_event(&self, event: AnalyticsEvent) -> AppResult<()> {
        self.inner.write().await.events.push(event);
        Ok(())
    }
}
