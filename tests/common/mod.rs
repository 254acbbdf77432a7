//! Common test utilities
//!
//! This module is shared across all integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mediagate::core::AppResult;
use mediagate::download::{DownloadOutcome, ProgressEvent};
use mediagate::storage::{
    AnalyticsEvent, Download, DownloadStatus, DownloadUpdate, MemoryCache, MemoryStore, NewDownload, Persistence,
    User, UserUpdate,
};
use mediagate::testing::{MockEngine, MockMembership, MockTransport};
use mediagate::{Collaborators, FetchRequest, MediaService, Settings, Submission};

/// In-memory store that remembers every status a download went through.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    statuses: Mutex<HashMap<i64, Vec<DownloadStatus>>>,
}

impl RecordingStore {
    pub fn statuses(&self, download_id: i64) -> Vec<DownloadStatus> {
        self.statuses
            .lock()
            .unwrap()
            .get(&download_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn events(&self) -> Vec<AnalyticsEvent> {
        self.inner.events().await
    }

    pub async fn insert_download(&self, download: Download) {
        self.inner.insert_download(download).await
    }
}

#[async_trait]
impl Persistence for RecordingStore {
    async fn get_user(&self, user_id: i64) -> AppResult<Option<User>> {
        self.inner.get_user(user_id).await
    }

    async fn create_user(&self, user: User) -> AppResult<()> {
        self.inner.create_user(user).await
    }

    async fn update_user(&self, user_id: i64, update: UserUpdate) -> AppResult<Option<User>> {
        self.inner.update_user(user_id, update).await
    }

    async fn get_user_daily_download_count(&self, user_id: i64, excluding_failed: bool) -> AppResult<u32> {
        self.inner.get_user_daily_download_count(user_id, excluding_failed).await
    }

    async fn get_user_downloads(
        &self,
        user_id: i64,
        limit: usize,
        status: Option<DownloadStatus>,
    ) -> AppResult<Vec<Download>> {
        self.inner.get_user_downloads(user_id, limit, status).await
    }

    async fn count_active_downloads(&self, user_id: i64) -> AppResult<u32> {
        self.inner.count_active_downloads(user_id).await
    }

    async fn create_download(&self, new: NewDownload) -> AppResult<i64> {
        let id = self.inner.create_download(new).await?;
        self.statuses.lock().unwrap().insert(id, vec![DownloadStatus::Pending]);
        Ok(id)
    }

    async fn update_download(&self, download_id: i64, update: DownloadUpdate) -> AppResult<()> {
        if let Some(status) = update.status {
            let mut statuses = self.statuses.lock().unwrap();
            let seen = statuses.entry(download_id).or_default();
            if seen.last() != Some(&status) {
                seen.push(status);
            }
        }
        self.inner.update_download(download_id, update).await
    }

    async fn get_download(&self, download_id: i64) -> AppResult<Option<Download>> {
        self.inner.get_download(download_id).await
    }

    async fn create_analytics_event(&self, event: AnalyticsEvent) -> AppResult<()> {
        self.inner.create_analytics_event(event).await
    }
}

/// Settings tuned for fast, deterministic tests.
pub fn test_settings(download_dir: &std::path::Path) -> Settings {
    Settings {
        download_dir: download_dir.to_path_buf(),
        download_workers: 2,
        upload_workers: 2,
        worker_backoff_ms: 10,
        chunk_retry_base_ms: 1,
        free_wait_time_seconds: 0,
        check_subscription: true,
        ..Settings::default()
    }
}

pub struct TestEnvironment {
    pub store: Arc<RecordingStore>,
    pub cache: Arc<MemoryCache>,
    pub engine: MockEngine,
    pub transport: MockTransport,
    pub membership: MockMembership,
    pub service: MediaService,
    pub download_dir: tempfile::TempDir,
}

impl TestEnvironment {
    pub fn new(engine: MockEngine, transport: MockTransport) -> Self {
        Self::with_settings(engine, transport, |_| {})
    }

    pub fn with_settings(engine: MockEngine, transport: MockTransport, tweak: impl FnOnce(&mut Settings)) -> Self {
        let download_dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(download_dir.path());
        tweak(&mut settings);

        let store = Arc::new(RecordingStore::default());
        let cache = Arc::new(MemoryCache::new());
        let membership = MockMembership::new();

        let service = MediaService::start(
            &settings,
            Collaborators::builder()
                .store(store.clone())
                .cache(cache.clone())
                .engine(Arc::new(engine.clone()))
                .transport(Arc::new(transport.clone()))
                .membership(Arc::new(membership.clone()))
                .build(),
        );

        Self {
            store,
            cache,
            engine,
            transport,
            membership,
            service,
            download_dir,
        }
    }

    pub async fn add_user(&self, id: i64, plan: &str, credits: i64) {
        self.store.create_user(User::new(id).with_plan(plan, credits)).await.unwrap();
    }

    pub async fn fetch(&self, user_id: i64, url: &str) -> Submission {
        self.service
            .submit(FetchRequest::builder().user_id(user_id).url(url).build())
            .await
            .unwrap()
    }

    /// Submits and waits for the terminal outcome.
    pub async fn fetch_and_wait(&self, user_id: i64, url: &str) -> (i64, DownloadOutcome) {
        match self.fetch(user_id, url).await {
            Submission::Queued {
                download_id, handle, ..
            } => {
                let outcome = tokio::time::timeout(Duration::from_secs(10), handle.wait())
                    .await
                    .expect("download did not finish in time")
                    .expect("outcome was evicted");
                (download_id, outcome)
            }
            Submission::Denied(reason) => panic!("unexpected denial: {}", reason),
        }
    }

    pub async fn record(&self, download_id: i64) -> Download {
        self.store.get_download(download_id).await.unwrap().unwrap()
    }

    pub async fn balance(&self, user_id: i64) -> i64 {
        self.store.get_user(user_id).await.unwrap().unwrap().credits
    }

    /// Workspaces still present under the download directory.
    pub fn leftover_workspaces(&self) -> usize {
        std::fs::read_dir(self.download_dir.path())
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0)
    }

    pub async fn wait_for_status(&self, download_id: i64, status: DownloadStatus) {
        for _ in 0..500 {
            if self.record(download_id).await.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("download {} never reached {}", download_id, status);
    }
}

/// Drains whatever progress events are already buffered.
pub fn drain(rx: &mut tokio::sync::mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
