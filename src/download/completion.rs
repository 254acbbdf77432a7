//! Registry of in-flight downloads: a completion signal set exactly once by
//! whichever worker finalizes the record, plus a cancellation token.
//!
//! Entries expire after [`COMPLETION_TTL`]; a waiter that outlives its entry
//! sees `None`.

use moka::future::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::storage::DownloadStatus;

/// How long a finished or abandoned entry stays reachable.
pub const COMPLETION_TTL: Duration = Duration::from_secs(3600);

const MAX_TRACKED: u64 = 10_000;

/// Terminal state of a download as seen by a waiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadOutcome {
    pub download_id: i64,
    pub status: DownloadStatus,
    /// Remote file reference, on success
    pub file_id: Option<String>,
    pub error: Option<String>,
}

impl DownloadOutcome {
    pub fn completed(download_id: i64, file_id: String) -> Self {
        Self {
            download_id,
            status: DownloadStatus::Completed,
            file_id: Some(file_id),
            error: None,
        }
    }

    pub fn failed(download_id: i64, error: impl Into<String>) -> Self {
        Self {
            download_id,
            status: DownloadStatus::Failed,
            file_id: None,
            error: Some(error.into()),
        }
    }

    pub fn cancelled(download_id: i64) -> Self {
        Self {
            download_id,
            status: DownloadStatus::Cancelled,
            file_id: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DownloadStatus::Completed
    }
}

struct Entry {
    signal: watch::Sender<Option<DownloadOutcome>>,
    cancel: CancellationToken,
}

/// Waits for one download to reach a terminal state.
#[derive(Debug)]
pub struct CompletionHandle {
    download_id: i64,
    rx: watch::Receiver<Option<DownloadOutcome>>,
}

impl CompletionHandle {
    pub fn download_id(&self) -> i64 {
        self.download_id
    }

    /// Resolves once the outcome is set. `None` if the entry was evicted first.
    pub async fn wait(mut self) -> Option<DownloadOutcome> {
        match self.rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        }
    }

    /// The outcome, if already set.
    pub fn peek(&self) -> Option<DownloadOutcome> {
        self.rx.borrow().clone()
    }
}

#[derive(Clone)]
pub struct CompletionRegistry {
    entries: Cache<i64, Arc<Entry>>,
}

impl Default for CompletionRegistry {
    fn default() -> Self {
        Self::new(COMPLETION_TTL)
    }
}

impl CompletionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().max_capacity(MAX_TRACKED).time_to_live(ttl).build(),
        }
    }

    /// Tracks a new download and returns its first waiter.
    pub async fn register(&self, download_id: i64) -> CompletionHandle {
        let (signal, rx) = watch::channel(None);
        let entry = Arc::new(Entry {
            signal,
            cancel: CancellationToken::new(),
        });
        self.entries.insert(download_id, entry).await;
        CompletionHandle { download_id, rx }
    }

    /// Another waiter for a tracked download.
    pub async fn subscribe(&self, download_id: i64) -> Option<CompletionHandle> {
        let entry = self.entries.get(&download_id).await?;
        Some(CompletionHandle {
            download_id,
            rx: entry.signal.subscribe(),
        })
    }

    /// Sets the outcome. Only the first call for a download has any effect.
    pub async fn complete(&self, outcome: DownloadOutcome) -> bool {
        let Some(entry) = self.entries.get(&outcome.download_id).await else {
            log::debug!("No waiter registered for download {}", outcome.download_id);
            return false;
        };
        let download_id = outcome.download_id;
        let set = entry.signal.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
        if !set {
            log::debug!("Download {} already has an outcome", download_id);
        }
        set
    }

    /// Token observed by the worker driving the download.
    pub async fn cancel_token(&self, download_id: i64) -> Option<CancellationToken> {
        self.entries.get(&download_id).await.map(|entry| entry.cancel.clone())
    }

    /// Trips the cancellation token. Returns false for unknown downloads.
    pub async fn cancel(&self, download_id: i64) -> bool {
        match self.entries.get(&download_id).await {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn forget(&self, download_id: i64) {
        self.entries.invalidate(&download_id).await;
    }
}
