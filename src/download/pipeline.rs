//! Download worker pool.
//!
//! Each worker takes one [`DownloadRequest`] at a time from the FIFO queue and
//! drives it through `downloading → processing`, then hands the produced file
//! to a [`CompletedDownloadHandler`]. Any error or panic inside a task becomes
//! a `failed` record; the worker backs off and moves on to the next request.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::{AppError, AppResult, ExtractionError, QueueError};
use crate::core::metrics;
use crate::core::plans::PlanId;
use crate::core::utils::bytes_to_mb;
use crate::download::completion::{CompletionRegistry, DownloadOutcome};
use crate::download::engine::{ExtractionEngine, MediaInfo};
use crate::download::progress::{ProgressEvent, ProgressPhase, ProgressReporter};
use crate::download::queue::WorkQueue;
use crate::download::workspace::TempWorkspace;
use crate::storage::{Download, DownloadStatus, DownloadUpdate, Persistence};

pub const DOWNLOAD_PIPELINE: &str = "download";

/// Queue entry for one admitted download. Consumed exactly once.
#[derive(Debug, Clone, bon::Builder)]
pub struct DownloadRequest {
    pub download_id: i64,
    pub user_id: i64,
    /// Destination chat; the user's private chat when absent
    pub chat_id: Option<i64>,
    #[builder(into)]
    pub url: String,
    #[builder(into, default = String::from("best"))]
    pub quality: String,
    #[builder(default)]
    pub plan: PlanId,
    /// Advisory only; the queue is strictly FIFO
    #[builder(default = 1)]
    pub priority: u8,
    #[builder(default = 2048)]
    pub max_file_size_mb: u32,
    #[builder(default)]
    pub allow_playlist: bool,
    pub progress_sink: Option<mpsc::Sender<ProgressEvent>>,
}

impl DownloadRequest {
    pub fn destination(&self) -> i64 {
        self.chat_id.unwrap_or(self.user_id)
    }
}

/// A finished download waiting for upload. Owns its workspace.
#[derive(Debug)]
pub struct DownloadedMedia {
    pub request: DownloadRequest,
    pub info: MediaInfo,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub format: String,
    pub workspace: TempWorkspace,
}

/// Receives every download that reached `processing`.
#[async_trait]
pub trait CompletedDownloadHandler: Send + Sync {
    async fn handle(&self, media: DownloadedMedia) -> AppResult<()>;
}

/// Writes `update` after checking the status transition is allowed.
///
/// A record that was cancelled meanwhile yields [`AppError::Cancelled`].
pub async fn advance_status(store: &dyn Persistence, download_id: i64, update: DownloadUpdate) -> AppResult<Download> {
    let current = store
        .get_download(download_id)
        .await?
        .ok_or_else(|| AppError::Validation(format!("download {} not found", download_id)))?;

    if let Some(next) = update.status {
        if current.status == DownloadStatus::Cancelled {
            return Err(AppError::Cancelled(download_id));
        }
        if current.status != next && !current.status.can_transition_to(next) {
            return Err(AppError::Validation(format!(
                "download {} cannot move from {} to {}",
                download_id, current.status, next
            )));
        }
        log::debug!("Download {}: {} -> {}", download_id, current.status, next);
    }

    store.update_download(download_id, update.clone()).await?;
    let mut updated = current;
    update.apply(&mut updated);
    Ok(updated)
}

/// Records a terminal failure (or acknowledges a cancellation) and wakes waiters.
///
/// A record that was cancelled meanwhile stays cancelled, and so does its outcome.
pub async fn finalize_failure(
    store: &dyn Persistence,
    registry: &CompletionRegistry,
    download_id: i64,
    error: &AppError,
) {
    let stored = match store.get_download(download_id).await {
        Ok(record) => record.map(|r| r.status),
        Err(e) => {
            log::error!("Failed to load download {} after failure: {}", download_id, e);
            None
        }
    };

    if matches!(error, AppError::Cancelled(_)) || stored == Some(DownloadStatus::Cancelled) {
        match error {
            AppError::Cancelled(_) => log::info!("Download {} was cancelled", download_id),
            other => log::info!("Download {} was cancelled, ignoring: {}", download_id, other),
        }
        metrics::record_download_terminal("cancelled");
        registry.complete(DownloadOutcome::cancelled(download_id)).await;
        return;
    }

    let message = error.to_string();
    log::error!("Download {} failed: {}", download_id, message);

    match stored {
        Some(status) if status.is_terminal() => {
            log::debug!("Download {} already {}, not marking failed", download_id, status);
        }
        _ => {
            if let Err(e) = store
                .update_download(download_id, DownloadUpdate::failed(message.clone()))
                .await
            {
                log::error!("Failed to mark download {} as failed: {}", download_id, e);
            }
        }
    }

    metrics::record_download_terminal("failed");
    registry.complete(DownloadOutcome::failed(download_id, message)).await;
}

/// Pauses a worker after a failed task, unless shutting down.
pub(crate) async fn backoff(delay: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.cancelled() => {}
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Shared by every download worker.
pub struct DownloadContext {
    pub store: Arc<dyn Persistence>,
    pub engine: Arc<dyn ExtractionEngine>,
    pub reporter: ProgressReporter,
    pub registry: CompletionRegistry,
    pub download_dir: PathBuf,
    pub handler: Arc<dyn CompletedDownloadHandler>,
}

impl DownloadContext {
    async fn process(&self, request: DownloadRequest) -> AppResult<()> {
        let id = request.download_id;
        let cancel = self.registry.cancel_token(id).await.unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(id));
        }

        let started = Instant::now();
        advance_status(
            self.store.as_ref(),
            id,
            DownloadUpdate {
                status: Some(DownloadStatus::Downloading),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?;

        let info = tokio::select! {
            info = self.engine.get_info(&request.url) => info?,
            _ = cancel.cancelled() => return Err(AppError::Cancelled(id)),
        };
        if info.is_live {
            return Err(ExtractionError::LiveStream.into());
        }
        if info.is_playlist && !request.allow_playlist {
            return Err(ExtractionError::PlaylistNotAllowed.into());
        }

        self.store
            .update_download(
                id,
                DownloadUpdate {
                    title: Some(info.title.clone()),
                    duration: info.duration,
                    metadata: Some(json!({
                        "uploader": info.uploader,
                        "view_count": info.view_count,
                        "playlist_count": info.playlist_count,
                    })),
                    ..Default::default()
                },
            )
            .await?;

        let workspace = TempWorkspace::create(&self.download_dir, id).await?;
        let tracker = self
            .reporter
            .track(id, ProgressPhase::Download, request.progress_sink.clone());

        let downloaded = tokio::select! {
            result = self.engine.download(&request.url, &request.quality, workspace.path(), tracker.callback()) => result,
            _ = cancel.cancelled() => {
                tracker.finish().await;
                return Err(AppError::Cancelled(id));
            }
        };
        tracker.finish().await;
        let file_path = downloaded?;

        let file_size = fs_err::tokio::metadata(&file_path).await?.len();
        let size_mb = bytes_to_mb(file_size);
        if size_mb > f64::from(request.max_file_size_mb) {
            return Err(ExtractionError::FileTooLarge {
                size_mb,
                max_mb: request.max_file_size_mb,
            }
            .into());
        }

        let format = file_path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        advance_status(
            self.store.as_ref(),
            id,
            DownloadUpdate {
                status: Some(DownloadStatus::Processing),
                file_size: Some(file_size),
                format: Some(format.clone()),
                progress: Some(100.0),
                ..Default::default()
            },
        )
        .await?;

        metrics::observe_download_duration(&request.url, started.elapsed().as_secs_f64());
        log::info!(
            "Download {} finished: {} ({:.1} MB, {})",
            id,
            info.title,
            size_mb,
            format
        );

        self.handler
            .handle(DownloadedMedia {
                request,
                info,
                file_path,
                file_size,
                format,
                workspace,
            })
            .await
    }
}

pub struct DownloadPipeline {
    context: Arc<DownloadContext>,
    queue: Arc<WorkQueue<DownloadRequest>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadPipeline {
    /// Spawns `workers` download workers over a queue of `capacity`.
    pub fn start(context: DownloadContext, workers: usize, capacity: usize, worker_backoff: Duration) -> Self {
        let queue = Arc::new(WorkQueue::new(DOWNLOAD_PIPELINE, capacity));
        let shutdown = CancellationToken::new();
        let context = Arc::new(context);

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    context.clone(),
                    queue.clone(),
                    shutdown.clone(),
                    worker_backoff,
                ))
            })
            .collect();

        log::info!("Download pipeline started with {} workers", workers.max(1));
        Self {
            context,
            queue,
            shutdown,
            workers: Mutex::new(handles),
        }
    }

    /// Queues a request. Returns its position.
    pub async fn submit(&self, request: DownloadRequest) -> Result<usize, QueueError> {
        let id = request.download_id;
        let position = self.queue.push(request).await?;
        log::info!("Download {} queued at position {}", id, position);
        Ok(position)
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    /// Stops accepting work and waits for workers to finish their current task.
    ///
    /// Requests still queued are failed so their records and waiters settle.
    pub async fn shutdown(&self) {
        self.queue.close();
        self.shutdown.cancel();
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("Download worker ended abnormally: {}", e);
            }
        }

        let leftover = self.queue.drain().await;
        if !leftover.is_empty() {
            log::warn!("Failing {} queued downloads at shutdown", leftover.len());
        }
        let error = AppError::Queue(QueueError::Closed(DOWNLOAD_PIPELINE));
        for request in leftover {
            finalize_failure(
                self.context.store.as_ref(),
                &self.context.registry,
                request.download_id,
                &error,
            )
            .await;
        }
        log::info!("Download pipeline stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    context: Arc<DownloadContext>,
    queue: Arc<WorkQueue<DownloadRequest>>,
    shutdown: CancellationToken,
    worker_backoff: Duration,
) {
    log::info!("Download worker {} started", worker_id);

    while let Some(request) = queue.pop(&shutdown).await {
        let id = request.download_id;
        log::info!(
            "Download worker {} picked up download {} (priority {})",
            worker_id,
            id,
            request.priority
        );

        let error = match AssertUnwindSafe(context.process(request)).catch_unwind().await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(AppError::Validation(format!(
                "download worker panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        if let Some(error) = error {
            let cancelled = matches!(error, AppError::Cancelled(_));
            finalize_failure(context.store.as_ref(), &context.registry, id, &error).await;
            if !cancelled {
                metrics::record_worker_failure();
                backoff(worker_backoff, &shutdown).await;
            }
        }
    }

    log::info!("Download worker {} stopped", worker_id);
}
