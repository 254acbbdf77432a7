//! Upload worker pool.
//!
//! Mirrors the download pool with its own queue so a slow transport never
//! blocks download workers. Each task ends `completed` or `failed`; credits
//! charged for the download are refunded on failure, and the file with its
//! workspace is removed either way.

use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use chrono::Utc;
use futures_util::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::{AppError, AppResult, QueueError};
use crate::core::metrics;
use crate::download::completion::{CompletionRegistry, DownloadOutcome};
use crate::download::pipeline::{advance_status, backoff, finalize_failure, panic_message, DownloadedMedia};
use crate::download::progress::{ProgressCallback, ProgressEvent, ProgressPhase, ProgressReporter, ProgressSample};
use crate::download::queue::WorkQueue;
use crate::download::workspace::TempWorkspace;
use crate::ledger::Ledger;
use crate::storage::{keys, AnalyticsEvent, Cache, DownloadStatus, DownloadUpdate, Persistence};
use crate::upload::caption::{build_caption, CaptionInfo};
use crate::upload::probe::MediaProbe;
use crate::upload::strategy::{
    adaptive_chunk_size, available_memory, fallback_chunk_size, select_strategy, UploadStrategy, CHUNK_ATTEMPTS,
};
use crate::upload::transport::{MediaKind, MediaMetadata, RemoteFile, Transport};

pub const UPLOAD_PIPELINE: &str = "upload";

/// Upload sessions are kept in the cache this long.
const SESSION_TTL: Duration = Duration::from_secs(24 * 3600);

/// One file waiting to be sent. Lives as long as the upload worker invocation.
#[derive(Debug)]
pub struct UploadTask {
    pub download_id: i64,
    pub user_id: i64,
    pub chat_id: i64,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<u64>,
    pub quality: Option<String>,
    /// Credits debited for this download; refunded if the upload fails
    pub charged: i64,
    pub workspace: Option<TempWorkspace>,
    pub progress_sink: Option<mpsc::Sender<ProgressEvent>>,
}

impl UploadTask {
    pub fn from_media(media: DownloadedMedia, charged: i64) -> Self {
        let DownloadedMedia {
            request,
            info,
            file_path,
            file_size,
            workspace,
            ..
        } = media;
        Self {
            download_id: request.download_id,
            user_id: request.user_id,
            chat_id: request.destination(),
            file_path,
            file_size,
            title: Some(info.title),
            uploader: info.uploader,
            duration: info.duration,
            quality: Some(request.quality),
            charged,
            workspace: Some(workspace),
            progress_sink: request.progress_sink,
        }
    }

    /// Removes the file and its workspace.
    async fn cleanup(&mut self) {
        match self.workspace.take() {
            Some(workspace) => workspace.close(),
            None => {
                if let Err(e) = fs_err::tokio::remove_file(&self.file_path).await {
                    log::warn!("Failed to remove {}: {}", self.file_path.display(), e);
                }
            }
        }
    }
}

/// Shared by every upload worker.
pub struct UploadContext {
    pub store: Arc<dyn Persistence>,
    pub cache: Arc<dyn Cache>,
    pub transport: Arc<dyn Transport>,
    pub probe: Option<Arc<dyn MediaProbe>>,
    pub ledger: Arc<Ledger>,
    pub reporter: ProgressReporter,
    pub registry: CompletionRegistry,
    /// Configured chunk size in bytes
    pub chunk_size: u64,
    /// Delay before the second chunk attempt; doubled for the next
    pub chunk_retry_base: Duration,
}

impl UploadContext {
    async fn process(&self, task: &UploadTask) -> AppResult<(RemoteFile, &'static str)> {
        let id = task.download_id;
        advance_status(self.store.as_ref(), id, DownloadUpdate::status(DownloadStatus::Uploading)).await?;

        let metadata = self.media_metadata(task).await;
        let caption = build_caption(&CaptionInfo {
            title: task.title.as_deref(),
            uploader: task.uploader.as_deref(),
            duration: metadata.duration.or(task.duration),
            file_size: task.file_size,
            quality: task.quality.as_deref(),
        });

        let tracker = self.reporter.track(id, ProgressPhase::Upload, task.progress_sink.clone());
        let sent = self.send(task, &caption, &metadata, tracker.callback()).await;
        tracker.finish().await;
        let (remote, strategy) = sent?;

        advance_status(
            self.store.as_ref(),
            id,
            DownloadUpdate {
                status: Some(DownloadStatus::Completed),
                file_id: Some(remote.file_id.clone()),
                message_id: remote.message_id,
                completed_at: Some(Utc::now()),
                progress: Some(100.0),
                ..Default::default()
            },
        )
        .await?;

        Ok((remote, strategy))
    }

    /// Probe failures are logged and leave the metadata empty.
    async fn media_metadata(&self, task: &UploadTask) -> MediaMetadata {
        let kind = MediaKind::from_path(&task.file_path);
        let mut metadata = MediaMetadata {
            kind,
            file_name: task
                .file_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("download_{}", task.download_id)),
            duration: task.duration,
            ..Default::default()
        };

        if kind == MediaKind::Video {
            if let Some(probe) = &self.probe {
                match probe.probe(&task.file_path).await {
                    Ok(probed) => {
                        metadata.duration = probed.duration.or(metadata.duration);
                        metadata.width = probed.width;
                        metadata.height = probed.height;
                        metadata.codec = probed.codec;
                    }
                    Err(e) => log::warn!("Metadata probe failed for download {}: {}", task.download_id, e),
                }
            }
        }
        metadata
    }

    async fn send(
        &self,
        task: &UploadTask,
        caption: &str,
        metadata: &MediaMetadata,
        progress: ProgressCallback,
    ) -> AppResult<(RemoteFile, &'static str)> {
        let strategy = select_strategy(task.file_size, self.chunk_size, available_memory());
        log::info!(
            "Uploading download {} ({} bytes) via {} path",
            task.download_id,
            task.file_size,
            strategy.label()
        );

        match strategy {
            UploadStrategy::Direct => {
                match self
                    .transport
                    .send_media(task.chat_id, &task.file_path, caption, metadata, progress.clone())
                    .await
                {
                    Ok(remote) => Ok((remote, "direct")),
                    Err(e) if e.is_file_part_missing() => {
                        let chunk_size = adaptive_chunk_size(fallback_chunk_size(self.chunk_size), available_memory());
                        log::warn!(
                            "Direct upload of download {} lost a part ({}), retrying chunked with {} byte chunks",
                            task.download_id,
                            e,
                            chunk_size
                        );
                        metrics::record_upload("direct", "fallback");
                        let remote = self.send_chunked(task, chunk_size, caption, metadata, progress).await?;
                        Ok((remote, "fallback"))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            UploadStrategy::Chunked { chunk_size } => {
                let remote = self.send_chunked(task, chunk_size, caption, metadata, progress).await?;
                Ok((remote, "chunked"))
            }
        }
    }

    async fn send_chunked(
        &self,
        task: &UploadTask,
        chunk_size: u64,
        caption: &str,
        metadata: &MediaMetadata,
        progress: ProgressCallback,
    ) -> AppResult<RemoteFile> {
        let session = self
            .transport
            .open_session(task.chat_id, metadata, task.file_size)
            .await?;
        let session_key = keys::upload_session(&session);
        self.record_session(
            &session_key,
            "info",
            json!({
                "download_id": task.download_id,
                "file_path": task.file_path.display().to_string(),
                "file_size": task.file_size,
                "chat_id": task.chat_id,
                "chunk_size": chunk_size,
                "started_at": Utc::now().to_rfc3339(),
            }),
        )
        .await;

        match self
            .send_chunks(task, &session, &session_key, chunk_size, caption, metadata, progress)
            .await
        {
            Ok(remote) => Ok(remote),
            Err(e) => {
                log::warn!("Aborting upload session {} of download {}: {}", session, task.download_id, e);
                self.transport.abort_session(&session).await;
                Err(e)
            }
        }
    }

    /// Streams the file through an open session and finalizes it.
    #[allow(clippy::too_many_arguments)]
    async fn send_chunks(
        &self,
        task: &UploadTask,
        session_id: &str,
        session_key: &str,
        chunk_size: u64,
        caption: &str,
        metadata: &MediaMetadata,
        progress: ProgressCallback,
    ) -> AppResult<RemoteFile> {
        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(self.chunk_retry_base)
            .with_factor(2.0)
            .with_max_times(CHUNK_ATTEMPTS - 1);

        let mut file = fs_err::tokio::File::open(&task.file_path).await?;
        let transport = self.transport.as_ref();
        let mut index = 0u64;
        let mut sent = 0u64;

        loop {
            let mut buf = Vec::with_capacity(chunk_size as usize);
            (&mut file).take(chunk_size).read_to_end(&mut buf).await?;
            if buf.is_empty() {
                break;
            }
            let data = Bytes::from(buf);
            let len = data.len() as u64;

            (|| {
                let data = data.clone();
                async move { transport.upload_chunk(session_id, index, data).await }
            })
            .retry(retry_policy)
            .notify(|e, delay| {
                log::warn!(
                    "Chunk {} of download {} failed ({}), retrying in {:?}",
                    index,
                    task.download_id,
                    e,
                    delay
                )
            })
            .await?;

            self.record_session(
                session_key,
                &format!("chunk_{}", index),
                json!({ "size": len, "uploaded_at": Utc::now().to_rfc3339() }),
            )
            .await;

            sent += len;
            index += 1;
            progress(ProgressSample::new(sent, Some(task.file_size)));
        }

        let remote = self.transport.finalize(session_id, caption, metadata).await?;
        log::info!("Chunked upload of download {} finished in {} chunks", task.download_id, index);
        Ok(remote)
    }

    async fn record_session(&self, key: &str, field: &str, value: serde_json::Value) {
        let result = async {
            self.cache.hset(key, field, &value.to_string()).await?;
            self.cache.expire(key, SESSION_TTL).await
        };
        if let Err(e) = result.await {
            log::warn!("Failed to record upload session {}: {}", key, e);
        }
    }

    async fn on_success(&self, task: &UploadTask, remote: RemoteFile, strategy: &'static str) {
        log::info!("Download {} delivered as {}", task.download_id, remote.file_id);
        metrics::record_upload(strategy, "success");
        metrics::record_download_terminal("completed");

        let event = AnalyticsEvent::new(
            "download_completed",
            Some(task.user_id),
            json!({
                "download_id": task.download_id,
                "file_size": task.file_size,
                "strategy": strategy,
                "credits": task.charged,
            }),
        );
        if let Err(e) = self.store.create_analytics_event(event).await {
            log::warn!("Failed to record completion of download {}: {}", task.download_id, e);
        }

        self.registry
            .complete(DownloadOutcome::completed(task.download_id, remote.file_id))
            .await;
    }

    async fn on_failure(&self, task: &UploadTask, error: &AppError) {
        metrics::record_upload("any", "failure");
        if task.charged > 0 {
            if let Err(e) = self.ledger.refund(task.user_id, task.charged, "upload_failed").await {
                log::error!(
                    "Failed to refund {} credits to user {} for download {}: {}",
                    task.charged,
                    task.user_id,
                    task.download_id,
                    e
                );
            }
        }
        finalize_failure(self.store.as_ref(), &self.registry, task.download_id, error).await;
    }
}

pub struct UploadPipeline {
    context: Arc<UploadContext>,
    queue: Arc<WorkQueue<UploadTask>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl UploadPipeline {
    pub fn start(context: UploadContext, workers: usize, capacity: usize, worker_backoff: Duration) -> Self {
        let queue = Arc::new(WorkQueue::new(UPLOAD_PIPELINE, capacity));
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

        log::info!("Upload pipeline started with {} workers", workers.max(1));
        Self {
            context,
            queue,
            shutdown,
            workers: Mutex::new(handles),
        }
    }

    /// Queues a task. On rejection the task comes back so the caller can
    /// clean up after it.
    pub async fn submit(&self, task: UploadTask) -> Result<usize, (QueueError, UploadTask)> {
        let id = task.download_id;
        let position = self.queue.try_push(task).await?;
        log::info!("Upload for download {} queued at position {}", id, position);
        Ok(position)
    }

    /// Releases the file and workspace of a task that never reached a worker.
    pub async fn discard(mut task: UploadTask) {
        task.cleanup().await;
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    /// Stops accepting tasks and waits for the current uploads.
    pub async fn shutdown(&self) {
        self.queue.close();
        self.shutdown.cancel();
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("Upload worker ended abnormally: {}", e);
            }
        }

        // Queued tasks were already charged: fail them with a refund.
        let leftover = self.queue.drain().await;
        if !leftover.is_empty() {
            log::warn!("Failing {} queued uploads at shutdown", leftover.len());
        }
        let error = AppError::Queue(QueueError::Closed(UPLOAD_PIPELINE));
        for mut task in leftover {
            task.cleanup().await;
            self.context.on_failure(&task, &error).await;
        }
        log::info!("Upload pipeline stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    context: Arc<UploadContext>,
    queue: Arc<WorkQueue<UploadTask>>,
    shutdown: CancellationToken,
    worker_backoff: Duration,
) {
    log::info!("Upload worker {} started", worker_id);

    while let Some(mut task) = queue.pop(&shutdown).await {
        log::info!("Upload worker {} picked up download {}", worker_id, task.download_id);

        let result = match AssertUnwindSafe(context.process(&task)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(AppError::Validation(format!(
                "upload worker panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        // Files go before waiters are woken.
        task.cleanup().await;

        let failed = match result {
            Ok((remote, strategy)) => {
                context.on_success(&task, remote, strategy).await;
                false
            }
            Err(error) => {
                let cancelled = matches!(error, AppError::Cancelled(_));
                context.on_failure(&task, &error).await;
                !cancelled
            }
        };

        if failed {
            metrics::record_worker_failure();
            backoff(worker_backoff, &shutdown).await;
        }
    }

    log::info!("Upload worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::completion::CompletionHandle;
    use crate::storage::{MemoryCache, MemoryStore, NewDownload, User};
    use crate::testing::{MockProbe, MockTransport, TransportCall};
    use crate::upload::probe::ProbeResult;

    const MB: u64 = 1024 * 1024;

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
        registry: CompletionRegistry,
        transport: MockTransport,
        pipeline: UploadPipeline,
        root: tempfile::TempDir,
    }

    async fn fixture(transport: MockTransport, chunk_size: u64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        store.create_user(User::new(1).with_plan("basic", 10)).await.unwrap();
        let registry = CompletionRegistry::default();

        let context = UploadContext {
            store: store.clone(),
            cache: cache.clone(),
            transport: Arc::new(transport.clone()),
            probe: Some(Arc::new(MockProbe::new(ProbeResult {
                duration: Some(90),
                width: Some(1280),
                height: Some(720),
                codec: Some("h264".into()),
            }))),
            ledger: Arc::new(Ledger::new(store.clone(), cache.clone())),
            reporter: ProgressReporter::new(store.clone(), cache.clone(), Duration::from_secs(2)),
            registry: registry.clone(),
            chunk_size,
            chunk_retry_base: Duration::from_millis(1),
        };
        Fixture {
            store,
            cache,
            registry,
            transport,
            pipeline: UploadPipeline::start(context, 1, 10, Duration::from_millis(5)),
            root: tempfile::tempdir().unwrap(),
        }
    }

    async fn task(fx: &Fixture, size: u64, charged: i64) -> (UploadTask, CompletionHandle) {
        let id = fx.store.create_download(NewDownload::new(1, "https://youtu.be/x")).await.unwrap();
        fx.store
            .update_download(id, DownloadUpdate::status(DownloadStatus::Processing))
            .await
            .unwrap();
        let handle = fx.registry.register(id).await;

        let workspace = TempWorkspace::create(fx.root.path(), id).await.unwrap();
        let file_path = workspace.path().join("clip.mp4");
        fs_err::tokio::write(&file_path, vec![1u8; size as usize]).await.unwrap();

        let task = UploadTask {
            download_id: id,
            user_id: 1,
            chat_id: 1,
            file_path,
            file_size: size,
            title: Some("Clip".into()),
            uploader: None,
            duration: None,
            quality: Some("720p".into()),
            charged,
            workspace: Some(workspace),
            progress_sink: None,
        };
        (task, handle)
    }

    #[tokio::test]
    async fn test_direct_upload_completes_and_cleans_up() {
        let fx = fixture(MockTransport::new(), 20 * MB).await;
        let (task, handle) = task(&fx, 4096, 0).await;
        let (id, file) = (task.download_id, task.file_path.clone());
        let dir = file.parent().unwrap().to_path_buf();

        fx.pipeline.submit(task).await.unwrap();
        let outcome = handle.wait().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.file_id.as_deref(), Some("mock-file-1"));

        let record = fx.store.get_download(id).await.unwrap().unwrap();
        assert_eq!(record.status, DownloadStatus::Completed);
        assert_eq!(record.file_id.as_deref(), Some("mock-file-1"));
        assert!(record.completed_at.is_some());

        assert_eq!(fx.transport.calls(), vec![TransportCall::Direct { chat_id: 1, size: 4096 }]);
        assert!(fx.transport.captions()[0].contains("⏱ Duration: 1:30"));

        fx.pipeline.shutdown().await;
        assert!(!file.exists());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_missing_part_falls_back_to_halved_chunks() {
        let transport = MockTransport::new().part_missing_on_direct(1);
        let fx = fixture(transport, 2 * MB).await;
        let (task, handle) = task(&fx, 3 * MB, 0).await;

        fx.pipeline.submit(task).await.unwrap();
        assert!(handle.wait().await.unwrap().is_success());

        let calls = fx.transport.calls();
        assert!(matches!(calls[0], TransportCall::Direct { .. }));
        assert_eq!(calls[1], TransportCall::OpenSession { chat_id: 1, total_size: 3 * MB });
        let chunks: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::Chunk { index, size } => Some((*index, *size)),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![(0, MB as usize), (1, MB as usize), (2, MB as usize)]);
        assert_eq!(calls.last(), Some(&TransportCall::Finalize { received: 3 * MB }));
        fx.pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_chunk_failures_are_retried() {
        let transport = MockTransport::new().part_missing_on_direct(1).fail_chunk(1, 2);
        let fx = fixture(transport, 2 * MB).await;
        let (task, handle) = task(&fx, 2 * MB, 0).await;

        fx.pipeline.submit(task).await.unwrap();
        assert!(handle.wait().await.unwrap().is_success());
        // chunk 0 once, chunk 1 three times
        assert_eq!(fx.transport.chunk_calls(), 4);

        let session = fx.cache.hgetall("upload_session:session-0").await.unwrap();
        assert!(session.contains_key("info"));
        assert!(session.contains_key("chunk_0"));
        assert!(session.contains_key("chunk_1"));
        fx.pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_chunk_retries_fail_and_refund() {
        let transport = MockTransport::new().part_missing_on_direct(1).fail_chunk(0, 3);
        let fx = fixture(transport, 2 * MB).await;
        let ledger = Ledger::new(fx.store.clone(), fx.cache.clone());
        ledger.debit(1, 4, "download").await.unwrap();

        let (task, handle) = task(&fx, MB, 4).await;
        let (id, file) = (task.download_id, task.file_path.clone());
        fx.pipeline.submit(task).await.unwrap();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, DownloadStatus::Failed);
        assert!(outcome.error.unwrap().contains("chunk 0 timed out"));
        assert_eq!(fx.transport.chunk_calls(), 3);
        assert_eq!(
            fx.transport.calls().last(),
            Some(&TransportCall::Abort {
                session: "session-0".to_string()
            })
        );
        assert_eq!(fx.transport.open_sessions(), 0);

        let record = fx.store.get_download(id).await.unwrap().unwrap();
        assert_eq!(record.status, DownloadStatus::Failed);
        assert_eq!(ledger.balance(1).await.unwrap(), 10);

        fx.pipeline.shutdown().await;
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_plain_transport_error_does_not_fall_back() {
        let fx = fixture(MockTransport::new().fail_everything(), 2 * MB).await;
        let (task, handle) = task(&fx, 1000, 0).await;

        fx.pipeline.submit(task).await.unwrap();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, DownloadStatus::Failed);
        assert_eq!(fx.transport.calls().len(), 1);
        fx.pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_before_upload_is_not_sent() {
        let fx = fixture(MockTransport::new(), 2 * MB).await;
        let (task, handle) = task(&fx, 1000, 0).await;
        fx.store
            .update_download(task.download_id, DownloadUpdate::status(DownloadStatus::Cancelled))
            .await
            .unwrap();

        fx.pipeline.submit(task).await.unwrap();
        assert_eq!(handle.wait().await.unwrap().status, DownloadStatus::Cancelled);
        assert!(fx.transport.calls().is_empty());
        fx.pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_task_comes_back() {
        let fx = fixture(MockTransport::new(), 2 * MB).await;
        fx.pipeline.shutdown().await;
        let (task, _) = task(&fx, 10, 0).await;
        let file = task.file_path.clone();

        let (err, task) = fx.pipeline.submit(task).await.unwrap_err();
        assert_eq!(err, QueueError::Closed(UPLOAD_PIPELINE));
        UploadPipeline::discard(task).await;
        assert!(!file.exists());
    }
}
