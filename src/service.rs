//! The calling layer: admission, download, debit, upload, completion.
//!
//! [`MediaService`] owns both worker pools and is the only place that creates
//! download records. Debits happen between the two pools, once the real file
//! size is known; any failure after a successful debit refunds it.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::admission::{AdmissionDecision, AdmissionGate, DenialReason, MembershipChecker};
use crate::core::config::Settings;
use crate::core::error::{AppError, AppResult};
use crate::core::metrics;
use crate::core::plans::{Feature, PlanRegistry};
use crate::core::utils::bytes_to_mb;
use crate::download::completion::{CompletionHandle, CompletionRegistry, DownloadOutcome, COMPLETION_TTL};
use crate::download::engine::ExtractionEngine;
use crate::download::pipeline::{CompletedDownloadHandler, DownloadContext, DownloadPipeline, DownloadRequest, DownloadedMedia};
use crate::download::progress::{ProgressEvent, ProgressPhase, ProgressReporter};
use crate::ledger::{calculate_cost, Ledger};
use crate::storage::{keys, AnalyticsEvent, Cache, DownloadStatus, DownloadUpdate, NewDownload, Persistence};
use crate::upload::pipeline::{UploadContext, UploadPipeline, UploadTask};
use crate::upload::probe::MediaProbe;
use crate::upload::transport::Transport;

/// External collaborators the service drives.
#[derive(bon::Builder)]
pub struct Collaborators {
    pub store: Arc<dyn Persistence>,
    pub cache: Arc<dyn Cache>,
    pub engine: Arc<dyn ExtractionEngine>,
    pub transport: Arc<dyn Transport>,
    pub probe: Option<Arc<dyn MediaProbe>>,
    pub membership: Option<Arc<dyn MembershipChecker>>,
}

/// A user's request to fetch one URL.
#[derive(Debug, Clone, bon::Builder)]
pub struct FetchRequest {
    pub user_id: i64,
    #[builder(into)]
    pub url: String,
    #[builder(into, default = String::from("best"))]
    pub quality: String,
    /// Defaults to the user's private chat
    pub chat_id: Option<i64>,
    pub progress_sink: Option<mpsc::Sender<ProgressEvent>>,
}

/// Result of [`MediaService::submit`].
#[derive(Debug)]
pub enum Submission {
    Queued {
        download_id: i64,
        /// 1-based position in the download queue
        position: usize,
        handle: CompletionHandle,
    },
    Denied(DenialReason),
}

impl Submission {
    pub fn download_id(&self) -> Option<i64> {
        match self {
            Submission::Queued { download_id, .. } => Some(*download_id),
            Submission::Denied(_) => None,
        }
    }
}

/// Progress of one download as seen by a caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub download_id: i64,
    pub status: DownloadStatus,
    pub percentage: f64,
    /// Latest throttled snapshot, when one was cached
    pub snapshot: Option<ProgressEvent>,
}

/// Debits finished downloads and passes them to the upload pool.
struct UploadHandoff {
    plans: Arc<PlanRegistry>,
    ledger: Arc<Ledger>,
    uploads: Arc<UploadPipeline>,
}

#[async_trait]
impl CompletedDownloadHandler for UploadHandoff {
    async fn handle(&self, media: DownloadedMedia) -> AppResult<()> {
        let id = media.request.download_id;
        let user_id = media.request.user_id;
        let plan = self.plans.get(media.request.plan);
        let cost = calculate_cost(bytes_to_mb(media.file_size), plan);

        if cost > 0 {
            self.ledger.debit(user_id, cost, "download").await?;
            log::info!("Charged user {} {} credits for download {}", user_id, cost, id);
        }

        match self.uploads.submit(UploadTask::from_media(media, cost)).await {
            Ok(_) => Ok(()),
            Err((e, task)) => {
                if cost > 0 {
                    if let Err(refund_err) = self.ledger.refund(user_id, cost, "upload_queue_rejected").await {
                        log::error!("Failed to refund {} credits to user {}: {}", cost, user_id, refund_err);
                    }
                }
                UploadPipeline::discard(task).await;
                Err(e.into())
            }
        }
    }
}

pub struct MediaService {
    store: Arc<dyn Persistence>,
    cache: Arc<dyn Cache>,
    gate: AdmissionGate,
    plans: Arc<PlanRegistry>,
    ledger: Arc<Ledger>,
    registry: CompletionRegistry,
    downloads: DownloadPipeline,
    uploads: Arc<UploadPipeline>,
}

impl MediaService {
    /// Builds every component and spawns both worker pools.
    pub fn start(settings: &Settings, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            cache,
            engine,
            transport,
            probe,
            membership,
        } = collaborators;

        let plans = Arc::new(PlanRegistry::from_settings(settings));
        let ledger = Arc::new(Ledger::new(store.clone(), cache.clone()));
        let registry = CompletionRegistry::new(COMPLETION_TTL);
        let reporter = ProgressReporter::new(store.clone(), cache.clone(), settings.progress_interval());
        let gate = AdmissionGate::new(settings, store.clone(), cache.clone(), plans.clone(), membership);

        let uploads = Arc::new(UploadPipeline::start(
            UploadContext {
                store: store.clone(),
                cache: cache.clone(),
                transport,
                probe,
                ledger: ledger.clone(),
                reporter: reporter.clone(),
                registry: registry.clone(),
                chunk_size: settings.chunk_size_bytes(),
                chunk_retry_base: settings.chunk_retry_base(),
            },
            settings.upload_workers,
            settings.queue_capacity,
            settings.worker_backoff(),
        ));

        let downloads = DownloadPipeline::start(
            DownloadContext {
                store: store.clone(),
                engine,
                reporter,
                registry: registry.clone(),
                download_dir: settings.download_dir.clone(),
                handler: Arc::new(UploadHandoff {
                    plans: plans.clone(),
                    ledger: ledger.clone(),
                    uploads: uploads.clone(),
                }),
            },
            settings.download_workers,
            settings.queue_capacity,
            settings.worker_backoff(),
        );

        Self {
            store,
            cache,
            gate,
            plans,
            ledger,
            registry,
            downloads,
            uploads,
        }
    }

    pub fn plans(&self) -> &PlanRegistry {
        &self.plans
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Admits and queues a request.
    ///
    /// Denials are values. A full or closed queue is an error, and the record
    /// created for the request is marked failed.
    pub async fn submit(&self, request: FetchRequest) -> AppResult<Submission> {
        self.admit_and_queue(request, 0).await
    }

    async fn admit_and_queue(&self, request: FetchRequest, retry_count: u32) -> AppResult<Submission> {
        let admission = match self.gate.check(request.user_id).await? {
            AdmissionDecision::Admitted(admission) => admission,
            AdmissionDecision::Denied(reason) => return Ok(Submission::Denied(reason)),
        };

        let download_id = self
            .store
            .create_download(NewDownload {
                user_id: request.user_id,
                url: request.url.clone(),
                quality: Some(request.quality.clone()),
                retry_count,
                metadata: json!({ "plan": admission.plan, "priority": admission.priority }),
            })
            .await?;
        let handle = self.registry.register(download_id).await;

        let download = DownloadRequest::builder()
            .download_id(download_id)
            .user_id(request.user_id)
            .maybe_chat_id(request.chat_id)
            .url(request.url)
            .quality(request.quality)
            .plan(admission.plan)
            .priority(admission.priority)
            .max_file_size_mb(admission.max_file_size_mb)
            .allow_playlist(admission.has_feature(Feature::PlaylistSupport))
            .maybe_progress_sink(request.progress_sink)
            .build();

        match self.downloads.submit(download).await {
            Ok(position) => {
                log::info!(
                    "Admitted download {} for user {} on {} plan ({} left today)",
                    download_id,
                    request.user_id,
                    admission.plan,
                    admission.remaining
                );
                Ok(Submission::Queued {
                    download_id,
                    position,
                    handle,
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.store
                    .update_download(download_id, DownloadUpdate::failed(message.clone()))
                    .await?;
                metrics::record_download_terminal("failed");
                self.registry
                    .complete(DownloadOutcome::failed(download_id, message))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Marks a download cancelled. Returns `false` when it had already finished.
    ///
    /// Workers notice at their next checkpoint, release their files and wake
    /// the waiters.
    pub async fn cancel(&self, download_id: i64, user_id: i64) -> AppResult<bool> {
        let record = self
            .store
            .get_download(download_id)
            .await?
            .ok_or_else(|| AppError::Validation(format!("download {} not found", download_id)))?;

        if record.user_id != user_id {
            return Err(AppError::Validation(format!(
                "download {} does not belong to user {}",
                download_id, user_id
            )));
        }
        if record.status.is_terminal() {
            log::debug!("Download {} already {}, nothing to cancel", download_id, record.status);
            return Ok(false);
        }

        self.store
            .update_download(
                download_id,
                DownloadUpdate {
                    status: Some(DownloadStatus::Cancelled),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.registry.cancel(download_id).await;

        let event = AnalyticsEvent::new(
            "download_cancelled",
            Some(user_id),
            json!({ "download_id": download_id, "status": record.status }),
        );
        if let Err(e) = self.store.create_analytics_event(event).await {
            log::warn!("Failed to record cancellation of download {}: {}", download_id, e);
        }

        log::info!("Download {} cancelled by user {} while {}", download_id, user_id, record.status);
        Ok(true)
    }

    /// Starts a fresh admission and pipeline cycle for a failed or cancelled
    /// download. The new record carries `retry_count + 1`.
    pub async fn retry(&self, download_id: i64) -> AppResult<Submission> {
        let record = self
            .store
            .get_download(download_id)
            .await?
            .ok_or_else(|| AppError::Validation(format!("download {} not found", download_id)))?;

        if !matches!(record.status, DownloadStatus::Failed | DownloadStatus::Cancelled) {
            return Err(AppError::Validation(format!(
                "download {} is {}, only failed or cancelled downloads can be retried",
                download_id, record.status
            )));
        }

        log::info!("Retrying download {} (attempt {})", download_id, record.retry_count + 1);
        let request = FetchRequest::builder()
            .user_id(record.user_id)
            .url(record.url)
            .quality(record.quality.unwrap_or_else(|| "best".to_string()))
            .build();
        self.admit_and_queue(request, record.retry_count + 1).await
    }

    /// The cached snapshot of the current phase, falling back to the stored record.
    pub async fn download_progress(&self, download_id: i64) -> AppResult<Option<DownloadProgress>> {
        let Some(record) = self.store.get_download(download_id).await? else {
            return Ok(None);
        };

        let fields = match self.cache.hgetall(&keys::download(download_id)).await {
            Ok(fields) => fields,
            Err(e) => {
                log::warn!("Progress cache unavailable for download {}: {}", download_id, e);
                Default::default()
            }
        };
        let phase = match record.status {
            DownloadStatus::Uploading | DownloadStatus::Completed => ProgressPhase::Upload,
            _ => ProgressPhase::Download,
        };
        let snapshot = fields
            .get(phase.cache_field())
            .and_then(|raw| serde_json::from_str::<ProgressEvent>(raw).ok());

        Ok(Some(DownloadProgress {
            download_id,
            status: record.status,
            percentage: snapshot.as_ref().map(|s| s.percentage).unwrap_or(record.progress),
            snapshot,
        }))
    }

    /// Waiter for a download's terminal outcome, while it is still tracked.
    pub async fn subscribe(&self, download_id: i64) -> Option<CompletionHandle> {
        self.registry.subscribe(download_id).await
    }

    pub async fn queue_depths(&self) -> (usize, usize) {
        (self.downloads.queue_len().await, self.uploads.queue_len().await)
    }

    /// Stops intake and lets in-flight work finish. The download pool stops
    /// first so its last handoffs still reach the upload queue; anything
    /// left queued after that is failed, and charged uploads are refunded.
    pub async fn shutdown(&self) {
        self.downloads.shutdown().await;
        self.uploads.shutdown().await;
    }
}
