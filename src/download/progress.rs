//! Throttled progress reporting shared by both pipelines.
//!
//! Extraction and transport layers call a [`ProgressCallback`] as often as
//! they like. The [`ProgressTracker`] behind it lets one sample through per
//! interval and hands it to a background task that writes the cache snapshot,
//! updates the download record and forwards a [`ProgressEvent`] to the
//! caller-supplied sink. Calling the callback never waits on any of that.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::storage::{keys, Cache, DownloadUpdate, Persistence};

/// Default minimum gap between two emissions.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Raw progress as reported by an engine or transport.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgressSample {
    /// Bytes transferred so far (absolute)
    pub transferred: u64,
    /// Total bytes, when known
    pub total: Option<u64>,
    /// Instantaneous speed in bytes/sec, when the source reports one
    pub speed: Option<f64>,
    /// ETA in seconds, when the source reports one
    pub eta_secs: Option<u64>,
}

impl ProgressSample {
    pub fn new(transferred: u64, total: Option<u64>) -> Self {
        Self {
            transferred,
            total,
            ..Default::default()
        }
    }
}

/// Progress hook handed to engines and transports.
pub type ProgressCallback = Arc<dyn Fn(ProgressSample) + Send + Sync>;

/// A callback that drops every sample.
pub fn noop_callback() -> ProgressCallback {
    Arc::new(|_| {})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Download,
    Upload,
}

impl ProgressPhase {
    /// Hash field of the `download:{id}` cache entry holding the snapshot.
    pub fn cache_field(self) -> &'static str {
        match self {
            ProgressPhase::Download => "progress",
            ProgressPhase::Upload => "upload_progress",
        }
    }
}

/// Snapshot emitted at most once per interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub download_id: i64,
    pub phase: ProgressPhase,
    pub percentage: f64,
    pub downloaded: u64,
    pub total: u64,
    /// Bytes per second
    pub speed: f64,
    /// Seconds left; 0 when speed is 0
    pub eta: u64,
}

/// Where progress snapshots go.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn Persistence>,
    cache: Arc<dyn Cache>,
    interval: Duration,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn Persistence>, cache: Arc<dyn Cache>, interval: Duration) -> Self {
        Self { store, cache, interval }
    }

    /// Starts tracking one phase of one download.
    ///
    /// Spawns the persister task; it ends once the tracker is finished.
    pub fn track(
        &self,
        download_id: i64,
        phase: ProgressPhase,
        sink: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Arc<ProgressTracker> {
        let (tx, rx) = mpsc::unbounded_channel();
        let persister = tokio::spawn(persist_events(self.store.clone(), self.cache.clone(), rx, sink));

        Arc::new(ProgressTracker {
            download_id,
            phase,
            interval: self.interval,
            started: Instant::now(),
            state: Mutex::new(TrackerState::default()),
            tx: Mutex::new(Some(tx)),
            persister: Mutex::new(Some(persister)),
        })
    }
}

#[derive(Default)]
struct TrackerState {
    last_emit: Option<Instant>,
    /// Latest sample not yet emitted
    pending: Option<ProgressSample>,
    /// Highest percentage emitted so far in this phase
    high_water: f64,
}

pub struct ProgressTracker {
    download_id: i64,
    phase: ProgressPhase,
    interval: Duration,
    started: Instant,
    state: Mutex<TrackerState>,
    tx: Mutex<Option<mpsc::UnboundedSender<ProgressEvent>>>,
    persister: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressTracker {
    pub fn download_id(&self) -> i64 {
        self.download_id
    }

    /// Records a sample; emits it when the interval since the last emission has passed.
    ///
    /// Never blocks: the emission is queued for the persister task.
    pub fn update(&self, sample: ProgressSample) {
        let now = Instant::now();
        let event = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let due = match state.last_emit {
                None => true,
                Some(last) => now.duration_since(last) >= self.interval,
            };
            if !due {
                state.pending = Some(sample);
                return;
            }
            state.last_emit = Some(now);
            state.pending = None;
            self.build_event(&mut state, sample, now)
        };
        self.dispatch(event);
    }

    /// Emits the latest unsent sample regardless of the interval, then waits
    /// for every queued snapshot to be written. Later updates are ignored.
    pub async fn finish(&self) {
        let event = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let now = Instant::now();
            state
                .pending
                .take()
                .map(|sample| self.build_event(&mut state, sample, now))
        };
        if let Some(event) = event {
            self.dispatch(event);
        }

        // Closing the channel lets the persister drain and exit.
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let persister = self.persister.lock().ok().and_then(|mut p| p.take());
        if let Some(persister) = persister {
            if let Err(e) = persister.await {
                log::warn!("Progress persister for download {} ended abnormally: {}", self.download_id, e);
            }
        }
    }

    /// Wraps the tracker as a callback for engines and transports.
    pub fn callback(self: &Arc<Self>) -> ProgressCallback {
        let tracker = Arc::clone(self);
        Arc::new(move |sample| tracker.update(sample))
    }

    fn build_event(&self, state: &mut TrackerState, sample: ProgressSample, now: Instant) -> ProgressEvent {
        let total = sample.total.unwrap_or(0);
        let raw = if total > 0 {
            (sample.transferred as f64 / total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        let percentage = raw.max(state.high_water);
        state.high_water = percentage;

        let speed = match sample.speed {
            Some(speed) if speed > 0.0 => speed,
            _ => {
                let elapsed = now.duration_since(self.started).as_secs_f64();
                if elapsed > 0.0 {
                    sample.transferred as f64 / elapsed
                } else {
                    0.0
                }
            }
        };

        let eta = match sample.eta_secs {
            Some(eta) => eta,
            None if speed > 0.0 && total > sample.transferred => {
                ((total - sample.transferred) as f64 / speed) as u64
            }
            None => 0,
        };

        ProgressEvent {
            download_id: self.download_id,
            phase: self.phase,
            percentage: (percentage * 10.0).round() / 10.0,
            downloaded: sample.transferred,
            total,
            speed,
            eta,
        }
    }

    fn dispatch(&self, event: ProgressEvent) {
        if let Ok(tx) = self.tx.lock() {
            if let Some(tx) = tx.as_ref() {
                // The persister only stops after the sender is gone.
                let _ = tx.send(event);
            }
        }
    }
}

async fn persist_events(
    store: Arc<dyn Persistence>,
    cache: Arc<dyn Cache>,
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    sink: Option<mpsc::Sender<ProgressEvent>>,
) {
    while let Some(event) = rx.recv().await {
        let key = keys::download(event.download_id);
        match serde_json::to_string(&event) {
            Ok(snapshot) => {
                if let Err(e) = cache.hset(&key, event.phase.cache_field(), &snapshot).await {
                    log::warn!("Failed to cache progress for download {}: {}", event.download_id, e);
                }
            }
            Err(e) => log::warn!("Failed to encode progress snapshot: {}", e),
        }

        if let Err(e) = store
            .update_download(event.download_id, DownloadUpdate::progress(event.percentage))
            .await
        {
            log::warn!("Failed to persist progress for download {}: {}", event.download_id, e);
        }

        if let Some(sink) = &sink {
            if sink.send(event).await.is_err() {
                log::debug!("Progress sink closed");
            }
        }
    }
}
