//! In-process doubles for the external collaborators.
//!
//! Used by unit tests, the integration suite and benchmarks. Every double is
//! cheap to clone and shares its state between clones, so a test can keep a
//! handle for assertions after moving one into a pipeline.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::admission::MembershipChecker;
use crate::core::error::{AppError, AppResult, ExtractionError, TransportError};
use crate::download::engine::{ExtractionEngine, MediaFormat, MediaInfo};
use crate::download::progress::{ProgressCallback, ProgressSample};
use crate::upload::probe::{MediaProbe, ProbeResult};
use crate::upload::transport::{MediaMetadata, RemoteFile, Transport};

pub const MOCK_TITLE: &str = "Mock video";

#[derive(Default)]
struct EngineState {
    file_size: u64,
    delay: Duration,
    failures: HashMap<String, String>,
    panics: Vec<String>,
    live: Vec<String>,
    playlists: Vec<String>,
    download_calls: AtomicUsize,
}

/// Extraction engine that writes a file of a configured size.
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<EngineState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(EngineState {
                file_size: 1024,
                ..Default::default()
            }),
        }
    }

    fn configure(mut self, f: impl FnOnce(&mut EngineState)) -> Self {
        match Arc::get_mut(&mut self.state) {
            Some(state) => f(state),
            None => log::warn!("MockEngine configured after being shared; ignoring"),
        }
        self
    }

    pub fn with_file_size(self, bytes: u64) -> Self {
        self.configure(|s| s.file_size = bytes)
    }

    /// Each download waits this long before writing its file.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.configure(|s| s.delay = delay)
    }

    pub fn fail_url(self, url: &str, message: &str) -> Self {
        self.configure(|s| {
            s.failures.insert(url.to_string(), message.to_string());
        })
    }

    pub fn panic_url(self, url: &str) -> Self {
        self.configure(|s| s.panics.push(url.to_string()))
    }

    pub fn live_url(self, url: &str) -> Self {
        self.configure(|s| s.live.push(url.to_string()))
    }

    pub fn playlist_url(self, url: &str) -> Self {
        self.configure(|s| s.playlists.push(url.to_string()))
    }

    pub fn download_calls(&self) -> usize {
        self.state.download_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionEngine for MockEngine {
    async fn get_info(&self, url: &str) -> Result<MediaInfo, ExtractionError> {
        let is_playlist = self.state.playlists.iter().any(|u| u == url);
        Ok(MediaInfo {
            title: MOCK_TITLE.to_string(),
            duration: Some(125),
            uploader: Some("Mock channel".to_string()),
            view_count: Some(42),
            formats: vec![MediaFormat {
                quality: "720p".to_string(),
                format_id: "22".to_string(),
                ext: "mp4".to_string(),
                filesize: Some(self.state.file_size),
            }],
            is_live: self.state.live.iter().any(|u| u == url),
            is_playlist,
            playlist_count: is_playlist.then_some(3),
        })
    }

    #[allow(clippy::panic)]
    async fn download(
        &self,
        url: &str,
        _quality: &str,
        dest_dir: &Path,
        progress: ProgressCallback,
    ) -> Result<PathBuf, ExtractionError> {
        self.state.download_calls.fetch_add(1, Ordering::SeqCst);

        if self.state.panics.iter().any(|u| u == url) {
            panic!("mock engine exploded on {}", url);
        }
        if let Some(message) = self.state.failures.get(url) {
            return Err(ExtractionError::Process(message.clone()));
        }
        if !self.state.delay.is_zero() {
            tokio::time::sleep(self.state.delay).await;
        }

        let total = self.state.file_size;
        progress(ProgressSample::new(total / 2, Some(total)));
        let path = dest_dir.join(format!("{}.mp4", MOCK_TITLE));
        fs_err::tokio::write(&path, vec![0u8; total as usize])
            .await
            .map_err(|e| ExtractionError::Engine(e.to_string()))?;
        progress(ProgressSample::new(total, Some(total)));
        Ok(path)
    }
}

/// One call seen by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Direct { chat_id: i64, size: u64 },
    OpenSession { chat_id: i64, total_size: u64 },
    Chunk { index: u64, size: usize },
    Finalize { received: u64 },
    Abort { session: String },
}

#[derive(Default)]
struct TransportState {
    calls: Mutex<Vec<TransportCall>>,
    captions: Mutex<Vec<String>>,
    direct_part_missing: AtomicUsize,
    fail_everything: AtomicUsize,
    send_delay_ms: AtomicU64,
    /// Remaining transient failures per chunk index
    chunk_failures: DashMap<u64, usize>,
    sessions: DashMap<String, u64>,
    next_id: AtomicUsize,
}

/// Transport that records every call and can be told to fail.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<TransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` direct sends fail with a missing file part.
    pub fn part_missing_on_direct(self, times: usize) -> Self {
        self.state.direct_part_missing.store(times, Ordering::SeqCst);
        self
    }

    /// Chunk `index` fails `times` times before it is accepted.
    pub fn fail_chunk(self, index: u64, times: usize) -> Self {
        self.state.chunk_failures.insert(index, times);
        self
    }

    /// Every call fails with a plain transport error.
    pub fn fail_everything(self) -> Self {
        self.state.fail_everything.store(1, Ordering::SeqCst);
        self
    }

    /// Direct sends take `delay` before answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state
            .send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    /// Sessions opened and not yet finalized or aborted.
    pub fn open_sessions(&self) -> usize {
        self.state.sessions.len()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn captions(&self) -> Vec<String> {
        self.state.captions.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn chunk_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::Chunk { .. }))
            .count()
    }

    fn record(&self, call: TransportCall) {
        if let Ok(mut calls) = self.state.calls.lock() {
            calls.push(call);
        }
    }

    fn check_broken(&self) -> Result<(), TransportError> {
        if self.state.fail_everything.load(Ordering::SeqCst) > 0 {
            return Err(TransportError::Transport("mock transport is down".to_string()));
        }
        Ok(())
    }

    fn remote(&self, caption: &str) -> RemoteFile {
        if let Ok(mut captions) = self.state.captions.lock() {
            captions.push(caption.to_string());
        }
        let n = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        RemoteFile {
            file_id: format!("mock-file-{}", n),
            message_id: Some(n as i64),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_media(
        &self,
        chat_id: i64,
        file: &Path,
        caption: &str,
        _metadata: &MediaMetadata,
        progress: ProgressCallback,
    ) -> Result<RemoteFile, TransportError> {
        let size = fs_err::tokio::metadata(file)
            .await
            .map_err(|e| TransportError::Transport(e.to_string()))?
            .len();
        self.record(TransportCall::Direct { chat_id, size });
        self.check_broken()?;

        let delay = self.state.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let missing = self.state.direct_part_missing.load(Ordering::SeqCst);
        if missing > 0 {
            self.state.direct_part_missing.store(missing - 1, Ordering::SeqCst);
            return Err(TransportError::FilePartMissing("FILE_PART_0_MISSING".to_string()));
        }

        progress(ProgressSample::new(size, Some(size)));
        Ok(self.remote(caption))
    }

    async fn open_session(
        &self,
        chat_id: i64,
        _metadata: &MediaMetadata,
        total_size: u64,
    ) -> Result<String, TransportError> {
        self.record(TransportCall::OpenSession { chat_id, total_size });
        self.check_broken()?;
        let session = format!("session-{}", self.state.next_id.load(Ordering::SeqCst));
        self.state.sessions.insert(session.clone(), 0);
        Ok(session)
    }

    async fn upload_chunk(&self, session_id: &str, index: u64, data: Bytes) -> Result<(), TransportError> {
        self.record(TransportCall::Chunk { index, size: data.len() });
        self.check_broken()?;

        if let Some(mut remaining) = self.state.chunk_failures.get_mut(&index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Transport(format!("chunk {} timed out", index)));
            }
        }

        let mut received = self
            .state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TransportError::Transport(format!("unknown session {}", session_id)))?;
        *received += data.len() as u64;
        Ok(())
    }

    async fn finalize(
        &self,
        session_id: &str,
        caption: &str,
        _metadata: &MediaMetadata,
    ) -> Result<RemoteFile, TransportError> {
        let (_, received) = self
            .state
            .sessions
            .remove(session_id)
            .ok_or_else(|| TransportError::Transport(format!("unknown session {}", session_id)))?;
        self.record(TransportCall::Finalize { received });
        self.check_broken()?;
        Ok(self.remote(caption))
    }

    async fn abort_session(&self, session_id: &str) {
        self.state.sessions.remove(session_id);
        self.record(TransportCall::Abort {
            session: session_id.to_string(),
        });
    }
}

/// Probe returning a fixed result, or failing when built with [`MockProbe::failing`].
#[derive(Clone, Default)]
pub struct MockProbe {
    result: Option<ProbeResult>,
}

impl MockProbe {
    pub fn new(result: ProbeResult) -> Self {
        Self { result: Some(result) }
    }

    pub fn failing() -> Self {
        Self { result: None }
    }
}

#[async_trait]
impl MediaProbe for MockProbe {
    async fn probe(&self, path: &Path) -> AppResult<ProbeResult> {
        self.result
            .clone()
            .ok_or_else(|| AppError::Validation(format!("cannot probe {}", path.display())))
    }
}

/// Channel membership backed by an in-memory table. Unknown pairs are members.
#[derive(Clone, Default)]
pub struct MockMembership {
    members: Arc<DashMap<(i64, String), bool>>,
    broken: Arc<DashSet<String>>,
}

impl MockMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_member(&self, user_id: i64, channel: &str, member: bool) {
        self.members.insert((user_id, channel.to_string()), member);
    }

    /// Lookups for `channel` fail.
    pub fn fail_channel(&self, channel: &str) {
        self.broken.insert(channel.to_string());
    }
}

#[async_trait]
impl MembershipChecker for MockMembership {
    async fn is_member(&self, user_id: i64, channel: &str) -> AppResult<bool> {
        if self.broken.contains(channel) {
            return Err(AppError::Validation(format!("membership lookup failed for {}", channel)));
        }
        Ok(self
            .members
            .get(&(user_id, channel.to_string()))
            .map(|m| *m)
            .unwrap_or(true))
    }
}
