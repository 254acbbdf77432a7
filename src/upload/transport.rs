//! Messaging transport contract and a local-directory implementation.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::core::error::TransportError;
use crate::download::progress::{ProgressCallback, ProgressSample};

/// Coarse media category, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    #[default]
    Document,
}

impl MediaKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "mp4" | "mkv" | "webm" | "mov" | "avi" | "m4v" | "flv" | "3gp" => MediaKind::Video,
            "mp3" | "m4a" | "aac" | "ogg" | "opus" | "wav" | "flac" => MediaKind::Audio,
            _ => MediaKind::Document,
        }
    }
}

/// What the transport is told about the media it sends.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub kind: MediaKind,
    pub file_name: String,
    pub duration: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub codec: Option<String>,
}

/// Where the media ended up on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub file_id: String,
    pub message_id: Option<i64>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a whole file in one call.
    ///
    /// Fails with [`TransportError::FilePartMissing`] when the remote side
    /// lost part of the file; callers fall back to the chunked path.
    async fn send_media(
        &self,
        chat_id: i64,
        file: &Path,
        caption: &str,
        metadata: &MediaMetadata,
        progress: ProgressCallback,
    ) -> Result<RemoteFile, TransportError>;

    /// Starts a multipart upload; returns the session id.
    async fn open_session(
        &self,
        chat_id: i64,
        metadata: &MediaMetadata,
        total_size: u64,
    ) -> Result<String, TransportError>;

    async fn upload_chunk(&self, session_id: &str, index: u64, data: Bytes) -> Result<(), TransportError>;

    /// Completes a multipart upload once every chunk was accepted.
    async fn finalize(
        &self,
        session_id: &str,
        caption: &str,
        metadata: &MediaMetadata,
    ) -> Result<RemoteFile, TransportError>;

    /// Drops a multipart upload that will not be finalized. Unknown ids are ignored.
    async fn abort_session(&self, session_id: &str);
}

/// Copy buffer for [`LocalDirTransport::send_media`].
const COPY_BUFFER: usize = 1024 * 1024;

struct LocalSession {
    chat_id: i64,
    path: PathBuf,
    total_size: u64,
    received: u64,
    next_index: u64,
}

/// "Uploads" into `<root>/<chat_id>/`. Used by the CLI and for local runs.
pub struct LocalDirTransport {
    root: PathBuf,
    sessions: DashMap<String, LocalSession>,
}

impl LocalDirTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: DashMap::new(),
        }
    }

    async fn chat_dir(&self, chat_id: i64) -> Result<PathBuf, TransportError> {
        let dir = self.root.join(chat_id.to_string());
        fs_err::tokio::create_dir_all(&dir).await.map_err(transport_io)?;
        Ok(dir)
    }

    fn unique_name(file_name: &str) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", &id[..8], file_name)
    }
}

fn transport_io(e: std::io::Error) -> TransportError {
    TransportError::Transport(e.to_string())
}

async fn remove_partial(path: &Path) {
    if let Err(e) = fs_err::tokio::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove partial upload {}: {}", path.display(), e);
        }
    }
}

fn file_id_for(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[async_trait]
impl Transport for LocalDirTransport {
    async fn send_media(
        &self,
        chat_id: i64,
        file: &Path,
        caption: &str,
        metadata: &MediaMetadata,
        progress: ProgressCallback,
    ) -> Result<RemoteFile, TransportError> {
        let dest = self.chat_dir(chat_id).await?.join(Self::unique_name(&metadata.file_name));
        let mut reader = fs_err::tokio::File::open(file).await.map_err(transport_io)?;
        let total = reader.metadata().await.map_err(transport_io)?.len();
        let mut writer = fs_err::tokio::File::create(&dest).await.map_err(transport_io)?;

        let mut buf = vec![0u8; COPY_BUFFER];
        let mut sent = 0u64;
        loop {
            let n = reader.read(&mut buf).await.map_err(transport_io)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await.map_err(transport_io)?;
            sent += n as u64;
            progress(ProgressSample::new(sent, Some(total)));
        }
        writer.flush().await.map_err(transport_io)?;

        if sent != total {
            return Err(TransportError::FilePartMissing(format!("sent {} of {} bytes", sent, total)));
        }

        fs_err::tokio::write(dest.with_extension("caption.txt"), caption)
            .await
            .map_err(transport_io)?;
        log::info!("Stored {} ({} bytes) for chat {}", dest.display(), sent, chat_id);
        Ok(RemoteFile {
            file_id: file_id_for(&dest),
            message_id: None,
        })
    }

    async fn open_session(
        &self,
        chat_id: i64,
        metadata: &MediaMetadata,
        total_size: u64,
    ) -> Result<String, TransportError> {
        let path = self.chat_dir(chat_id).await?.join(Self::unique_name(&metadata.file_name));
        fs_err::tokio::File::create(&path).await.map_err(transport_io)?;

        let session_id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            LocalSession {
                chat_id,
                path,
                total_size,
                received: 0,
                next_index: 0,
            },
        );
        Ok(session_id)
    }

    async fn upload_chunk(&self, session_id: &str, index: u64, data: Bytes) -> Result<(), TransportError> {
        let (path, offset) = {
            let session = self
                .sessions
                .get(session_id)
                .ok_or_else(|| TransportError::Transport(format!("unknown session {}", session_id)))?;
            if index != session.next_index {
                return Err(TransportError::FilePartMissing(format!(
                    "expected chunk {}, got {}",
                    session.next_index, index
                )));
            }
            (session.path.clone(), session.received)
        };

        let mut file = fs_err::tokio::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(transport_io)?;
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(transport_io)?;
        file.write_all(&data).await.map_err(transport_io)?;
        file.flush().await.map_err(transport_io)?;

        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.received += data.len() as u64;
            session.next_index += 1;
        }
        Ok(())
    }

    async fn finalize(
        &self,
        session_id: &str,
        caption: &str,
        _metadata: &MediaMetadata,
    ) -> Result<RemoteFile, TransportError> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| TransportError::Transport(format!("unknown session {}", session_id)))?;

        if session.received != session.total_size {
            remove_partial(&session.path).await;
            return Err(TransportError::FilePartMissing(format!(
                "received {} of {} bytes",
                session.received, session.total_size
            )));
        }

        fs_err::tokio::write(session.path.with_extension("caption.txt"), caption)
            .await
            .map_err(transport_io)?;
        log::info!(
            "Assembled {} ({} bytes) for chat {}",
            session.path.display(),
            session.received,
            session.chat_id
        );
        Ok(RemoteFile {
            file_id: file_id_for(&session.path),
            message_id: None,
        })
    }

    async fn abort_session(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            log::debug!(
                "Aborting session {} for chat {} after {} bytes",
                session_id,
                session.chat_id,
                session.received
            );
            remove_partial(&session.path).await;
        }
    }
}
