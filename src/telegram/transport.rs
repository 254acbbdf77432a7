//! Delivery through the Bot API.
//!
//! The Bot API has no multipart upload. Chunked sessions are spooled to a
//! local file and the assembled file is sent on `finalize`, which needs a
//! local Bot API server for anything above the hosted 50 MB limit.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use teloxide::prelude::*;
use teloxide::types::{InputFile, Message};
use teloxide::RequestError;
use tokio::io::AsyncWriteExt;

use crate::core::error::TransportError;
use crate::download::progress::{ProgressCallback, ProgressSample};
use crate::upload::transport::{MediaKind, MediaMetadata, RemoteFile, Transport};

struct Spool {
    chat_id: i64,
    path: PathBuf,
    total_size: u64,
    received: u64,
    next_index: u64,
}

pub struct TelegramTransport {
    bot: Bot,
    spool_dir: PathBuf,
    sessions: DashMap<String, Spool>,
}

impl TelegramTransport {
    pub fn new(bot: Bot, spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            bot,
            spool_dir: spool_dir.into(),
            sessions: DashMap::new(),
        }
    }

    async fn send(
        &self,
        chat_id: i64,
        file: &Path,
        caption: &str,
        metadata: &MediaMetadata,
    ) -> Result<RemoteFile, TransportError> {
        let chat = ChatId(chat_id);
        let input = InputFile::file(file.to_path_buf()).file_name(metadata.file_name.clone());

        let message = match metadata.kind {
            MediaKind::Video => {
                let mut request = self.bot.send_video(chat, input).caption(caption).supports_streaming(true);
                if let Some(duration) = metadata.duration {
                    request = request.duration(duration as u32);
                }
                if let (Some(width), Some(height)) = (metadata.width, metadata.height) {
                    request = request.width(width).height(height);
                }
                request.await
            }
            MediaKind::Audio => {
                let mut request = self.bot.send_audio(chat, input).caption(caption);
                if let Some(duration) = metadata.duration {
                    request = request.duration(duration as u32);
                }
                request.await
            }
            MediaKind::Document => self.bot.send_document(chat, input).caption(caption).await,
        }
        .map_err(classify)?;

        Ok(remote_file(&message))
    }
}

/// `FILE_PART_<n>_MISSING` becomes [`TransportError::FilePartMissing`].
fn classify(error: RequestError) -> TransportError {
    let text = error.to_string();
    let upper = text.to_uppercase();
    if upper.contains("FILE_PART") && upper.contains("MISSING") {
        TransportError::FilePartMissing(text)
    } else {
        TransportError::Transport(text)
    }
}

fn remote_file(message: &Message) -> RemoteFile {
    let file_id = message
        .video()
        .map(|v| v.file.id.to_string())
        .or_else(|| message.audio().map(|a| a.file.id.to_string()))
        .or_else(|| message.document().map(|d| d.file.id.to_string()))
        .unwrap_or_default();
    RemoteFile {
        file_id,
        message_id: Some(i64::from(message.id.0)),
    }
}

fn spool_io(e: std::io::Error) -> TransportError {
    TransportError::Transport(format!("spool: {}", e))
}

async fn remove_spool(path: &Path) {
    if let Err(e) = fs_err::tokio::remove_file(path).await {
        log::warn!("Failed to remove spool file {}: {}", path.display(), e);
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send_media(
        &self,
        chat_id: i64,
        file: &Path,
        caption: &str,
        metadata: &MediaMetadata,
        progress: ProgressCallback,
    ) -> Result<RemoteFile, TransportError> {
        let size = fs_err::tokio::metadata(file).await.map_err(spool_io)?.len();
        progress(ProgressSample::new(0, Some(size)));
        let remote = self.send(chat_id, file, caption, metadata).await?;
        progress(ProgressSample::new(size, Some(size)));
        Ok(remote)
    }

    async fn open_session(
        &self,
        chat_id: i64,
        metadata: &MediaMetadata,
        total_size: u64,
    ) -> Result<String, TransportError> {
        fs_err::tokio::create_dir_all(&self.spool_dir).await.map_err(spool_io)?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let path = self.spool_dir.join(format!("{}_{}", session_id, metadata.file_name));
        fs_err::tokio::File::create(&path).await.map_err(spool_io)?;

        self.sessions.insert(
            session_id.clone(),
            Spool {
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
        let path = {
            let spool = self
                .sessions
                .get(session_id)
                .ok_or_else(|| TransportError::Transport(format!("unknown session {}", session_id)))?;
            if index != spool.next_index {
                return Err(TransportError::FilePartMissing(format!(
                    "expected chunk {}, got {}",
                    spool.next_index, index
                )));
            }
            spool.path.clone()
        };

        let mut file = fs_err::tokio::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(spool_io)?;
        file.write_all(&data).await.map_err(spool_io)?;
        file.flush().await.map_err(spool_io)?;

        if let Some(mut spool) = self.sessions.get_mut(session_id) {
            spool.received += data.len() as u64;
            spool.next_index += 1;
        }
        Ok(())
    }

    async fn finalize(
        &self,
        session_id: &str,
        caption: &str,
        metadata: &MediaMetadata,
    ) -> Result<RemoteFile, TransportError> {
        let (_, spool) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| TransportError::Transport(format!("unknown session {}", session_id)))?;

        let result = if spool.received != spool.total_size {
            Err(TransportError::FilePartMissing(format!(
                "received {} of {} bytes",
                spool.received, spool.total_size
            )))
        } else {
            self.send(spool.chat_id, &spool.path, caption, metadata).await
        };

        remove_spool(&spool.path).await;
        result
    }

    async fn abort_session(&self, session_id: &str) {
        if let Some((_, spool)) = self.sessions.remove(session_id) {
            log::debug!("Dropping spool for chat {} after {} bytes", spool.chat_id, spool.received);
            remove_spool(&spool.path).await;
        }
    }
}
