//! Media extraction engine contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::error::ExtractionError;
use crate::download::progress::ProgressCallback;

/// One selectable video format, de-duplicated by height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    /// `720p`, `1080p`, ...
    pub quality: String,
    pub format_id: String,
    pub ext: String,
    pub filesize: Option<u64>,
}

/// What the engine knows about a URL before downloading it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: String,
    /// Seconds
    pub duration: Option<u64>,
    pub uploader: Option<String>,
    pub view_count: Option<u64>,
    /// Highest quality first
    pub formats: Vec<MediaFormat>,
    pub is_live: bool,
    pub is_playlist: bool,
    pub playlist_count: Option<u32>,
}

#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    async fn get_info(&self, url: &str) -> Result<MediaInfo, ExtractionError>;

    /// Downloads `url` into `dest_dir` and returns the produced file.
    async fn download(
        &self,
        url: &str,
        quality: &str,
        dest_dir: &Path,
        progress: ProgressCallback,
    ) -> Result<PathBuf, ExtractionError>;
}

/// yt-dlp `-f` selector for a quality label (`best`, `audio`, `720p`, ...).
pub fn format_selector(quality: &str) -> String {
    match quality {
        "audio" => "bestaudio[ext=m4a]/bestaudio[ext=mp3]/bestaudio".to_string(),
        "best" | "" => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best".to_string(),
        other => {
            let height = other.trim_end_matches('p');
            format!(
                "bestvideo[height<={h}][ext=mp4]+bestaudio[ext=m4a]/best[height<={h}][ext=mp4]/best[ext=mp4]/best",
                h = height
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_selector() {
        assert_eq!(format_selector("audio"), "bestaudio[ext=m4a]/bestaudio[ext=mp3]/bestaudio");
        assert!(format_selector("best").starts_with("bestvideo[ext=mp4]"));
        assert!(format_selector("720p").contains("[height<=720]"));
        assert!(format_selector("480").contains("[height<=480]"));
    }
}
