//! yt-dlp subprocess engine.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::core::error::ExtractionError;
use crate::download::engine::{format_selector, ExtractionEngine, MediaFormat, MediaInfo};
use crate::download::progress::{ProgressCallback, ProgressSample};

/// Output template inside the download directory.
const OUTPUT_TEMPLATE: &str = "%(title).200s.%(ext)s";

/// Keep this much of stderr in error messages.
const STDERR_TAIL: usize = 500;

pub struct YtDlpEngine {
    bin: String,
    timeout: Duration,
}

impl YtDlpEngine {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("--no-warnings")
            .arg("--no-color")
            .arg("--socket-timeout")
            .arg(self.timeout.as_secs().max(1).to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    height: Option<u32>,
    url: Option<String>,
    filesize: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    view_count: Option<u64>,
    #[serde(default)]
    formats: Vec<RawFormat>,
    is_live: Option<bool>,
    #[serde(rename = "_type")]
    kind: Option<String>,
    playlist_count: Option<u32>,
    entries: Option<Vec<serde_json::Value>>,
}

/// Turns `yt-dlp --dump-single-json` output into [`MediaInfo`].
pub fn parse_info(url: &str, json: &str) -> Result<MediaInfo, ExtractionError> {
    let raw: RawInfo =
        serde_json::from_str(json).map_err(|e| ExtractionError::Engine(format!("unreadable metadata: {}", e)))?;

    let is_playlist = url.contains("playlist") || raw.kind.as_deref() == Some("playlist");
    let playlist_count = raw
        .playlist_count
        .or_else(|| raw.entries.as_ref().map(|entries| entries.len() as u32));

    Ok(MediaInfo {
        title: raw.title.unwrap_or_else(|| "Unknown".to_string()),
        duration: raw.duration.map(|d| d.max(0.0) as u64),
        uploader: raw.uploader.or(raw.channel),
        view_count: raw.view_count,
        formats: extract_formats(raw.formats),
        is_live: raw.is_live.unwrap_or(false),
        is_playlist,
        playlist_count,
    })
}

/// One entry per height, highest first; formats without a URL or height are skipped.
fn extract_formats(formats: Vec<RawFormat>) -> Vec<MediaFormat> {
    let mut seen = HashSet::new();
    let mut extracted: Vec<(u32, MediaFormat)> = formats
        .into_iter()
        .filter(|f| f.url.is_some())
        .filter_map(|f| {
            let height = f.height.filter(|h| *h > 0)?;
            if !seen.insert(height) {
                return None;
            }
            Some((
                height,
                MediaFormat {
                    quality: format!("{}p", height),
                    format_id: f.format_id.unwrap_or_default(),
                    ext: f.ext.unwrap_or_else(|| "mp4".to_string()),
                    filesize: f.filesize,
                },
            ))
        })
        .collect();
    extracted.sort_by(|a, b| b.0.cmp(&a.0));
    extracted.into_iter().map(|(_, f)| f).collect()
}

/// Parses a `[download]  45.3% of 10.00MiB at 2.50MiB/s ETA 00:02` line.
pub fn parse_progress_line(line: &str) -> Option<ProgressSample> {
    if !line.contains("[download]") || !line.contains('%') {
        return None;
    }

    let parts: Vec<&str> = line.split_whitespace().filter(|p| *p != "~").collect();
    let mut percent = None;
    let mut total = None;
    let mut speed = None;
    let mut eta_secs = None;

    for (i, part) in parts.iter().enumerate() {
        let next = parts.get(i + 1).copied();
        if let Some(value) = part.strip_suffix('%') {
            percent = value.parse::<f64>().ok().map(|p| p.clamp(0.0, 100.0));
        }
        match (*part, next) {
            ("of", Some(size)) => total = parse_size(size.trim_start_matches('~')),
            ("at", Some(rate)) => speed = parse_size(rate).map(|b| b as f64),
            ("ETA", Some(eta)) => eta_secs = parse_eta(eta),
            _ => {}
        }
    }

    let percent = percent?;
    let transferred = total.map(|t| (t as f64 * percent / 100.0) as u64).unwrap_or(0);
    Some(ProgressSample {
        transferred,
        total,
        speed,
        eta_secs,
    })
}

/// `10.00MiB`, `500.00KiB/s`, `1.2GiB` to bytes.
fn parse_size(size: &str) -> Option<u64> {
    let size = size.trim_end_matches("/s");
    let (number, multiplier) = if let Some(n) = size.strip_suffix("GiB") {
        (n, 1024.0 * 1024.0 * 1024.0)
    } else if let Some(n) = size.strip_suffix("MiB") {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = size.strip_suffix("KiB") {
        (n, 1024.0)
    } else if let Some(n) = size.strip_suffix('B') {
        (n, 1.0)
    } else {
        return None;
    };
    number.parse::<f64>().ok().map(|n| (n * multiplier) as u64)
}

/// `00:10`, `1:23` or `1:02:03` to seconds.
fn parse_eta(eta: &str) -> Option<u64> {
    eta.split(':')
        .try_fold(0u64, |acc, part| part.parse::<u64>().ok().map(|v| acc * 60 + v))
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

#[async_trait]
impl ExtractionEngine for YtDlpEngine {
    async fn get_info(&self, url: &str) -> Result<MediaInfo, ExtractionError> {
        let mut cmd = self.base_command();
        cmd.arg("--dump-single-json").arg("--flat-playlist").arg(url);
        log::debug!("Fetching metadata for {}", url);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ExtractionError::Timeout)?
            .map_err(|e| ExtractionError::Process(format!("failed to run {}: {}", self.bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractionError::Engine(stderr_tail(&stderr)));
        }
        parse_info(url, &String::from_utf8_lossy(&output.stdout))
    }

    async fn download(
        &self,
        url: &str,
        quality: &str,
        dest_dir: &Path,
        progress: ProgressCallback,
    ) -> Result<PathBuf, ExtractionError> {
        let mut cmd = self.base_command();
        cmd.arg("-f")
            .arg(format_selector(quality))
            .arg("-o")
            .arg(dest_dir.join(OUTPUT_TEMPLATE))
            .arg("--newline")
            .arg("--retries")
            .arg("3")
            .arg("--fragment-retries")
            .arg("3")
            .arg("--no-playlist");
        if quality == "audio" {
            cmd.args(["-x", "--audio-format", "mp3", "--audio-quality", "320K"]);
        }
        cmd.arg(url).stdout(Stdio::piped()).stderr(Stdio::piped());

        log::info!("Starting yt-dlp for {} (quality {})", url, quality);
        let mut child = cmd
            .spawn()
            .map_err(|e| ExtractionError::Process(format!("failed to run {}: {}", self.bin, e)))?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_progress_line(&line) {
                    Some(sample) => progress(sample),
                    None => log::trace!("yt-dlp: {}", line),
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ExtractionError::Process(e.to_string()))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            log::warn!("yt-dlp exited with {} for {}", status, url);
            return Err(ExtractionError::Process(stderr_tail(&stderr)));
        }

        largest_file_in(dest_dir).await?.ok_or(ExtractionError::NoOutput)
    }
}

async fn largest_file_in(dir: &Path) -> Result<Option<PathBuf>, ExtractionError> {
    let io = |e: std::io::Error| ExtractionError::Process(e.to_string());
    let mut entries = fs_err::tokio::read_dir(dir).await.map_err(io)?;
    let mut largest: Option<(PathBuf, u64)> = None;
    while let Some(entry) = entries.next_entry().await.map_err(io)? {
        let metadata = entry.metadata().await.map_err(io)?;
        if metadata.is_file() && largest.as_ref().map_or(true, |(_, size)| metadata.len() > *size) {
            largest = Some((entry.path(), metadata.len()));
        }
    }
    Ok(largest.map(|(path, _)| path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_line() {
        let sample = parse_progress_line("[download]  45.3% of 10.00MiB at 2.50MiB/s ETA 00:02").unwrap();
        assert_eq!(sample.total, Some(10 * 1024 * 1024));
        assert_eq!(sample.transferred, 4_750_049);
        assert_eq!(sample.speed, Some(2.5 * 1024.0 * 1024.0));
        assert_eq!(sample.eta_secs, Some(2));
    }

    #[test]
    fn test_parse_progress_estimated_total() {
        let sample = parse_progress_line("[download]  10.0% of ~ 1.00GiB at 512.00KiB/s ETA 1:02:03").unwrap();
        assert_eq!(sample.total, Some(1024 * 1024 * 1024));
        assert_eq!(sample.speed, Some(512.0 * 1024.0));
        assert_eq!(sample.eta_secs, Some(3723));
    }

    #[test]
    fn test_non_progress_lines_are_ignored() {
        assert_eq!(parse_progress_line("[download] Destination: /tmp/x/video.mp4"), None);
        assert_eq!(parse_progress_line("[youtube] abc: Downloading webpage"), None);
        assert_eq!(parse_progress_line("[download] 100%"), Some(ProgressSample::default()));
    }

    #[test]
    fn test_parse_info() {
        let json = r#"{
            "title": "Clip",
            "duration": 125.7,
            "channel": "Someone",
            "view_count": 10,
            "is_live": false,
            "formats": [
                {"format_id": "18", "ext": "mp4", "height": 360, "url": "https://x/18"},
                {"format_id": "22", "ext": "mp4", "height": 720, "url": "https://x/22", "filesize": 1000},
                {"format_id": "136", "ext": "mp4", "height": 720, "url": "https://x/136"},
                {"format_id": "140", "ext": "m4a", "url": "https://x/140"},
                {"format_id": "sb", "ext": "mhtml", "height": 90}
            ]
        }"#;
        let info = parse_info("https://youtu.be/abc", json).unwrap();
        assert_eq!(info.title, "Clip");
        assert_eq!(info.duration, Some(125));
        assert_eq!(info.uploader.as_deref(), Some("Someone"));
        assert!(!info.is_playlist);
        let qualities: Vec<_> = info.formats.iter().map(|f| f.quality.as_str()).collect();
        assert_eq!(qualities, vec!["720p", "360p"]);
        assert_eq!(info.formats[0].format_id, "22");
    }

    #[test]
    fn test_parse_playlist_info() {
        let json = r#"{"_type": "playlist", "title": "Mix", "entries": [{}, {}, {}]}"#;
        let info = parse_info("https://youtube.com/watch?list=1", json).unwrap();
        assert!(info.is_playlist);
        assert_eq!(info.playlist_count, Some(3));

        let info = parse_info("https://youtube.com/playlist?list=1", r#"{"title": "x"}"#).unwrap();
        assert!(info.is_playlist);
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        let long = "x".repeat(2000) + "ERROR: gone";
        let tail = stderr_tail(&long);
        assert!(tail.ends_with("ERROR: gone"));
        assert!(tail.len() <= STDERR_TAIL + 1);
    }
}
