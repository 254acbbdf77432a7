//! Video metadata via ffprobe.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;

use crate::core::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeResult {
    /// Seconds
    pub duration: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub codec: Option<String>,
}

#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> AppResult<ProbeResult>;
}

pub struct FfprobeProbe {
    bin: String,
}

impl FfprobeProbe {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    /// ffprobe prints numbers as strings here
    duration: Option<String>,
}

/// Parses `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_ffprobe(json: &str) -> AppResult<ProbeResult> {
    let output: FfprobeOutput = serde_json::from_str(json)?;
    let video = output
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    let duration = output
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .map(|d| d.max(0.0) as u64);

    Ok(match video {
        Some(stream) => ProbeResult {
            duration,
            width: stream.width,
            height: stream.height,
            codec: stream.codec_name,
        },
        None => ProbeResult {
            duration,
            ..Default::default()
        },
    })
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> AppResult<ProbeResult> {
        let output = Command::new(&self.bin)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(AppError::Validation(format!(
                "ffprobe failed on {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_ffprobe(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_video_stream() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720}
            ],
            "format": {"duration": "212.480000", "bit_rate": "1000"}
        }"#;
        let result = parse_ffprobe(json).unwrap();
        assert_eq!(
            result,
            ProbeResult {
                duration: Some(212),
                width: Some(1280),
                height: Some(720),
                codec: Some("h264".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_audio_only() {
        let json = r#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "61.2"}}"#;
        let result = parse_ffprobe(json).unwrap();
        assert_eq!(result.duration, Some(61));
        assert_eq!(result.width, None);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_ffprobe("not json").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let probe = FfprobeProbe::new("definitely-not-ffprobe-bin");
        assert!(probe.probe(Path::new("/nonexistent.mp4")).await.is_err());
    }
}
