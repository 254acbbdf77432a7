use crate::core::utils::{format_duration, format_size, truncate};

/// Telegram caption limit, in characters.
pub const MAX_CAPTION_LEN: usize = 1024;

/// Inputs for [`build_caption`].
#[derive(Debug, Clone, Default)]
pub struct CaptionInfo<'a> {
    pub title: Option<&'a str>,
    pub uploader: Option<&'a str>,
    /// Seconds
    pub duration: Option<u64>,
    pub file_size: u64,
    pub quality: Option<&'a str>,
}

/// Title, channel, duration, size and (unless `best`) quality, one per line.
pub fn build_caption(info: &CaptionInfo<'_>) -> String {
    let title = info.title.filter(|t| !t.trim().is_empty()).unwrap_or("Unknown");
    let mut caption = format!("📹 {}\n\n", title);

    if let Some(uploader) = info.uploader.filter(|u| !u.is_empty()) {
        caption.push_str(&format!("👤 Channel: {}\n", uploader));
    }
    if let Some(duration) = info.duration.filter(|d| *d > 0) {
        caption.push_str(&format!("⏱ Duration: {}\n", format_duration(duration)));
    }
    caption.push_str(&format!("📦 Size: {}\n", format_size(info.file_size)));
    if let Some(quality) = info.quality.filter(|q| !q.is_empty() && *q != "best") {
        caption.push_str(&format!("🎬 Quality: {}\n", quality));
    }

    truncate(caption.trim_end(), MAX_CAPTION_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_full_caption() {
        let caption = build_caption(&CaptionInfo {
            title: Some("Big Talk"),
            uploader: Some("Some Channel"),
            duration: Some(3725),
            file_size: 1536 * 1024 * 1024,
            quality: Some("720p"),
        });
        assert_eq!(
            caption,
            "📹 Big Talk\n\n👤 Channel: Some Channel\n⏱ Duration: 1:02:05\n📦 Size: 1.50 GB\n🎬 Quality: 720p"
        );
    }

    #[test]
    fn test_minimal_caption() {
        let caption = build_caption(&CaptionInfo {
            title: None,
            file_size: 5 * 1024 * 1024,
            quality: Some("best"),
            ..Default::default()
        });
        assert_eq!(caption, "📹 Unknown\n\n📦 Size: 5.00 MB");
    }
}
