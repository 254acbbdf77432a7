use lazy_regex::{lazy_regex, Lazy, Regex};

/// Maximum number of URLs handled from a single message.
pub const MAX_URLS_PER_MESSAGE: usize = 3;

static URL_PATTERNS: [Lazy<Regex>; 8] = [
    lazy_regex!(r"(?:https?://)?(?:www\.|m\.)?(?:youtube\.com|youtu\.be)/(?:watch\?v=|embed/|v/|shorts/)?[\w-]+"),
    lazy_regex!(r"(?:https?://)?(?:www\.)?(?:twitter\.com|x\.com)/\w+/status/\d+"),
    lazy_regex!(r"(?:https?://)?(?:www\.)?(?:instagram\.com|instagr\.am)/(?:p|reel|tv)/[\w-]+"),
    lazy_regex!(r"(?:https?://)?(?:www\.)?(?:facebook\.com|fb\.com|fb\.watch)/[\w./]+"),
    lazy_regex!(r"(?:https?://)?(?:www\.|vm\.)?tiktok\.com/[\w@./]+"),
    lazy_regex!(r"(?:https?://)?(?:www\.)?vimeo\.com/\d+"),
    lazy_regex!(r"(?:https?://)?(?:www\.)?(?:dailymotion\.com|dai\.ly)/[\w/-]+"),
    lazy_regex!(r"(?:https?://)?(?:www\.)?reddit\.com/r/\w+/comments/[\w/]+"),
];

/// Finds supported media URLs in free text.
///
/// A missing scheme is completed with `https://`; duplicates are dropped while
/// keeping first-seen order. Callers process at most [`MAX_URLS_PER_MESSAGE`].
///
/// # Example
///
/// ```
/// use mediagate::core::utils::extract_urls;
///
/// let urls = extract_urls("look: youtu.be/dQw4w9WgXcQ and https://vimeo.com/123");
/// assert_eq!(urls, vec!["https://youtu.be/dQw4w9WgXcQ", "https://vimeo.com/123"]);
/// ```
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = URL_PATTERNS
        .iter()
        .flat_map(|pattern| pattern.find_iter(text))
        .map(|m| {
            let url = m.as_str();
            let url = if url.starts_with("http") {
                url.to_string()
            } else {
                format!("https://{}", url)
            };
            (m.start(), url)
        })
        .collect();

    found.sort_by_key(|(pos, _)| *pos);

    let mut urls: Vec<String> = Vec::with_capacity(found.len());
    for (_, url) in found {
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}

/// Formats seconds as `H:MM:SS`, or `M:SS` under an hour.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

/// Formats a byte count as MB, switching to GB from 1024 MB (two decimals).
pub fn format_size(bytes: u64) -> String {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    if mb >= 1024.0 {
        format!("{:.2} GB", mb / 1024.0)
    } else {
        format!("{:.2} MB", mb)
    }
}

/// Whole megabytes for cost and size-limit comparisons.
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Truncates a string to at most `max_chars` characters, appending `...` when cut.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}
