//! Prometheus metrics for the download/upload pipelines
//!
//! Tracks:
//! - Download outcomes and extraction duration
//! - Upload outcomes by strategy, including direct-to-chunked fallbacks
//! - Queue depth per pipeline
//! - Credits debited/refunded and admission denials

// Metric definitions are static; registration only fails on duplicate names.
#![allow(clippy::expect_used)]

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_counter, register_int_counter_vec,
    CounterVec, GaugeVec, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

// ======================
// PIPELINE METRICS
// ======================

/// Downloads reaching a terminal status
/// Labels: status (completed/failed/cancelled)
pub static DOWNLOADS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mediagate_downloads_total",
        "Downloads reaching a terminal status",
        &["status"]
    )
    .expect("mediagate_downloads_total")
});

/// Extraction duration in seconds
/// Labels: platform (youtube/tiktok/etc)
pub static DOWNLOAD_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "mediagate_download_duration_seconds",
        "Time spent in the extraction engine",
        &["platform"],
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    )
    .expect("mediagate_download_duration_seconds")
});

/// Upload outcomes
/// Labels: strategy (direct/chunked), outcome (success/failure/fallback)
pub static UPLOADS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mediagate_uploads_total",
        "Upload attempts by strategy and outcome",
        &["strategy", "outcome"]
    )
    .expect("mediagate_uploads_total")
});

/// Tasks waiting in each pipeline queue
/// Labels: pipeline (download/upload)
pub static QUEUE_DEPTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "mediagate_queue_depth",
        "Tasks waiting in each pipeline queue",
        &["pipeline"]
    )
    .expect("mediagate_queue_depth")
});

/// Worker failures caught at the task boundary
pub static WORKER_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "mediagate_worker_failures_total",
        "Task failures caught by pipeline workers"
    )
    .expect("mediagate_worker_failures_total")
});

// ======================
// BUSINESS METRICS
// ======================

/// Credits moved by the ledger
/// Labels: direction (debited/credited/refunded)
pub static CREDITS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "mediagate_credits_total",
        "Credits moved by the ledger",
        &["direction"]
    )
    .expect("mediagate_credits_total")
});

/// Admission denials
/// Labels: reason
pub static ADMISSION_DENIALS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mediagate_admission_denials_total",
        "Download requests denied at admission",
        &["reason"]
    )
    .expect("mediagate_admission_denials_total")
});

/// Forces registration of every metric so they appear in scrapes before first use
pub fn init_metrics() {
    Lazy::force(&DOWNLOADS_TOTAL);
    Lazy::force(&DOWNLOAD_DURATION_SECONDS);
    Lazy::force(&UPLOADS_TOTAL);
    Lazy::force(&QUEUE_DEPTH);
    Lazy::force(&WORKER_FAILURES_TOTAL);
    Lazy::force(&CREDITS_TOTAL);
    Lazy::force(&ADMISSION_DENIALS_TOTAL);
    log::debug!("Metrics registered");
}

pub fn record_download_terminal(status: &str) {
    DOWNLOADS_TOTAL.with_label_values(&[status]).inc();
}

pub fn observe_download_duration(url: &str, seconds: f64) {
    DOWNLOAD_DURATION_SECONDS
        .with_label_values(&[extract_platform(url)])
        .observe(seconds);
}

pub fn record_upload(strategy: &str, outcome: &str) {
    UPLOADS_TOTAL.with_label_values(&[strategy, outcome]).inc();
}

pub fn update_queue_depth(pipeline: &str, depth: usize) {
    QUEUE_DEPTH.with_label_values(&[pipeline]).set(depth as f64);
}

pub fn record_worker_failure() {
    WORKER_FAILURES_TOTAL.inc();
}

pub fn record_credits(direction: &str, amount: i64) {
    CREDITS_TOTAL.with_label_values(&[direction]).inc_by(amount as f64);
}

pub fn record_admission_denial(reason: &str) {
    ADMISSION_DENIALS_TOTAL.with_label_values(&[reason]).inc();
}

/// Every registered metric in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&prometheus::gather()) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Failed to encode metrics: {}", e);
            String::new()
        }
    }
}

/// Extract platform from URL for metric labels
pub fn extract_platform(url: &str) -> &'static str {
    let url_lower = url.to_lowercase();
    if url_lower.contains("youtube.com") || url_lower.contains("youtu.be") {
        "youtube"
    } else if url_lower.contains("tiktok.com") {
        "tiktok"
    } else if url_lower.contains("instagram.com") {
        "instagram"
    } else if url_lower.contains("twitter.com") || url_lower.contains("x.com") {
        "twitter"
    } else if url_lower.contains("facebook.com") || url_lower.contains("fb.watch") {
        "facebook"
    } else if url_lower.contains("vimeo.com") {
        "vimeo"
    } else if url_lower.contains("dailymotion.com") {
        "dailymotion"
    } else if url_lower.contains("reddit.com") {
        "reddit"
    } else {
        "other"
    }
}
