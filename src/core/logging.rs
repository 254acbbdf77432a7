//! Logger initialization
//!
//! Library code logs through the `log` facade; this installs a
//! `tracing-subscriber` registry (console + optional file) and bridges `log`
//! records into it.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::core::config::Settings;

/// Initialize logger for console and, when `log_file` is set, file output
///
/// `RUST_LOG` overrides `level` when present.
pub fn init_logger(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level: {}", level))?;

    let file_layer = match log_file {
        Some(path) => {
            let file = fs_err::File::create(path).context("Failed to create log file")?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Arc::new(file.into_parts().0)),
            )
        }
        None => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer);

    tracing_log::LogTracer::init().context("Failed to bridge log records")?;
    tracing::subscriber::set_global_default(subscriber).context("Failed to initialize logger")?;

    Ok(())
}

/// Logs the effective settings at startup, secrets redacted
pub fn log_startup_configuration(settings: &Settings) {
    log::info!("Starting mediagate {}", env!("CARGO_PKG_VERSION"));
    log::info!(
        "Workers: {} download / {} upload, queue capacity {}",
        settings.download_workers,
        settings.upload_workers,
        settings.queue_capacity
    );
    log::info!("Download directory: {}", settings.download_dir.display());
    log::info!(
        "Rate limits: {}/min, {}/hour, {}/day",
        settings.rate_limit_per_minute,
        settings.rate_limit_per_hour,
        settings.rate_limit_per_day
    );

    if settings.check_subscription && !settings.required_channels.is_empty() {
        log::info!("Required channels: {}", settings.required_channels.join(", "));
    }

    match &settings.redis_url {
        Some(_) => log::info!("Cache: redis"),
        None => log::warn!("Cache: in-memory (MEDIAGATE_REDIS_URL not set)"),
    }

    if settings.bot_token.is_none() {
        log::warn!("Bot token not set, Telegram transport unavailable");
    }
}
