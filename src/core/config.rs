//! Runtime settings.
//!
//! Loaded once at startup: built-in defaults, then an optional TOML file, then
//! `MEDIAGATE_*` environment variables. Invalid settings are fatal.

use crate::core::error::{AppError, AppResult};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "mediagate.toml";

/// Environment variable prefix (`MEDIAGATE_DOWNLOAD_WORKERS=4`)
pub const ENV_PREFIX: &str = "MEDIAGATE_";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root for per-download temp directories
    pub download_dir: PathBuf,
    pub download_workers: usize,
    pub upload_workers: usize,
    /// Capacity of each pipeline queue
    pub queue_capacity: usize,
    /// Hard ceiling on any file, regardless of plan
    pub max_file_size_mb: u32,
    /// Configured chunk size for the chunked upload path
    pub chunk_size_mb: u64,
    /// Base delay between chunk attempts, doubled per attempt
    pub chunk_retry_base_ms: u64,
    /// Pause a worker takes after a failed task
    pub worker_backoff_ms: u64,
    /// Minimum gap between two progress emissions
    pub progress_interval_secs: u64,

    pub rate_limit_per_minute: u32,
    pub rate_limit_per_hour: u32,
    pub rate_limit_per_day: u32,

    pub free_daily_downloads: u32,
    pub free_max_file_size_mb: u32,
    pub free_wait_time_seconds: u64,

    /// Users that bypass rate limiting
    pub admin_ids: Vec<i64>,
    /// Channels a user must be a member of (`@name` or numeric id)
    pub required_channels: Vec<String>,
    pub check_subscription: bool,

    /// SQLite file used by `fetch --persist`
    pub database_path: PathBuf,
    /// In-memory cache is used when absent
    pub redis_url: Option<String>,
    /// For the teloxide collaborators (feature `telegram`); `fetch` delivers to a local directory
    pub bot_token: Option<SecretString>,

    pub ytdlp_bin: String,
    pub ffprobe_bin: String,
    pub ytdlp_timeout_secs: u64,

    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("/tmp/ytdl_downloads"),
            download_workers: 3,
            upload_workers: 3,
            queue_capacity: 1000,
            max_file_size_mb: 2048,
            chunk_size_mb: 20,
            chunk_retry_base_ms: 1000,
            worker_backoff_ms: 1000,
            progress_interval_secs: 2,
            rate_limit_per_minute: 10,
            rate_limit_per_hour: 50,
            rate_limit_per_day: 200,
            free_daily_downloads: 5,
            free_max_file_size_mb: 100,
            free_wait_time_seconds: 30,
            admin_ids: Vec::new(),
            required_channels: Vec::new(),
            check_subscription: true,
            database_path: PathBuf::from("mediagate.sqlite"),
            redis_url: None,
            bot_token: None,
            ytdlp_bin: "yt-dlp".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            ytdlp_timeout_secs: 240,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Serializable view of the defaults, used as the lowest figment layer.
/// `SecretString` deliberately does not implement `Serialize`, so the token is left out.
#[derive(Serialize)]
struct DefaultLayer {
    download_dir: PathBuf,
    download_workers: usize,
    upload_workers: usize,
    queue_capacity: usize,
    max_file_size_mb: u32,
    chunk_size_mb: u64,
    chunk_retry_base_ms: u64,
    worker_backoff_ms: u64,
    progress_interval_secs: u64,
    rate_limit_per_minute: u32,
    rate_limit_per_hour: u32,
    rate_limit_per_day: u32,
    free_daily_downloads: u32,
    free_max_file_size_mb: u32,
    free_wait_time_seconds: u64,
    admin_ids: Vec<i64>,
    required_channels: Vec<String>,
    check_subscription: bool,
    database_path: PathBuf,
    ytdlp_bin: String,
    ffprobe_bin: String,
    ytdlp_timeout_secs: u64,
    log_level: String,
}

impl From<Settings> for DefaultLayer {
    fn from(s: Settings) -> Self {
        Self {
            download_dir: s.download_dir,
            download_workers: s.download_workers,
            upload_workers: s.upload_workers,
            queue_capacity: s.queue_capacity,
            max_file_size_mb: s.max_file_size_mb,
            chunk_size_mb: s.chunk_size_mb,
            chunk_retry_base_ms: s.chunk_retry_base_ms,
            worker_backoff_ms: s.worker_backoff_ms,
            progress_interval_secs: s.progress_interval_secs,
            rate_limit_per_minute: s.rate_limit_per_minute,
            rate_limit_per_hour: s.rate_limit_per_hour,
            rate_limit_per_day: s.rate_limit_per_day,
            free_daily_downloads: s.free_daily_downloads,
            free_max_file_size_mb: s.free_max_file_size_mb,
            free_wait_time_seconds: s.free_wait_time_seconds,
            admin_ids: s.admin_ids,
            required_channels: s.required_channels,
            check_subscription: s.check_subscription,
            database_path: s.database_path,
            ytdlp_bin: s.ytdlp_bin,
            ffprobe_bin: s.ffprobe_bin,
            ytdlp_timeout_secs: s.ytdlp_timeout_secs,
            log_level: s.log_level,
        }
    }
}

impl Settings {
    /// Builds the layered figment without extracting it.
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let file = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        Figment::from(Serialized::defaults(DefaultLayer::from(Settings::default())))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Loads and validates settings.
    pub fn load(config_file: Option<&Path>) -> AppResult<Self> {
        let settings: Settings = Self::figment(config_file).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.download_workers == 0 {
            return Err(AppError::Configuration("download_workers must be at least 1".into()));
        }
        if self.upload_workers == 0 {
            return Err(AppError::Configuration("upload_workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(AppError::Configuration("queue_capacity must be at least 1".into()));
        }
        if self.chunk_size_mb == 0 {
            return Err(AppError::Configuration("chunk_size_mb must be at least 1".into()));
        }
        if self.progress_interval_secs == 0 {
            return Err(AppError::Configuration(
                "progress_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    pub fn chunk_retry_base(&self) -> Duration {
        Duration::from_millis(self.chunk_retry_base_ms)
    }

    pub fn worker_backoff(&self) -> Duration {
        Duration::from_millis(self.worker_backoff_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.download_workers, 3);
        assert_eq!(settings.chunk_size_bytes(), 20 * 1024 * 1024);
        assert_eq!(settings.progress_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_workers_is_a_configuration_error() {
        let settings = Settings {
            upload_workers: 0,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn test_layers_merge_file_then_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "custom.toml",
                r#"
                download_workers = 5
                admin_ids = [42]
                required_channels = ["@news"]
                "#,
            )?;
            jail.set_env("MEDIAGATE_DOWNLOAD_WORKERS", "7");
            jail.set_env("MEDIAGATE_BOT_TOKEN", "123:abc");

            let settings = Settings::load(Some(Path::new("custom.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(settings.download_workers, 7);
            assert_eq!(settings.upload_workers, 3);
            assert!(settings.is_admin(42));
            assert_eq!(settings.required_channels, vec!["@news".to_string()]);
            let token = settings.bot_token.as_ref().map(|t| t.expose_secret().to_string());
            assert_eq!(token.as_deref(), Some("123:abc"));
            Ok(())
        });
    }

    #[test]
    fn test_invalid_env_value_fails_to_load() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MEDIAGATE_QUEUE_CAPACITY", "0");
            assert!(Settings::load(None).is_err());
            Ok(())
        });
    }
}
