use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::core::config::Settings;
use crate::core::metrics;
use crate::core::plans::PlanRegistry;
use crate::core::utils::{extract_urls, format_size};
use crate::download::progress::ProgressEvent;
use crate::download::ytdlp::YtDlpEngine;
use crate::service::{Collaborators, FetchRequest, MediaService, Submission};
use crate::storage::{Cache, MemoryCache, MemoryStore, Persistence, RedisCache, SqliteStore, User};
use crate::upload::probe::FfprobeProbe;
use crate::upload::transport::LocalDirTransport;

#[derive(Parser)]
#[command(name = "mediagate")]
#[command(author, version, about = "Admission-controlled media download pipeline", long_about = None)]
pub struct Cli {
    /// Config file (defaults to ./mediagate.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download one URL through the full pipeline into a local directory
    Fetch {
        url: String,

        /// best, audio, or a height such as 720p
        #[arg(short, long, default_value = "best")]
        quality: String,

        /// User id the request is made for
        #[arg(long, default_value_t = 1)]
        user: i64,

        /// Plan of that user
        #[arg(long, default_value = "free")]
        plan: String,

        /// Starting credit balance
        #[arg(long, default_value_t = 0)]
        credits: i64,

        /// Where delivered files land
        #[arg(short, long, default_value = "./delivered")]
        out: PathBuf,

        /// Print Prometheus metrics when done
        #[arg(long)]
        metrics: bool,

        /// Keep users and downloads in the configured database instead of memory
        #[arg(long)]
        persist: bool,
    },

    /// Show the plan registry
    Plans,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Options of [`Commands::Fetch`].
pub struct FetchArgs {
    pub url: String,
    pub quality: String,
    pub user: i64,
    pub plan: String,
    pub credits: i64,
    pub out: PathBuf,
    pub metrics: bool,
    pub persist: bool,
}

/// Builds the store: SQLite at `database_path` when persisting, memory otherwise.
/// A persisted user keeps its plan and balance; the flags only seed new users.
async fn open_store(settings: &Settings, args: &FetchArgs) -> Result<Arc<dyn Persistence>> {
    let store: Arc<dyn Persistence> = if args.persist {
        let path = settings.database_path.clone();
        let store = tokio::task::spawn_blocking(move || SqliteStore::open(&path))
            .await
            .context("Database setup panicked")?
            .with_context(|| format!("Failed to open {}", settings.database_path.display()))?;
        Arc::new(store)
    } else {
        Arc::new(MemoryStore::new())
    };

    match store.get_user(args.user).await? {
        Some(user) => log::info!(
            "Using stored user {} on plan {} with {} credits",
            user.id,
            user.plan,
            user.credits
        ),
        None => store
            .create_user(User::new(args.user).with_plan(&args.plan, args.credits))
            .await
            .context("Failed to create user")?,
    }
    Ok(store)
}

/// Redis when `redis_url` is set, memory otherwise.
async fn open_cache(settings: &Settings) -> Result<Arc<dyn Cache>> {
    match &settings.redis_url {
        Some(url) => {
            let cache = RedisCache::connect(url).await.context("Failed to connect to Redis")?;
            Ok(Arc::new(cache))
        }
        None => Ok(Arc::new(MemoryCache::new())),
    }
}

/// Runs one request through yt-dlp into a local directory.
pub async fn run_fetch(settings: &Settings, args: FetchArgs) -> Result<()> {
    let store = open_store(settings, &args).await?;
    let cache = open_cache(settings).await?;
    let url = extract_urls(&args.url).into_iter().next().unwrap_or(args.url);

    let collaborators = Collaborators::builder()
        .store(store.clone())
        .cache(cache)
        .engine(Arc::new(YtDlpEngine::new(
            settings.ytdlp_bin.clone(),
            Duration::from_secs(settings.ytdlp_timeout_secs),
        )))
        .transport(Arc::new(LocalDirTransport::new(&args.out)))
        .probe(Arc::new(FfprobeProbe::new(settings.ffprobe_bin.clone())))
        .build();
    let service = MediaService::start(settings, collaborators);

    let (progress_tx, progress_rx) = mpsc::channel(32);
    let printer = tokio::spawn(print_progress(progress_rx));

    let request = FetchRequest::builder()
        .user_id(args.user)
        .url(url.as_str())
        .quality(args.quality)
        .progress_sink(progress_tx)
        .build();

    let submission = service.submit(request).await.context("Failed to submit download")?;
    let (download_id, handle) = match submission {
        Submission::Queued {
            download_id, handle, ..
        } => (download_id, handle),
        Submission::Denied(reason) => {
            service.shutdown().await;
            bail!("Request denied: {}", reason);
        }
    };
    println!("Queued download {} for {}", download_id, url);

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("Interrupted, cancelling download {}", download_id);
            service.cancel(download_id, args.user).await?;
            match service.subscribe(download_id).await {
                Some(handle) => handle.wait().await,
                None => None,
            }
        }
    };

    service.shutdown().await;
    if tokio::time::timeout(Duration::from_secs(5), printer).await.is_err() {
        log::debug!("Progress printer still running at exit");
    }

    let record = store.get_download(download_id).await?;
    match (outcome, record) {
        (Some(outcome), Some(record)) if outcome.is_success() => {
            println!(
                "Completed: {} ({}) -> {}",
                record.title.unwrap_or_default(),
                format_size(record.file_size.unwrap_or(0)),
                outcome.file_id.unwrap_or_default()
            );
            let balance = service.ledger().balance(args.user).await?;
            println!("Credits left: {}", balance);
        }
        (Some(outcome), _) => {
            println!(
                "Download {} ended {}: {}",
                download_id,
                outcome.status,
                outcome.error.unwrap_or_default()
            );
        }
        (None, _) => println!("Download {} outcome is unknown", download_id),
    }

    if args.metrics {
        print!("{}", metrics::render());
    }
    Ok(())
}

async fn print_progress(mut rx: mpsc::Receiver<ProgressEvent>) {
    while let Some(event) = rx.recv().await {
        println!(
            "[{:?}] {:5.1}% {}/{} at {}/s, eta {}s",
            event.phase,
            event.percentage,
            format_size(event.downloaded),
            format_size(event.total),
            format_size(event.speed as u64),
            event.eta
        );
    }
}

pub fn print_plans(settings: &Settings) {
    let plans = PlanRegistry::from_settings(settings);
    println!(
        "{:<10} {:>8} {:>8} {:>6} {:>10} {:>8} {:>10} {:>8}",
        "plan", "daily", "max MB", "wait", "concurrent", "credits", "multiplier", "price"
    );
    for plan in plans.iter() {
        println!(
            "{:<10} {:>8} {:>8} {:>6} {:>10} {:>8} {:>10.1} {:>8}",
            plan.id.to_string(),
            plan.daily_downloads
                .map(|d| d.to_string())
                .unwrap_or_else(|| "∞".to_string()),
            plan.max_file_size_mb,
            plan.wait_time_secs,
            plan.concurrent_downloads,
            plan.credits.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
            plan.cost_multiplier,
            plan.price.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_arguments() {
        let cli = Cli::try_parse_from([
            "mediagate",
            "--config",
            "custom.toml",
            "fetch",
            "https://youtu.be/abc",
            "-q",
            "720p",
            "--plan",
            "basic",
            "--credits",
            "10",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        match cli.command {
            Commands::Fetch {
                url,
                quality,
                user,
                plan,
                credits,
                ..
            } => {
                assert_eq!(url, "https://youtu.be/abc");
                assert_eq!(quality, "720p");
                assert_eq!(user, 1);
                assert_eq!(plan, "basic");
                assert_eq!(credits, 10);
            }
            Commands::Plans => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_plans_subcommand() {
        let cli = Cli::try_parse_from(["mediagate", "plans"]).unwrap();
        assert!(matches!(cli.command, Commands::Plans));
    }

    fn fetch_args(persist: bool, credits: i64) -> FetchArgs {
        FetchArgs {
            url: "https://youtu.be/abc".to_string(),
            quality: "best".to_string(),
            user: 3,
            plan: "basic".to_string(),
            credits,
            out: PathBuf::from("delivered"),
            metrics: false,
            persist,
        }
    }

    #[tokio::test]
    async fn test_persisted_user_survives_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            database_path: dir.path().join("mediagate.sqlite"),
            ..Settings::default()
        };

        let store = open_store(&settings, &fetch_args(true, 10)).await.unwrap();
        store.update_user(3, crate::storage::UserUpdate::credits(4)).await.unwrap();
        drop(store);

        // the flags only seed a user that is not stored yet
        let store = open_store(&settings, &fetch_args(true, 10)).await.unwrap();
        assert_eq!(store.get_user(3).await.unwrap().unwrap().credits, 4);
        assert!(settings.database_path.exists());
    }

    #[tokio::test]
    async fn test_memory_store_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            database_path: dir.path().join("unused.sqlite"),
            ..Settings::default()
        };

        let store = open_store(&settings, &fetch_args(false, 7)).await.unwrap();
        assert_eq!(store.get_user(3).await.unwrap().unwrap().credits, 7);
        assert!(!settings.database_path.exists());
    }
}
