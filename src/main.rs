use anyhow::{Context, Result};

use mediagate::cli::{self, Cli, Commands, FetchArgs};
use mediagate::core::{init_logger, log_startup_configuration, metrics, Settings};

/// Entry point for the command layer
///
/// # Errors
/// Returns an error if configuration or logging setup fails, or the command itself does.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logger(&settings.log_level, settings.log_file.as_deref())?;
    metrics::init_metrics();

    match cli.command {
        Commands::Fetch {
            url,
            quality,
            user,
            plan,
            credits,
            out,
            metrics,
            persist,
        } => {
            log_startup_configuration(&settings);
            cli::run_fetch(
                &settings,
                FetchArgs {
                    url,
                    quality,
                    user,
                    plan,
                    credits,
                    out,
                    metrics,
                    persist,
                },
            )
            .await
        }
        Commands::Plans => {
            cli::print_plans(&settings);
            Ok(())
        }
    }
}
