use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "profrank")]
#[command(about = "Professor ratings aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON API with the background refresh loop.
    Serve,
    /// Run one harvest now and exit.
    Refresh {
        /// Harvest even when the cached dataset is still fresh.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = profrank_sync::RefreshConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let state = profrank_web::state_from_config(&config).await?;
            let refresher = Arc::clone(&state.refresher);
            let interval = config.refresh_interval;
            let background =
                tokio::spawn(async move { refresher.run_periodic(interval).await });

            let port = profrank_web::port_from_env();
            tokio::select! {
                result = profrank_web::serve(state, port) => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                }
            }
            background.abort();
        }
        Commands::Refresh { force } => {
            let state = profrank_web::state_from_config(&config).await?;
            let outcome = if force {
                Some(state.refresher.run_once().await?)
            } else {
                state.refresher.run_if_stale().await?
            };
            match outcome {
                Some(outcome) => println!(
                    "refresh complete: run_id={} records={}",
                    outcome.run_id, outcome.total_records
                ),
                None => println!("dataset is fresh, nothing to do"),
            }
        }
    }

    Ok(())
}
