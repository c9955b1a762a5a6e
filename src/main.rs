use anyhow::Context;
use collector::Scheduler;
use database::Database;
use reddimon_core::AppConfig;
use reddit_client::{ClientOptions, RedditClient, RedditCredentials};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "reddimon=info,collector=info,reddit_client=info,database=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    tracing::info!("Starting Reddimon - subreddit activity collector");

    let config = AppConfig::load().context("failed to load configuration")?;

    let credentials = RedditCredentials::from_settings(&config.reddit, &config.user_agent())
        .context("Reddit credentials are incomplete")?;
    let reddit = Arc::new(
        RedditClient::new(credentials, ClientOptions::from_config(&config))
            .context("failed to build Reddit client")?,
    );

    let db = Arc::new(
        Database::connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open {}", config.database_url))?,
    );
    db.run_migrations().await.context("failed to run migrations")?;

    let scheduler = Scheduler::new(reddit.clone(), db.clone(), db.clone(), config.collector.clone());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received Ctrl-C, shutting down");
                    shutdown.cancel();
                }
                Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
            }
        }
    });

    scheduler.run(shutdown).await;

    let queue = reddit.queue_stats();
    let retries = reddit.retry_metrics();
    tracing::info!(
        completed = queue.completed,
        failed = queue.failed,
        pending = queue.pending,
        retries = retries.total_retries,
        "Reddit request totals"
    );
    db.close().await;

    Ok(())
}
