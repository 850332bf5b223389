use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use beacon_common::clock::SystemClock;
use beacon_common::config::AppConfig;
use beacon_common::db;
use beacon_engine::retention::{self, RetentionManager, RetentionPolicy};
use beacon_engine::store::PgStore;

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    /// One archival pass, then exit.
    Once,
    /// Archive on a fixed interval until interrupted.
    Scheduled,
}

fn parse_mode(args: impl IntoIterator<Item = String>) -> anyhow::Result<Mode> {
    let mut mode = Mode::Scheduled;
    for arg in args {
        match arg.as_str() {
            "--once" => mode = Mode::Once,
            other => anyhow::bail!("unknown argument '{other}' (expected --once)"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_archiver=info,beacon_engine=info".into()),
        )
        .json()
        .init();

    let mode = parse_mode(std::env::args().skip(1))?;
    tracing::info!(?mode, "Beacon archiver starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations applied");

    let manager = Arc::new(RetentionManager::new(
        Arc::new(PgStore::new(pool)),
        RetentionPolicy::from_config(&config),
        Arc::new(SystemClock),
    ));

    if mode == Mode::Once {
        let summary = manager.run_once().await?;
        tracing::info!(
            attempts = summary.attempts_archived,
            notifications = summary.notifications_archived,
            "Single archival pass finished"
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let job = tokio::spawn(retention::run(
        manager,
        Duration::from_secs(config.archive_interval_secs),
        cancel.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    cancel.cancel();
    job.await?;

    tracing::info!("Beacon archiver stopped.");
    Ok(())
}
