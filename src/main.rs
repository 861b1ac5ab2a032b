use std::sync::Arc;

use tracing::info;

use tutorbook::clock::SystemClock;
use tutorbook::config::Config;
use tutorbook::engine::Engine;
use tutorbook::notify::NotifyHub;
use tutorbook::sweeper::{self, SweepSettings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    tutorbook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(Engine::new(
        config.wal_path(),
        Arc::new(NotifyHub::new()),
        Arc::new(SystemClock),
        config.engine_settings(),
    )?);

    info!("tutorbook engine started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  utc offset: {}", config.utc_offset);
    info!("  negotiation ttl: {}h", config.negotiation_ttl_hours);
    info!("  lock ttl: {:?}", config.lock_ttl);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let sweeper = tokio::spawn(sweeper::run_sweeper(engine.clone(), SweepSettings::from(&config)));

    // Run until SIGTERM/ctrl-c, then compact so the next start replays little.
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutdown signal received, stopping sweeper");
    sweeper.abort();

    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("tutorbook stopped");
    Ok(())
}
