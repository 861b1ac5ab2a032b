use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{Engine, EngineError};
use crate::model::Ms;

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub interval: Duration,
    pub activation_window: Duration,
    /// Compact once this many records were appended since the last compaction.
    pub compact_threshold: u64,
}

impl From<&Config> for SweepSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.sweep_interval,
            activation_window: config.activation_window,
            compact_threshold: config.compact_threshold,
        }
    }
}

/// What one pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_requests: usize,
    pub purged_locks: usize,
    pub activated_sessions: usize,
    pub completed_sessions: usize,
    pub compacted: bool,
}

/// One pass: expire stale requests, purge dead locks, activate due sessions,
/// complete elapsed ones, then compact the WAL once it has grown past the
/// threshold.
pub async fn sweep_once(engine: &Engine, settings: &SweepSettings) -> Result<SweepReport, EngineError> {
    let started = Instant::now();
    let mut report = SweepReport {
        expired_requests: engine.expire_stale_requests().await?.len(),
        purged_locks: engine.purge_expired_locks().await?,
        activated_sessions: engine
            .activate_due_sessions(settings.activation_window.as_millis() as Ms)
            .await?
            .len(),
        completed_sessions: engine.complete_elapsed_sessions().await?.len(),
        compacted: false,
    };

    if settings.compact_threshold > 0
        && engine.wal_appends_since_compact().await >= settings.compact_threshold
    {
        engine.compact_wal().await?;
        report.compacted = true;
    }

    metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    Ok(report)
}

/// The scheduler loop the daemon spawns; the engine itself owns no timers.
pub async fn run_sweeper(engine: Arc<Engine>, settings: SweepSettings) {
    let mut interval = tokio::time::interval(settings.interval);
    info!("sweeper running every {:?}", settings.interval);
    loop {
        interval.tick().await;
        match sweep_once(&engine, &settings).await {
            Ok(report) if report != SweepReport::default() => info!("sweep: {report:?}"),
            Ok(_) => debug!("sweep: nothing to do"),
            Err(e) => warn!("sweep failed: {e}"),
        }
    }
}
