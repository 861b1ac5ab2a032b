use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── Negotiation ─────────────────────────────────────────────────

/// Counter: booking requests created.
pub const REQUESTS_CREATED_TOTAL: &str = "tutorbook_requests_created_total";

/// Counter: booking requests leaving Pending. Labels: outcome.
pub const REQUESTS_RESOLVED_TOTAL: &str = "tutorbook_requests_resolved_total";

// ── Locks & allocation ──────────────────────────────────────────

/// Counter: lock attempts that hit a held slot.
pub const LOCK_CONFLICTS_TOTAL: &str = "tutorbook_lock_conflicts_total";

/// Counter: expired locks removed by the sweeper.
pub const LOCKS_PURGED_TOTAL: &str = "tutorbook_locks_purged_total";

/// Counter: sessions created.
pub const SESSIONS_ALLOCATED_TOTAL: &str = "tutorbook_sessions_allocated_total";

/// Counter: allocation batches rejected at the final check.
pub const ALLOCATION_FAILURES_TOTAL: &str = "tutorbook_allocation_failures_total";

// ── Session lifecycle ───────────────────────────────────────────

pub const SESSIONS_CANCELLED_TOTAL: &str = "tutorbook_sessions_cancelled_total";

/// Counter: cancellations inside the module cutoff.
pub const LATE_CANCELLATIONS_TOTAL: &str = "tutorbook_late_cancellations_total";

pub const SESSIONS_ACTIVATED_TOTAL: &str = "tutorbook_sessions_activated_total";
pub const SESSIONS_COMPLETED_TOTAL: &str = "tutorbook_sessions_completed_total";

// ── Sweeper & WAL ───────────────────────────────────────────────

/// Histogram: one sweep pass in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "tutorbook_sweep_duration_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tutorbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tutorbook_wal_flush_batch_size";

pub const WAL_COMPACTIONS_TOTAL: &str = "tutorbook_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
