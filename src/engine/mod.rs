mod allocator;
mod availability;
mod cancellation;
mod conflict;
mod error;
mod locks;
mod matcher;
mod mutations;
mod negotiation;
mod queries;
mod slots;
mod store;

pub use allocator::Allocation;
pub use availability::{merge_overlapping, resolve_availability, subtract_intervals};
pub use error::{EngineError, StateError};
pub use matcher::{filter_slots, slot_matches};
pub use slots::{evaluate_slots, generate_slots, slot_grid, SlotQuery};
pub use store::Store;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, Offset, Utc};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCalendar = Arc<RwLock<TutorCalendar>>;

/// Engine-wide policy that is not per module.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Offset all calendar reasoning happens in.
    pub reference_offset: FixedOffset,
    pub negotiation_ttl_ms: Ms,
    pub lock_ttl_ms: Ms,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            reference_offset: Utc.fix(),
            negotiation_ttl_ms: 7 * DAY_MS,
            lock_ttl_ms: 60_000,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have first, then run the other command.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
    /// Commits hold it shared; compaction holds it exclusively so the
    /// snapshot and the log swap see the same set of events.
    commit_gate: RwLock<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::new();
        store.replay(&events);
        if !events.is_empty() {
            info!("replayed {} events from {}", events.len(), wal_path.display());
        }

        Ok(Self {
            store,
            wal_tx,
            notify,
            clock,
            settings,
            commit_gate: RwLock::new(()),
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(super) fn tz(&self) -> &FixedOffset {
        &self.settings.reference_offset
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify. The caller holds the tutor's calendar guard.
    pub(super) async fn persist_and_apply(
        &self,
        cal: &mut TutorCalendar,
        event: &Event,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(event).await?;
        self.store.apply_event(event, Some(cal));
        self.notify.publish(&self.store.participants(event), event);
        Ok(())
    }

    /// Same as `persist_and_apply` for events that touch no calendar.
    pub(super) async fn persist_unscoped(&self, event: &Event) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(event).await?;
        self.store.apply_event(event, None);
        self.notify.publish(&self.store.participants(event), event);
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.store.snapshot_events();
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
