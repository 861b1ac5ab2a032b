use std::collections::HashMap;

use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_disjoint, check_slot_free, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// Reserve every slot for `student_id` or none of them.
    pub async fn acquire_slot_locks(
        &self,
        tutor_id: Ulid,
        slots: &[Span],
        student_id: Ulid,
        ttl_ms: Option<Ms>,
    ) -> Result<Vec<Ulid>, EngineError> {
        let cal = self.store.calendar(tutor_id);
        let mut guard = cal.write().await;
        let now = self.now();
        self.lock_slots(&mut guard, slots, student_id, ttl_ms, now).await
    }

    /// Conditional insert under a held calendar guard.
    pub(super) async fn lock_slots(
        &self,
        cal: &mut TutorCalendar,
        slots: &[Span],
        student_id: Ulid,
        ttl_ms: Option<Ms>,
        now: Ms,
    ) -> Result<Vec<Ulid>, EngineError> {
        if slots.is_empty() {
            return Err(EngineError::Validation("no slots to lock".into()));
        }
        if slots.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("too many slots in one call"));
        }
        for slot in slots {
            validate_span(slot)?;
        }
        check_disjoint(slots)?;
        let ttl = ttl_ms.unwrap_or(self.settings.lock_ttl_ms);
        if ttl <= 0 {
            return Err(EngineError::Validation("lock ttl must be positive".into()));
        }

        for slot in slots {
            if let Err(e) = check_slot_free(cal, slot, student_id, &[], now) {
                metrics::counter!(crate::observability::LOCK_CONFLICTS_TOTAL).increment(1);
                return Err(e);
            }
        }

        let locks: Vec<SlotLock> = slots
            .iter()
            .map(|span| SlotLock {
                id: Ulid::new(),
                tutor_id: cal.tutor_id,
                span: *span,
                student_id,
                locked_at: now,
                expires_at: now + ttl,
            })
            .collect();
        let ids = locks.iter().map(|l| l.id).collect();

        let event = Event::LocksAcquired {
            tutor_id: cal.tutor_id,
            locks,
        };
        self.persist_and_apply(cal, &event).await?;
        Ok(ids)
    }

    /// Unknown or already released ids are ignored. Returns how many were released.
    pub async fn release_slot_locks(&self, lock_ids: &[Ulid]) -> Result<usize, EngineError> {
        let mut by_tutor: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for id in lock_ids {
            if let Some(lock) = self.store.locks.get(id) {
                by_tutor.entry(lock.tutor_id).or_default().push(*id);
            }
        }

        let mut released = 0;
        for (tutor_id, ids) in by_tutor {
            let cal = self.store.calendar(tutor_id);
            let mut guard = cal.write().await;
            released += self.unlock(&mut guard, &ids).await?;
        }
        Ok(released)
    }

    /// Release under a held guard; filters to locks still present.
    pub(super) async fn unlock(
        &self,
        cal: &mut TutorCalendar,
        lock_ids: &[Ulid],
    ) -> Result<usize, EngineError> {
        let ids: Vec<Ulid> = lock_ids
            .iter()
            .filter(|id| {
                self.store
                    .locks
                    .get(*id)
                    .is_some_and(|l| l.tutor_id == cal.tutor_id)
            })
            .copied()
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        let event = Event::LocksReleased {
            tutor_id: cal.tutor_id,
            ids,
        };
        self.persist_and_apply(cal, &event).await?;
        Ok(count)
    }

    /// Drop locks with `expires_at <= now`. Readers already ignore them.
    pub async fn purge_expired_locks(&self) -> Result<usize, EngineError> {
        let now = self.now();
        let mut by_tutor: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for entry in self.store.locks.iter() {
            if entry.expires_at <= now {
                by_tutor.entry(entry.tutor_id).or_default().push(entry.id);
            }
        }

        let mut purged = 0;
        for (tutor_id, ids) in by_tutor {
            let cal = self.store.calendar(tutor_id);
            let mut guard = cal.write().await;
            let n = self.unlock(&mut guard, &ids).await?;
            debug!("purged {n} expired locks for tutor {tutor_id}");
            purged += n;
        }
        if purged > 0 {
            metrics::counter!(crate::observability::LOCKS_PURGED_TOTAL).increment(purged as u64);
        }
        Ok(purged)
    }

    /// Live locks on a tutor's calendar.
    pub async fn list_slot_locks(&self, tutor_id: Ulid) -> Vec<SlotLock> {
        let now = self.now();
        let cal = self.store.calendar(tutor_id);
        let guard = cal.read().await;
        guard
            .locks()
            .filter(|e| e.is_live(now))
            .filter_map(|e| self.store.locks.get(&e.id).map(|l| l.value().clone()))
            .collect()
    }
}
