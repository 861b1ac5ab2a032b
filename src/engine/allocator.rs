use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_slot_free, validate_span};
use super::{Engine, EngineError, StateError};

/// One all-or-nothing batch of sessions for a (tutor, student, module).
#[derive(Debug, Clone)]
pub struct Allocation {
    pub booking_request_id: Option<Ulid>,
    pub tutor_id: Ulid,
    pub student_id: Ulid,
    pub module_id: Ulid,
    pub slots: Vec<Span>,
    /// Locks taken for these slots; released whatever the outcome.
    pub lock_ids: Vec<Ulid>,
}

impl Engine {
    /// Final guard before sessions exist: re-verify every slot against the
    /// tutor's calendar and commit the whole batch as one WAL record.
    pub async fn allocate(&self, allocation: Allocation) -> Result<Vec<Session>, EngineError> {
        let cal = self.store.calendar(allocation.tutor_id);
        let mut guard = cal.write().await;
        let now = self.now();

        let staged = match self.stage_sessions(&guard, &allocation, now) {
            Ok(staged) => staged,
            Err(e) => {
                metrics::counter!(crate::observability::ALLOCATION_FAILURES_TOTAL).increment(1);
                warn!(
                    "allocation for tutor {} rejected: {e}",
                    allocation.tutor_id
                );
                if let Err(release_err) = self.unlock(&mut guard, &allocation.lock_ids).await {
                    warn!("lock release after failed allocation: {release_err}");
                }
                return Err(e);
            }
        };

        let event = Event::SessionsAllocated {
            tutor_id: allocation.tutor_id,
            booking_request_id: allocation.booking_request_id,
            sessions: staged.clone(),
            at: now,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            metrics::counter!(crate::observability::ALLOCATION_FAILURES_TOTAL).increment(1);
            if let Err(release_err) = self.unlock(&mut guard, &allocation.lock_ids).await {
                warn!("lock release after failed commit: {release_err}");
            }
            return Err(e);
        }
        self.unlock(&mut guard, &allocation.lock_ids).await?;

        metrics::counter!(crate::observability::SESSIONS_ALLOCATED_TOTAL)
            .increment(staged.len() as u64);
        info!(
            "allocated {} sessions for tutor {} student {}",
            staged.len(),
            allocation.tutor_id,
            allocation.student_id
        );
        Ok(staged)
    }

    /// Phase 1 of `allocate`: validate everything, touch nothing.
    fn stage_sessions(
        &self,
        cal: &TutorCalendar,
        allocation: &Allocation,
        now: Ms,
    ) -> Result<Vec<Session>, EngineError> {
        if allocation.slots.is_empty() {
            return Err(EngineError::Validation("allocation has no slots".into()));
        }
        if allocation.slots.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        if allocation.student_id == allocation.tutor_id {
            return Err(EngineError::Validation("student and tutor must differ".into()));
        }

        if let Some(request_id) = allocation.booking_request_id {
            let request = self
                .store
                .requests
                .get(&request_id)
                .map(|r| r.value().clone())
                .ok_or(EngineError::NotFound(request_id))?;
            if request.tutor_id != allocation.tutor_id {
                return Err(EngineError::NotFound(request_id));
            }
            if request.status != RequestStatus::Pending {
                return Err(StateError::AlreadyResolved(request.status).into());
            }
            if request.is_expired(now) {
                return Err(StateError::Expired.into());
            }
        }

        let mut slots = allocation.slots.clone();
        slots.sort_by_key(|s| s.start);

        let mut staged: Vec<Session> = Vec::with_capacity(slots.len());
        for slot in &slots {
            validate_span(slot)?;
            check_slot_free(cal, slot, allocation.student_id, &allocation.lock_ids, now)?;
            if let Some(clash) = staged.iter().find(|s| s.span.overlaps(slot)) {
                return Err(EngineError::Conflict {
                    slot: *slot,
                    holder: clash.id,
                });
            }
            staged.push(Session {
                id: Ulid::new(),
                booking_request_id: allocation.booking_request_id,
                student_id: allocation.student_id,
                tutor_id: allocation.tutor_id,
                module_id: allocation.module_id,
                room_id: None,
                span: *slot,
                status: SessionStatus::Confirmed,
                cancellation: None,
                created_at: now,
                updated_at: now,
            });
        }
        Ok(staged)
    }

    /// Admin path: a single session without negotiation, still through the
    /// allocator's overlap check.
    pub async fn create_session_direct(
        &self,
        student_id: Ulid,
        tutor_id: Ulid,
        module_id: Ulid,
        span: Span,
    ) -> Result<Session, EngineError> {
        let mut sessions = self
            .allocate(Allocation {
                booking_request_id: None,
                tutor_id,
                student_id,
                module_id,
                slots: vec![span],
                lock_ids: Vec::new(),
            })
            .await?;
        sessions
            .pop()
            .ok_or_else(|| EngineError::Validation("allocation produced no session".into()))
    }
}
