use std::collections::HashMap;

use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, StateError};

impl Engine {
    /// Cancel a Confirmed or InProgress session. Inside the module's cutoff
    /// the cancellation still goes through but is flagged late.
    pub async fn cancel_session(
        &self,
        session_id: Ulid,
        actor_id: Ulid,
        reason: &str,
    ) -> Result<Session, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let tutor_id = self.session_tutor(session_id)?;
        let cal = self.store.calendar(tutor_id);
        let mut guard = cal.write().await;
        let now = self.now();

        let session = self.get_session(session_id).ok_or(EngineError::NotFound(session_id))?;
        if !session.involves(actor_id) {
            return Err(EngineError::Forbidden(actor_id));
        }
        if !session.status.is_active() {
            return Err(StateError::InvalidTransition {
                from: session.status,
                to: SessionStatus::Cancelled,
            }
            .into());
        }

        let cutoff = self
            .store
            .module_preference(tutor_id, session.module_id)
            .cancellation_cutoff_ms();
        let late = session.span.start - now < cutoff;

        let event = Event::SessionCancelled {
            id: session_id,
            tutor_id,
            cancellation: Cancellation {
                by: actor_id,
                at: now,
                reason: reason.to_string(),
                late,
            },
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(crate::observability::SESSIONS_CANCELLED_TOTAL).increment(1);
        if late {
            metrics::counter!(crate::observability::LATE_CANCELLATIONS_TOTAL).increment(1);
            let hours_left = (session.span.start - now) as f64 / HOUR_MS as f64;
            warn!(
                "late cancellation of session {session_id} by {actor_id}: {hours_left:.1}h before start"
            );
        } else {
            info!("session {session_id} cancelled by {actor_id}");
        }
        self.get_session(session_id).ok_or(EngineError::NotFound(session_id))
    }

    /// Confirmed → InProgress.
    pub async fn start_session(&self, session_id: Ulid) -> Result<Session, EngineError> {
        self.transition_session(session_id, SessionStatus::Confirmed, SessionStatus::InProgress)
            .await
    }

    /// InProgress → Completed. Frees the tutor's time axis.
    pub async fn complete_session(&self, session_id: Ulid) -> Result<Session, EngineError> {
        self.transition_session(session_id, SessionStatus::InProgress, SessionStatus::Completed)
            .await
    }

    /// Move Confirmed sessions starting by `now + window_ms` (and not yet
    /// over) to InProgress. Returns the sessions it activated.
    pub async fn activate_due_sessions(&self, window_ms: Ms) -> Result<Vec<Session>, EngineError> {
        let now = self.now();
        let mut by_tutor: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for s in self.store.sessions.iter() {
            if s.status == SessionStatus::Confirmed
                && s.span.start <= now + window_ms
                && s.span.end > now
            {
                by_tutor.entry(s.tutor_id).or_default().push(s.id);
            }
        }

        let mut activated = Vec::new();
        for (tutor_id, ids) in by_tutor {
            let cal = self.store.calendar(tutor_id);
            let mut guard = cal.write().await;
            for id in ids {
                let still_due = self
                    .store
                    .sessions
                    .get(&id)
                    .is_some_and(|s| s.status == SessionStatus::Confirmed);
                if !still_due {
                    continue;
                }
                let event = Event::SessionStatusChanged {
                    id,
                    tutor_id,
                    status: SessionStatus::InProgress,
                    at: now,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                activated.extend(self.get_session(id));
            }
        }

        if !activated.is_empty() {
            metrics::counter!(crate::observability::SESSIONS_ACTIVATED_TOTAL)
                .increment(activated.len() as u64);
            info!("activated {} due sessions", activated.len());
        }
        activated.sort_by_key(|s| s.span.start);
        Ok(activated)
    }

    /// Move Confirmed or InProgress sessions whose end has passed to
    /// Completed, which takes them off the tutor's calendar.
    pub async fn complete_elapsed_sessions(&self) -> Result<Vec<Session>, EngineError> {
        let now = self.now();
        let mut by_tutor: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for s in self.store.sessions.iter() {
            if s.status.is_active() && s.span.end <= now {
                by_tutor.entry(s.tutor_id).or_default().push(s.id);
            }
        }

        let mut completed = Vec::new();
        for (tutor_id, ids) in by_tutor {
            let cal = self.store.calendar(tutor_id);
            let mut guard = cal.write().await;
            for id in ids {
                let still_active = self
                    .store
                    .sessions
                    .get(&id)
                    .is_some_and(|s| s.status.is_active());
                if !still_active {
                    continue;
                }
                let event = Event::SessionStatusChanged {
                    id,
                    tutor_id,
                    status: SessionStatus::Completed,
                    at: now,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                completed.extend(self.get_session(id));
            }
        }

        if !completed.is_empty() {
            metrics::counter!(crate::observability::SESSIONS_COMPLETED_TOTAL)
                .increment(completed.len() as u64);
            info!("completed {} elapsed sessions", completed.len());
        }
        completed.sort_by_key(|s| s.span.start);
        Ok(completed)
    }

    /// Record the meeting room provisioned for a Confirmed/InProgress session.
    pub async fn link_room(&self, session_id: Ulid, room_id: Ulid) -> Result<Session, EngineError> {
        let tutor_id = self.session_tutor(session_id)?;
        let cal = self.store.calendar(tutor_id);
        let mut guard = cal.write().await;
        let now = self.now();

        let session = self.get_session(session_id).ok_or(EngineError::NotFound(session_id))?;
        if !session.status.is_active() {
            return Err(EngineError::Validation(format!(
                "cannot link a room to a {} session",
                session.status
            )));
        }
        let event = Event::RoomLinked {
            id: session_id,
            tutor_id,
            room_id,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        self.get_session(session_id).ok_or(EngineError::NotFound(session_id))
    }

    async fn transition_session(
        &self,
        session_id: Ulid,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<Session, EngineError> {
        let tutor_id = self.session_tutor(session_id)?;
        let cal = self.store.calendar(tutor_id);
        let mut guard = cal.write().await;
        let now = self.now();

        let session = self.get_session(session_id).ok_or(EngineError::NotFound(session_id))?;
        if session.status != from {
            return Err(StateError::InvalidTransition {
                from: session.status,
                to,
            }
            .into());
        }
        let event = Event::SessionStatusChanged {
            id: session_id,
            tutor_id,
            status: to,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("session {session_id}: {from} -> {to}");
        self.get_session(session_id).ok_or(EngineError::NotFound(session_id))
    }

    fn session_tutor(&self, session_id: Ulid) -> Result<Ulid, EngineError> {
        self.store
            .sessions
            .get(&session_id)
            .map(|s| s.tutor_id)
            .ok_or(EngineError::NotFound(session_id))
    }
}
