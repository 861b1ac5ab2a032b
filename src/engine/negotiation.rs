use std::collections::{HashMap, HashSet};

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{booked_per_day, validate_instant};
use super::mutations::validate_preference_rows;
use super::{Allocation, Engine, EngineError, StateError};

impl Engine {
    /// Student proposes candidate slot starts for a tutor's module. Every
    /// candidate is re-validated against current availability and policy.
    pub async fn create_booking_request(
        &self,
        student_id: Ulid,
        tutor_id: Ulid,
        module_id: Ulid,
        candidate_starts: &[Ms],
        availability: Vec<StudentPreference>,
    ) -> Result<BookingRequest, EngineError> {
        if student_id == tutor_id {
            return Err(EngineError::Validation("student and tutor must differ".into()));
        }
        if candidate_starts.is_empty() {
            return Err(EngineError::Validation("no candidate slots".into()));
        }
        if candidate_starts.len() > MAX_CANDIDATE_SLOTS {
            return Err(EngineError::LimitExceeded("too many candidate slots"));
        }
        let mut seen = HashSet::new();
        for start in candidate_starts {
            validate_instant(*start)?;
            if !seen.insert(*start) {
                return Err(EngineError::Validation(format!("duplicate candidate slot {start}")));
            }
        }
        validate_preference_rows(&availability)?;

        let id = Ulid::new();
        let availability: Vec<StudentPreference> = availability
            .into_iter()
            .map(|row| StudentPreference {
                student_id,
                booking_request_id: Some(id),
                ..row
            })
            .collect();

        let preference = self.store.module_preference(tutor_id, module_id);
        let len = preference.slot_length_ms();
        let mut candidate_slots: Vec<Span> = candidate_starts
            .iter()
            .map(|s| Span::new(*s, s + len))
            .collect();
        candidate_slots.sort_by_key(|s| s.start);

        let cal = self.store.calendar(tutor_id);
        let mut guard = cal.write().await;
        let now = self.now();

        let first = local_date(candidate_slots[0].start, self.tz());
        let last = local_date(candidate_slots[candidate_slots.len() - 1].start, self.tz());
        let verdicts: HashMap<Ms, Result<(), SlotRejection>> = self
            .slot_verdicts(&guard, student_id, tutor_id, module_id, first, last, &availability, now)
            .into_iter()
            .map(|v| (v.span.start, v.verdict))
            .collect();

        for slot in &candidate_slots {
            let verdict = verdicts
                .get(&slot.start)
                .copied()
                .unwrap_or(Err(SlotRejection::NotOffered));
            if let Err(rejection) = verdict {
                return Err(EngineError::Validation(format!(
                    "slot starting {} rejected: {}",
                    slot.start,
                    rejection.code()
                )));
            }
        }

        let request = BookingRequest {
            id,
            student_id,
            tutor_id,
            module_id,
            status: RequestStatus::Pending,
            availability,
            candidate_slots,
            created_at: now,
            expires_at: now + self.settings.negotiation_ttl_ms,
            responded_at: None,
        };
        let event = Event::RequestCreated {
            request: request.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(crate::observability::REQUESTS_CREATED_TOTAL).increment(1);
        info!("booking request {id} created by {student_id} for tutor {tutor_id}");
        Ok(request)
    }

    /// Tutor accepts a subset of the candidates. Lock all, then allocate all;
    /// on any failure the request stays Pending.
    pub async fn approve_booking_request(
        &self,
        request_id: Ulid,
        approved_starts: &[Ms],
        tutor_id: Ulid,
    ) -> Result<Vec<Session>, EngineError> {
        let cal = self.store.calendar(self.request_tutor(request_id, tutor_id)?);

        // Phase 1: lock every approved slot under one guard.
        let (request, slots, lock_ids) = {
            let mut guard = cal.write().await;
            let now = self.now();
            let request = self.open_request(&mut guard, request_id, now).await?;

            if approved_starts.is_empty() {
                return Err(EngineError::Validation("no slots approved".into()));
            }
            let mut seen = HashSet::new();
            let mut slots = Vec::with_capacity(approved_starts.len());
            for start in approved_starts {
                if !seen.insert(*start) {
                    return Err(EngineError::Validation(format!("duplicate approved slot {start}")));
                }
                let slot = request
                    .candidate_slots
                    .iter()
                    .find(|s| s.start == *start)
                    .ok_or_else(|| {
                        EngineError::Validation(format!("slot {start} is not a candidate"))
                    })?;
                slots.push(*slot);
            }
            self.check_approved_slots(&guard, tutor_id, request.module_id, &slots, now)?;

            let lock_ids = self
                .lock_slots(&mut guard, &slots, request.student_id, None, now)
                .await?;
            (request, slots, lock_ids)
        };

        // Phase 2: allocate; failure releases the locks.
        let sessions = self
            .allocate(Allocation {
                booking_request_id: Some(request_id),
                tutor_id,
                student_id: request.student_id,
                module_id: request.module_id,
                slots,
                lock_ids,
            })
            .await?;

        metrics::counter!(crate::observability::REQUESTS_RESOLVED_TOTAL, "outcome" => "approved")
            .increment(1);
        info!("booking request {request_id} approved with {} sessions", sessions.len());
        Ok(sessions)
    }

    /// Approved slots must still clear the lead time, and fit under the
    /// daily cap together with what is already booked.
    fn check_approved_slots(
        &self,
        cal: &TutorCalendar,
        tutor_id: Ulid,
        module_id: Ulid,
        slots: &[Span],
        now: Ms,
    ) -> Result<(), EngineError> {
        let preference = self.store.module_preference(tutor_id, module_id);
        let earliest = now + preference.lead_time_ms();
        let mut per_day = booked_per_day(cal, self.tz());
        for slot in slots {
            let rejection = if slot.start < earliest {
                Some(SlotRejection::LeadTime)
            } else {
                let count = per_day.entry(local_date(slot.start, self.tz())).or_insert(0);
                *count += 1;
                (*count > preference.max_sessions_per_day).then_some(SlotRejection::DailyLimit)
            };
            if let Some(rejection) = rejection {
                return Err(EngineError::Validation(format!(
                    "slot starting {} rejected: {}",
                    slot.start,
                    rejection.code()
                )));
            }
        }
        Ok(())
    }

    pub async fn reject_booking_request(
        &self,
        request_id: Ulid,
        tutor_id: Ulid,
    ) -> Result<BookingRequest, EngineError> {
        let cal = self.store.calendar(self.request_tutor(request_id, tutor_id)?);
        let mut guard = cal.write().await;
        let now = self.now();
        self.open_request(&mut guard, request_id, now).await?;

        let event = Event::RequestRejected {
            id: request_id,
            tutor_id,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(crate::observability::REQUESTS_RESOLVED_TOTAL, "outcome" => "rejected")
            .increment(1);
        info!("booking request {request_id} rejected");
        self.store
            .requests
            .get(&request_id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(request_id))
    }

    /// Transition every Pending request past its deadline to Expired.
    pub async fn expire_stale_requests(&self) -> Result<Vec<Ulid>, EngineError> {
        let now = self.now();
        let mut by_tutor: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for entry in self.store.requests.iter() {
            if entry.is_expired(now) && entry.status == RequestStatus::Pending {
                by_tutor.entry(entry.tutor_id).or_default().push(entry.id);
            }
        }

        let mut expired = Vec::new();
        for (tutor_id, candidates) in by_tutor {
            let cal = self.store.calendar(tutor_id);
            let mut guard = cal.write().await;
            // Re-check under the guard; an approve may have won meanwhile.
            let ids: Vec<Ulid> = candidates
                .into_iter()
                .filter(|id| {
                    self.store
                        .requests
                        .get(id)
                        .is_some_and(|r| r.status == RequestStatus::Pending && r.is_expired(now))
                })
                .collect();
            if ids.is_empty() {
                continue;
            }
            let event = Event::RequestsExpired {
                tutor_id,
                ids: ids.clone(),
                at: now,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            expired.extend(ids);
        }

        if !expired.is_empty() {
            metrics::counter!(crate::observability::REQUESTS_RESOLVED_TOTAL, "outcome" => "expired")
                .increment(expired.len() as u64);
            info!("expired {} stale booking requests", expired.len());
        }
        Ok(expired)
    }

    /// Unknown requests and requests of another tutor are both NotFound.
    fn request_tutor(&self, request_id: Ulid, tutor_id: Ulid) -> Result<Ulid, EngineError> {
        match self.store.requests.get(&request_id) {
            Some(r) if r.tutor_id == tutor_id => Ok(tutor_id),
            _ => Err(EngineError::NotFound(request_id)),
        }
    }

    /// Pending and unexpired, else the matching StateError. An expired
    /// Pending request is transitioned to Expired on the way out.
    async fn open_request(
        &self,
        cal: &mut TutorCalendar,
        request_id: Ulid,
        now: Ms,
    ) -> Result<BookingRequest, EngineError> {
        let request = self
            .store
            .requests
            .get(&request_id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(request_id))?;
        if request.status != RequestStatus::Pending {
            return Err(StateError::AlreadyResolved(request.status).into());
        }
        if request.is_expired(now) {
            let event = Event::RequestsExpired {
                tutor_id: request.tutor_id,
                ids: vec![request_id],
                at: now,
            };
            self.persist_and_apply(cal, &event).await?;
            return Err(StateError::Expired.into());
        }
        Ok(request)
    }
}
