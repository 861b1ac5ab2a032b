use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::resolve_availability;
use super::conflict::{booked_per_day, busy_spans};
use super::slots::{evaluate_slots, SlotQuery};
use super::{Engine, EngineError};

/// How far back a started session still counts as upcoming/joinable.
const JOIN_GRACE_MS: Ms = 2 * HOUR_MS;
/// How early a session becomes joinable.
const JOIN_EARLY_MS: Ms = 15 * MINUTE_MS;
const RECENT_SESSIONS: usize = 10;
const TOP_STUDENTS: usize = 6;

fn validate_date_range(from: NaiveDate, to: NaiveDate) -> Result<(), EngineError> {
    if to < from {
        return Err(EngineError::Validation(format!("date range {from}..{to} is inverted")));
    }
    if (to - from).num_days() >= MAX_QUERY_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    pub async fn get_availability(
        &self,
        tutor_id: Ulid,
        module_id: Option<Ulid>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        validate_date_range(from, to)?;
        Ok(resolve_availability(
            &self.store.blocks_of(tutor_id),
            &self.store.exceptions_of(tutor_id),
            module_id,
            from,
            to,
            self.tz(),
        ))
    }

    /// Bookable slots for this student, chronological. Read-only.
    pub async fn preview_slots(
        &self,
        student_id: Ulid,
        tutor_id: Ulid,
        module_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        availability: &[StudentPreference],
    ) -> Result<Vec<Span>, EngineError> {
        Ok(self
            .explain_slots(student_id, tutor_id, module_id, from, to, availability)
            .await?
            .into_iter()
            .filter(|v| v.verdict.is_ok())
            .map(|v| v.span)
            .collect())
    }

    /// Every grid slot in the range with the reason it is or isn't bookable.
    pub async fn explain_slots(
        &self,
        student_id: Ulid,
        tutor_id: Ulid,
        module_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        availability: &[StudentPreference],
    ) -> Result<Vec<SlotVerdict>, EngineError> {
        validate_date_range(from, to)?;
        let cal = self.store.calendar(tutor_id);
        let guard = cal.read().await;
        let now = self.now();
        Ok(self.slot_verdicts(&guard, student_id, tutor_id, module_id, from, to, availability, now))
    }

    /// Resolver → generator → matcher over `[from, to]`, against a calendar
    /// the caller has locked.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn slot_verdicts(
        &self,
        cal: &TutorCalendar,
        student_id: Ulid,
        tutor_id: Ulid,
        module_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        availability: &[StudentPreference],
        now: Ms,
    ) -> Vec<SlotVerdict> {
        let tz = *self.tz();
        let preference = self.store.module_preference(tutor_id, module_id);
        let days = resolve_availability(
            &self.store.blocks_of(tutor_id),
            &self.store.exceptions_of(tutor_id),
            Some(module_id),
            from,
            to,
            &tz,
        );
        let open: Vec<Span> = days.into_iter().flat_map(|d| d.open).collect();

        let busy = busy_spans(
            cal,
            student_id,
            &self.store.sessions_of(student_id),
            preference.buffer_ms(),
            now,
        );
        let booked = booked_per_day(cal, &tz);
        let query = SlotQuery {
            preference: &preference,
            now,
            busy: &busy,
            booked_per_day: &booked,
            preferences: availability,
            tz,
        };
        evaluate_slots(&open, &query)
    }

    /// Pending, unexpired requests for a tutor, newest first.
    pub fn get_pending_requests(&self, tutor_id: Ulid) -> Vec<BookingRequest> {
        let now = self.now();
        let ids = self
            .store
            .tutor_requests
            .get(&tutor_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        let mut pending: Vec<BookingRequest> = ids
            .iter()
            .filter_map(|id| self.store.requests.get(id).map(|r| r.value().clone()))
            .filter(|r| r.is_open(now))
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        pending
    }

    pub fn get_booking_request(&self, id: Ulid) -> Option<BookingRequest> {
        self.store.requests.get(&id).map(|r| r.value().clone())
    }

    pub fn get_session(&self, id: Ulid) -> Option<Session> {
        self.store.sessions.get(&id).map(|s| s.value().clone())
    }

    /// Sessions where the user is student or tutor, by start. `range` keeps
    /// sessions starting inside it.
    pub fn get_user_sessions(&self, user_id: Ulid, range: Option<Span>) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .store
            .sessions_of(user_id)
            .into_iter()
            .filter(|s| range.is_none_or(|r| r.contains_instant(s.span.start)))
            .collect();
        sessions.sort_by_key(|s| (s.span.start, s.id));
        sessions
    }

    pub fn get_upcoming_sessions(&self, user_id: Ulid, limit: usize) -> Vec<UpcomingSession> {
        let now = self.now();
        let mut upcoming: Vec<Session> = self
            .store
            .sessions_of(user_id)
            .into_iter()
            .filter(|s| s.status.is_active() && s.span.start > now - JOIN_GRACE_MS)
            .collect();
        upcoming.sort_by_key(|s| (s.span.start, s.id));
        upcoming.truncate(limit);

        upcoming
            .into_iter()
            .map(|session| {
                let cutoff = self
                    .store
                    .module_preference(session.tutor_id, session.module_id)
                    .cancellation_cutoff_ms();
                let joinable = Span::new(now - JOIN_GRACE_MS, now + JOIN_EARLY_MS + 1);
                UpcomingSession {
                    can_join: session.status == SessionStatus::InProgress
                        || joinable.contains_instant(session.span.start),
                    can_cancel_without_penalty: session.span.start - now >= cutoff,
                    session,
                }
            })
            .collect()
    }

    /// Activity for sessions the tutor teaches that start within the last
    /// `days` days, up to now.
    pub fn get_tutor_analytics(&self, tutor_id: Ulid, days: u32) -> Result<TutorAnalytics, EngineError> {
        if days == 0 {
            return Err(EngineError::Validation("analytics window must cover at least a day".into()));
        }
        if days > MAX_ANALYTICS_DAYS {
            return Err(EngineError::LimitExceeded("analytics window too wide"));
        }
        let now = self.now();
        let window = Span::new(now - days as Ms * DAY_MS, now);

        let mut sessions: Vec<Session> = self
            .store
            .sessions_of(tutor_id)
            .into_iter()
            .filter(|s| s.tutor_id == tutor_id)
            .filter(|s| window.start <= s.span.start && s.span.start <= window.end)
            .collect();
        sessions.sort_by_key(|s| (std::cmp::Reverse(s.span.start), s.id));

        let mut delivered_ms: Ms = 0;
        let mut cancelled: usize = 0;
        let mut late: usize = 0;
        let mut completed: usize = 0;
        let mut per_student: HashMap<Ulid, (usize, Ms)> = HashMap::new();
        for s in &sessions {
            let stats = per_student.entry(s.student_id).or_default();
            stats.0 += 1;
            match s.status {
                SessionStatus::Cancelled => {
                    cancelled += 1;
                    if s.cancellation.as_ref().is_some_and(|c| c.late) {
                        late += 1;
                    }
                    continue;
                }
                SessionStatus::Completed => completed += 1,
                _ => {}
            }
            delivered_ms += s.span.duration_ms();
            stats.1 += s.span.duration_ms();
        }

        let mut ranked: Vec<(Ulid, usize, Ms)> = per_student
            .into_iter()
            .map(|(id, (count, ms))| (id, count, ms))
            .collect();
        ranked.sort_by(|a, b| b.2.cmp(&a.2).then(b.1.cmp(&a.1)).then(a.0.cmp(&b.0)));
        let unique_students = ranked.len();
        let top_students = ranked
            .into_iter()
            .take(TOP_STUDENTS)
            .map(|(student_id, session_count, ms)| StudentStats {
                student_id,
                session_count,
                total_hours: ms as f64 / HOUR_MS as f64,
            })
            .collect();

        let total_sessions = sessions.len();
        let cancellation_rate = if total_sessions == 0 {
            0.0
        } else {
            cancelled as f64 / total_sessions as f64
        };
        sessions.truncate(RECENT_SESSIONS);

        Ok(TutorAnalytics {
            tutor_id,
            window,
            total_sessions,
            completed_sessions: completed,
            cancelled_sessions: cancelled,
            late_cancellations: late,
            unique_students,
            total_hours: delivered_ms as f64 / HOUR_MS as f64,
            cancellation_rate,
            recent_sessions: sessions,
            top_students,
        })
    }

    // ── Configuration reads ──────────────────────────────────

    pub fn list_availability_blocks(&self, tutor_id: Ulid) -> Vec<AvailabilityBlock> {
        let mut blocks = self.store.blocks_of(tutor_id);
        blocks.sort_by_key(|b| (b.weekday.num_days_from_monday(), b.start, b.id));
        blocks
    }

    /// Exceptions by date, optionally limited to `[from, to]`.
    pub fn list_availability_exceptions(
        &self,
        tutor_id: Ulid,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Vec<AvailabilityException> {
        let mut exceptions: Vec<AvailabilityException> = self
            .store
            .exceptions_of(tutor_id)
            .into_iter()
            .filter(|e| range.is_none_or(|(from, to)| from <= e.date && e.date <= to))
            .collect();
        exceptions.sort_by_key(|e| (e.date, e.start, e.id));
        exceptions
    }

    /// Stored policy, or the defaults when none was set.
    pub fn get_module_preference(&self, tutor_id: Ulid, module_id: Ulid) -> ModulePreference {
        self.store.module_preference(tutor_id, module_id)
    }

    /// `booking_request_id = None` reads the student's general preferences.
    pub fn get_student_preferences(
        &self,
        student_id: Ulid,
        booking_request_id: Option<Ulid>,
    ) -> Vec<StudentPreference> {
        self.store
            .student_prefs
            .get(&(student_id, booking_request_id))
            .map(|rows| rows.value().clone())
            .unwrap_or_default()
    }
}
