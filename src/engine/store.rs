use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedCalendar;

/// Durable-row tables, rebuilt from the WAL on open.
///
/// Every tutor-scoped mutation is applied while the caller holds that tutor's
/// calendar write guard; the guard is what serializes writers per tutor.
#[derive(Default)]
pub struct Store {
    calendars: DashMap<Ulid, SharedCalendar>,
    pub(super) blocks: DashMap<Ulid, Vec<AvailabilityBlock>>,
    pub(super) exceptions: DashMap<Ulid, Vec<AvailabilityException>>,
    pub(super) module_prefs: DashMap<(Ulid, Ulid), ModulePreference>,
    pub(super) student_prefs: DashMap<(Ulid, Option<Ulid>), Vec<StudentPreference>>,
    pub(super) requests: DashMap<Ulid, BookingRequest>,
    pub(super) tutor_requests: DashMap<Ulid, Vec<Ulid>>,
    pub(super) sessions: DashMap<Ulid, Session>,
    /// Student or tutor → session ids.
    pub(super) user_sessions: DashMap<Ulid, Vec<Ulid>>,
    pub(super) locks: DashMap<Ulid, SlotLock>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or lazily create the tutor's calendar.
    pub fn calendar(&self, tutor_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(tutor_id)
            .or_insert_with(|| Arc::new(RwLock::new(TutorCalendar::new(tutor_id))))
            .value()
            .clone()
    }

    pub fn module_preference(&self, tutor_id: Ulid, module_id: Ulid) -> ModulePreference {
        self.module_prefs
            .get(&(tutor_id, module_id))
            .map(|p| p.value().clone())
            .unwrap_or_else(|| ModulePreference::defaults(tutor_id, module_id))
    }

    pub fn blocks_of(&self, tutor_id: Ulid) -> Vec<AvailabilityBlock> {
        self.blocks
            .get(&tutor_id)
            .map(|b| b.value().clone())
            .unwrap_or_default()
    }

    pub fn exceptions_of(&self, tutor_id: Ulid) -> Vec<AvailabilityException> {
        self.exceptions
            .get(&tutor_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn sessions_of(&self, user_id: Ulid) -> Vec<Session> {
        let ids = self
            .user_sessions
            .get(&user_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.sessions.get(id).map(|s| s.value().clone()))
            .collect()
    }

    /// Users that should hear about `event` (tutor first). Call after apply.
    pub fn participants(&self, event: &Event) -> Vec<Ulid> {
        let mut users: Vec<Ulid> = event.tutor_id().into_iter().collect();
        let student_of_request =
            |id: &Ulid| self.requests.get(id).map(|r| r.student_id);
        let student_of_session =
            |id: &Ulid| self.sessions.get(id).map(|s| s.student_id);
        match event {
            Event::StudentPreferencesSaved { student_id, .. } => users.push(*student_id),
            Event::RequestCreated { request } => users.push(request.student_id),
            Event::RequestRejected { id, .. } => users.extend(student_of_request(id)),
            Event::RequestsExpired { ids, .. } => {
                users.extend(ids.iter().filter_map(student_of_request))
            }
            Event::LocksAcquired { locks, .. } => users.extend(locks.iter().map(|l| l.student_id)),
            Event::SessionsAllocated { sessions, .. } => {
                users.extend(sessions.iter().map(|s| s.student_id))
            }
            Event::SessionStatusChanged { id, .. }
            | Event::SessionCancelled { id, .. }
            | Event::RoomLinked { id, .. } => users.extend(student_of_session(id)),
            _ => {}
        }
        users.sort();
        users.dedup();
        users
    }

    // ── Event application ────────────────────────────────────

    /// Apply a committed event. `cal` must be the event's tutor calendar
    /// (held by the caller) whenever the event carries a tutor id.
    pub fn apply_event(&self, event: &Event, cal: Option<&mut TutorCalendar>) {
        match event {
            Event::BlockAdded { block } => {
                self.blocks
                    .entry(block.tutor_id)
                    .or_default()
                    .push(block.clone());
            }
            Event::BlocksReplaced { tutor_id, blocks } => {
                self.blocks.insert(*tutor_id, blocks.clone());
            }
            Event::BlockRemoved { id, tutor_id } => {
                if let Some(mut blocks) = self.blocks.get_mut(tutor_id) {
                    blocks.retain(|b| b.id != *id);
                }
            }
            Event::ExceptionAdded { exception } => {
                self.exceptions
                    .entry(exception.tutor_id)
                    .or_default()
                    .push(exception.clone());
            }
            Event::ExceptionRemoved { id, tutor_id } => {
                if let Some(mut exceptions) = self.exceptions.get_mut(tutor_id) {
                    exceptions.retain(|e| e.id != *id);
                }
            }
            Event::ModulePreferenceSet { preference } => {
                self.module_prefs
                    .insert((preference.tutor_id, preference.module_id), preference.clone());
            }
            Event::StudentPreferencesSaved {
                student_id,
                booking_request_id,
                rows,
            } => {
                self.student_prefs
                    .insert((*student_id, *booking_request_id), rows.clone());
            }
            Event::RequestCreated { request } => {
                self.student_prefs.insert(
                    (request.student_id, Some(request.id)),
                    request.availability.clone(),
                );
                let mut ids = self.tutor_requests.entry(request.tutor_id).or_default();
                if !ids.contains(&request.id) {
                    ids.push(request.id);
                }
                drop(ids);
                self.requests.insert(request.id, request.clone());
            }
            Event::RequestRejected { id, at, .. } => {
                if let Some(mut req) = self.requests.get_mut(id) {
                    req.status = RequestStatus::Rejected;
                    req.responded_at = Some(*at);
                }
            }
            Event::RequestsExpired { ids, .. } => {
                for id in ids {
                    if let Some(mut req) = self.requests.get_mut(id) {
                        req.status = RequestStatus::Expired;
                    }
                }
            }
            Event::LocksAcquired { locks, .. } => {
                let mut cal = cal;
                for lock in locks {
                    if let Some(cal) = cal.as_deref_mut() {
                        cal.insert_entry(CalendarEntry {
                            id: lock.id,
                            span: lock.span,
                            kind: EntryKind::Lock {
                                student_id: lock.student_id,
                                locked_at: lock.locked_at,
                                expires_at: lock.expires_at,
                            },
                        });
                    }
                    self.locks.insert(lock.id, lock.clone());
                }
            }
            Event::LocksReleased { ids, .. } => {
                let mut cal = cal;
                for id in ids {
                    if let Some(cal) = cal.as_deref_mut() {
                        cal.remove_entry(*id);
                    }
                    self.locks.remove(id);
                }
            }
            Event::SessionsAllocated {
                booking_request_id,
                sessions,
                at,
                ..
            } => {
                let mut cal = cal;
                for session in sessions {
                    if session.status.is_active()
                        && let Some(cal) = cal.as_deref_mut()
                    {
                        cal.insert_entry(CalendarEntry {
                            id: session.id,
                            span: session.span,
                            kind: EntryKind::Session {
                                student_id: session.student_id,
                            },
                        });
                    }
                    for user in [session.student_id, session.tutor_id] {
                        let mut ids = self.user_sessions.entry(user).or_default();
                        if !ids.contains(&session.id) {
                            ids.push(session.id);
                        }
                    }
                    self.sessions.insert(session.id, session.clone());
                }
                if let Some(request_id) = booking_request_id
                    && let Some(mut req) = self.requests.get_mut(request_id)
                {
                    req.status = RequestStatus::Approved;
                    req.responded_at = Some(*at);
                }
            }
            Event::SessionStatusChanged { id, status, at, .. } => {
                if let Some(mut session) = self.sessions.get_mut(id) {
                    session.status = *status;
                    session.updated_at = *at;
                }
                if !status.is_active()
                    && let Some(cal) = cal
                {
                    cal.remove_entry(*id);
                }
            }
            Event::SessionCancelled {
                id, cancellation, ..
            } => {
                if let Some(mut session) = self.sessions.get_mut(id) {
                    session.status = SessionStatus::Cancelled;
                    session.updated_at = cancellation.at;
                    session.cancellation = Some(cancellation.clone());
                }
                if let Some(cal) = cal {
                    cal.remove_entry(*id);
                }
            }
            Event::RoomLinked {
                id, room_id, at, ..
            } => {
                if let Some(mut session) = self.sessions.get_mut(id) {
                    session.room_id = Some(*room_id);
                    session.updated_at = *at;
                }
            }
        }
    }

    /// Rebuild state from replayed events. We're the sole owner of every
    /// calendar Arc here, so `try_write` never contends.
    pub fn replay(&self, events: &[Event]) {
        for event in events {
            match event.tutor_id() {
                Some(tutor_id) => {
                    let cal = self.calendar(tutor_id);
                    match cal.try_write() {
                        Ok(mut guard) => self.apply_event(event, Some(&mut guard)),
                        Err(_) => self.apply_event(event, None),
                    };
                }
                None => self.apply_event(event, None),
            }
        }
    }

    /// Minimal event list that recreates the current state.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        for entry in self.blocks.iter() {
            events.push(Event::BlocksReplaced {
                tutor_id: *entry.key(),
                blocks: entry.value().clone(),
            });
        }
        for entry in self.exceptions.iter() {
            for exception in entry.value() {
                events.push(Event::ExceptionAdded {
                    exception: exception.clone(),
                });
            }
        }
        for entry in self.module_prefs.iter() {
            events.push(Event::ModulePreferenceSet {
                preference: entry.value().clone(),
            });
        }
        for entry in self.student_prefs.iter() {
            let (student_id, booking_request_id) = *entry.key();
            // Request snapshots come back with RequestCreated.
            if booking_request_id.is_none() {
                events.push(Event::StudentPreferencesSaved {
                    student_id,
                    booking_request_id,
                    rows: entry.value().clone(),
                });
            }
        }

        let mut requests: Vec<BookingRequest> =
            self.requests.iter().map(|r| r.value().clone()).collect();
        requests.sort_by_key(|r| r.id);
        events.extend(requests.into_iter().map(|request| Event::RequestCreated { request }));

        let mut sessions: Vec<Session> = self.sessions.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by_key(|s| s.id);
        for session in sessions {
            events.push(Event::SessionsAllocated {
                tutor_id: session.tutor_id,
                booking_request_id: None,
                at: session.created_at,
                sessions: vec![session],
            });
        }

        let mut locks: Vec<SlotLock> = self.locks.iter().map(|l| l.value().clone()).collect();
        locks.sort_by_key(|l| l.id);
        for lock in locks {
            events.push(Event::LocksAcquired {
                tutor_id: lock.tutor_id,
                locks: vec![lock],
            });
        }

        events
    }
}
