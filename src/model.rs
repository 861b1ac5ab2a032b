use std::fmt;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Widen both ends by `pad` (buffer around a busy interval).
    pub fn padded(&self, pad: Ms) -> Span {
        Span::new(self.start - pad, self.end + pad)
    }
}

// ── Calendar helpers (single reference offset) ──────────────────

/// Instant of a wall-clock time in the reference offset.
pub fn local_ms(at: NaiveDateTime, tz: &FixedOffset) -> Ms {
    at.and_utc().timestamp_millis() - tz.local_minus_utc() as Ms * 1000
}

/// Wall-clock time of an instant in the reference offset.
pub fn local_datetime(ms: Ms, tz: &FixedOffset) -> NaiveDateTime {
    let shifted = ms + tz.local_minus_utc() as Ms * 1000;
    DateTime::from_timestamp_millis(shifted)
        .unwrap_or_default()
        .naive_utc()
}

pub fn local_date(ms: Ms, tz: &FixedOffset) -> NaiveDate {
    local_datetime(ms, tz).date()
}

/// The whole local day `[00:00, 24:00)` as instants.
pub fn day_span(date: NaiveDate, tz: &FixedOffset) -> Span {
    let start = local_ms(date.and_time(NaiveTime::MIN), tz);
    Span::new(start, start + DAY_MS)
}

/// Span of `[start, end)` wall-clock times on `date`.
pub fn local_span(date: NaiveDate, start: NaiveTime, end: NaiveTime, tz: &FixedOffset) -> Span {
    Span::new(
        local_ms(date.and_time(start), tz),
        local_ms(date.and_time(end), tz),
    )
}

// ── Tutor availability ──────────────────────────────────────────

/// Recurring weekly window in which a tutor can be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityBlock {
    pub id: Ulid,
    pub tutor_id: Ulid,
    /// `Some` = only for this module, and overrides tutor-wide blocks for it.
    pub module_id: Option<Ulid>,
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub recurring: bool,
    pub effective_from: NaiveDate,
    pub effective_until: Option<NaiveDate>,
    /// Display label only; all arithmetic uses the engine's reference offset.
    pub timezone: String,
}

impl AvailabilityBlock {
    /// A non-recurring block covers only the first matching weekday on or
    /// after `effective_from`.
    pub fn applies_on(&self, date: NaiveDate) -> bool {
        if date.weekday() != self.weekday || date < self.effective_from {
            return false;
        }
        if let Some(until) = self.effective_until
            && date > until
        {
            return false;
        }
        self.recurring || (date - self.effective_from).num_days() < 7
    }

    pub fn span_on(&self, date: NaiveDate, tz: &FixedOffset) -> Span {
        local_span(date, self.start, self.end, tz)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionKind {
    /// Removes time on the date.
    Blackout,
    /// Adds one-off time on the date, even outside any block.
    Addition,
}

/// Date-specific override of the weekly blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityException {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub block_id: Option<Ulid>,
    pub date: NaiveDate,
    pub kind: ExceptionKind,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub reason: Option<String>,
}

impl AvailabilityException {
    pub fn time_range(&self) -> Option<(NaiveTime, NaiveTime)> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => Some((s, e)),
            _ => None,
        }
    }
}

/// Booking policy for one (tutor, module) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulePreference {
    pub tutor_id: Ulid,
    pub module_id: Ulid,
    pub slot_length_minutes: u32,
    pub buffer_minutes: u32,
    pub lead_time_hours: u32,
    pub booking_window_days: u32,
    pub max_sessions_per_day: u32,
    pub cancellation_cutoff_hours: u32,
}

impl ModulePreference {
    pub fn defaults(tutor_id: Ulid, module_id: Ulid) -> Self {
        Self {
            tutor_id,
            module_id,
            slot_length_minutes: 60,
            buffer_minutes: 10,
            lead_time_hours: 4,
            booking_window_days: 21,
            max_sessions_per_day: 5,
            cancellation_cutoff_hours: 12,
        }
    }

    pub fn slot_length_ms(&self) -> Ms {
        self.slot_length_minutes as Ms * MINUTE_MS
    }

    pub fn buffer_ms(&self) -> Ms {
        self.buffer_minutes as Ms * MINUTE_MS
    }

    pub fn lead_time_ms(&self) -> Ms {
        self.lead_time_hours as Ms * HOUR_MS
    }

    pub fn cancellation_cutoff_ms(&self) -> Ms {
        self.cancellation_cutoff_hours as Ms * HOUR_MS
    }
}

// ── Student preferences ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeBucket {
    /// [06:00, 12:00)
    Morning,
    /// [12:00, 17:00)
    Afternoon,
    /// [17:00, 22:00)
    Evening,
}

impl TimeBucket {
    /// Hour bounds `[from, to)`.
    pub fn hours(self) -> (u32, u32) {
        match self {
            TimeBucket::Morning => (6, 12),
            TimeBucket::Afternoon => (12, 17),
            TimeBucket::Evening => (17, 22),
        }
    }

    pub fn contains(self, t: NaiveTime) -> bool {
        let (from, to) = self.hours();
        from <= t.hour() && t.hour() < to
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreferenceWindow {
    Bucket(TimeBucket),
    /// Explicit start hours (0-23).
    Hours(Vec<u32>),
}

/// One row of a student's OR-set of acceptable times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentPreference {
    pub id: Ulid,
    pub student_id: Ulid,
    /// `Some` = snapshot taken for one negotiation.
    pub booking_request_id: Option<Ulid>,
    pub weekday: Weekday,
    pub window: PreferenceWindow,
}

impl StudentPreference {
    pub fn matches(&self, start: NaiveDateTime) -> bool {
        if start.weekday() != self.weekday {
            return false;
        }
        match &self.window {
            PreferenceWindow::Bucket(bucket) => bucket.contains(start.time()),
            PreferenceWindow::Hours(hours) => hours.contains(&start.hour()),
        }
    }
}

// ── Negotiation ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "Pending",
            RequestStatus::Approved => "Approved",
            RequestStatus::Rejected => "Rejected",
            RequestStatus::Expired => "Expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub id: Ulid,
    pub student_id: Ulid,
    pub tutor_id: Ulid,
    pub module_id: Ulid,
    pub status: RequestStatus,
    /// Student preferences as they were when the request was made.
    pub availability: Vec<StudentPreference>,
    pub candidate_slots: Vec<Span>,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub responded_at: Option<Ms>,
}

impl BookingRequest {
    pub fn is_expired(&self, now: Ms) -> bool {
        now > self.expires_at
    }

    /// Pending and not yet past its deadline.
    pub fn is_open(&self, now: Ms) -> bool {
        self.status == RequestStatus::Pending && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLock {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub span: Span,
    pub student_id: Ulid,
    pub locked_at: Ms,
    pub expires_at: Ms,
}

impl SlotLock {
    pub fn is_live(&self, now: Ms) -> bool {
        self.locked_at <= now && now < self.expires_at
    }
}

// ── Sessions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl SessionStatus {
    /// Statuses that hold the tutor's time axis.
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Confirmed | SessionStatus::InProgress)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "Pending",
            SessionStatus::Confirmed => "Confirmed",
            SessionStatus::InProgress => "InProgress",
            SessionStatus::Completed => "Completed",
            SessionStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub by: Ulid,
    pub at: Ms,
    pub reason: String,
    /// Cancelled inside the module's cutoff.
    pub late: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub booking_request_id: Option<Ulid>,
    pub student_id: Ulid,
    pub tutor_id: Ulid,
    pub module_id: Ulid,
    pub room_id: Option<Ulid>,
    pub span: Span,
    pub status: SessionStatus,
    pub cancellation: Option<Cancellation>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Session {
    pub fn involves(&self, user_id: Ulid) -> bool {
        self.student_id == user_id || self.tutor_id == user_id
    }
}

// ── Tutor calendar ──────────────────────────────────────────────

/// What occupies a stretch of a tutor's time axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Short-lived reservation taken during approval.
    Lock {
        student_id: Ulid,
        locked_at: Ms,
        expires_at: Ms,
    },
    /// Confirmed or in-progress session.
    Session { student_id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEntry {
    pub id: Ulid,
    pub span: Span,
    pub kind: EntryKind,
}

impl CalendarEntry {
    /// Locks vanish for every reader once expired; sessions are always live
    /// while they sit in the calendar.
    pub fn is_live(&self, now: Ms) -> bool {
        match self.kind {
            EntryKind::Lock { locked_at, expires_at, .. } => locked_at <= now && now < expires_at,
            EntryKind::Session { .. } => true,
        }
    }

    pub fn holder(&self) -> Ulid {
        match self.kind {
            EntryKind::Lock { student_id, .. } | EntryKind::Session { student_id } => student_id,
        }
    }

    pub fn is_session(&self) -> bool {
        matches!(self.kind, EntryKind::Session { .. })
    }
}

/// Everything currently occupying one tutor's time: live locks and active
/// sessions, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct TutorCalendar {
    pub tutor_id: Ulid,
    pub entries: Vec<CalendarEntry>,
}

impl TutorCalendar {
    pub fn new(tutor_id: Ulid) -> Self {
        Self {
            tutor_id,
            entries: Vec::new(),
        }
    }

    /// Insert entry maintaining sort order by span.start.
    pub fn insert_entry(&mut self, entry: CalendarEntry) {
        let pos = self
            .entries
            .binary_search_by_key(&entry.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    pub fn remove_entry(&mut self, id: Ulid) -> Option<CalendarEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose span overlaps the query window.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &CalendarEntry> {
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }

    pub fn locks(&self) -> impl Iterator<Item = &CalendarEntry> {
        self.entries.iter().filter(|e| !e.is_session())
    }
}

/// The event types: flat, no nesting beyond row payloads. This is the WAL
/// record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BlockAdded {
        block: AvailabilityBlock,
    },
    BlocksReplaced {
        tutor_id: Ulid,
        blocks: Vec<AvailabilityBlock>,
    },
    BlockRemoved {
        id: Ulid,
        tutor_id: Ulid,
    },
    ExceptionAdded {
        exception: AvailabilityException,
    },
    ExceptionRemoved {
        id: Ulid,
        tutor_id: Ulid,
    },
    ModulePreferenceSet {
        preference: ModulePreference,
    },
    StudentPreferencesSaved {
        student_id: Ulid,
        booking_request_id: Option<Ulid>,
        rows: Vec<StudentPreference>,
    },
    RequestCreated {
        request: BookingRequest,
    },
    RequestRejected {
        id: Ulid,
        tutor_id: Ulid,
        at: Ms,
    },
    RequestsExpired {
        tutor_id: Ulid,
        ids: Vec<Ulid>,
        at: Ms,
    },
    LocksAcquired {
        tutor_id: Ulid,
        locks: Vec<SlotLock>,
    },
    LocksReleased {
        tutor_id: Ulid,
        ids: Vec<Ulid>,
    },
    /// One approval batch: every session plus the request transition.
    SessionsAllocated {
        tutor_id: Ulid,
        booking_request_id: Option<Ulid>,
        sessions: Vec<Session>,
        at: Ms,
    },
    SessionStatusChanged {
        id: Ulid,
        tutor_id: Ulid,
        status: SessionStatus,
        at: Ms,
    },
    SessionCancelled {
        id: Ulid,
        tutor_id: Ulid,
        cancellation: Cancellation,
    },
    RoomLinked {
        id: Ulid,
        tutor_id: Ulid,
        room_id: Ulid,
        at: Ms,
    },
}

impl Event {
    /// Tutor whose calendar the event belongs to, if any.
    pub fn tutor_id(&self) -> Option<Ulid> {
        match self {
            Event::BlockAdded { block } => Some(block.tutor_id),
            Event::ExceptionAdded { exception } => Some(exception.tutor_id),
            Event::ModulePreferenceSet { preference } => Some(preference.tutor_id),
            Event::RequestCreated { request } => Some(request.tutor_id),
            Event::BlocksReplaced { tutor_id, .. }
            | Event::BlockRemoved { tutor_id, .. }
            | Event::ExceptionRemoved { tutor_id, .. }
            | Event::RequestRejected { tutor_id, .. }
            | Event::RequestsExpired { tutor_id, .. }
            | Event::LocksAcquired { tutor_id, .. }
            | Event::LocksReleased { tutor_id, .. }
            | Event::SessionsAllocated { tutor_id, .. }
            | Event::SessionStatusChanged { tutor_id, .. }
            | Event::SessionCancelled { tutor_id, .. }
            | Event::RoomLinked { tutor_id, .. } => Some(*tutor_id),
            Event::StudentPreferencesSaved { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Open intervals of one local date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub open: Vec<Span>,
}

/// Why a grid slot is not bookable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotRejection {
    LeadTime,
    BookingWindow,
    BufferConflict,
    DailyLimit,
    StudentPreference,
    /// Not on the tutor's slot grid at all.
    NotOffered,
}

impl SlotRejection {
    pub fn code(self) -> &'static str {
        match self {
            SlotRejection::LeadTime => "LEAD_TIME",
            SlotRejection::BookingWindow => "BOOKING_WINDOW",
            SlotRejection::BufferConflict => "BUFFER_CONFLICT",
            SlotRejection::DailyLimit => "DAILY_LIMIT",
            SlotRejection::StudentPreference => "STUDENT_PREFERENCE",
            SlotRejection::NotOffered => "SLOT_UNAVAILABLE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotVerdict {
    pub span: Span,
    pub verdict: Result<(), SlotRejection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpcomingSession {
    pub session: Session,
    pub can_join: bool,
    pub can_cancel_without_penalty: bool,
}

/// One student's share of a tutor's reporting window.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentStats {
    pub student_id: Ulid,
    pub session_count: usize,
    /// Scheduled hours, cancelled sessions excluded.
    pub total_hours: f64,
}

/// Tutor activity over sessions starting in `window`.
#[derive(Debug, Clone, PartialEq)]
pub struct TutorAnalytics {
    pub tutor_id: Ulid,
    pub window: Span,
    pub total_sessions: usize,
    pub completed_sessions: usize,
    pub cancelled_sessions: usize,
    pub late_cancellations: usize,
    pub unique_students: usize,
    pub total_hours: f64,
    /// `cancelled_sessions / total_sessions`, 0 with no sessions.
    pub cancellation_rate: f64,
    /// Most recent first.
    pub recent_sessions: Vec<Session>,
    /// Most hours first.
    pub top_students: Vec<StudentStats>,
}
