use std::collections::HashMap;

use chrono::{FixedOffset, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn validate_instant(t: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation(format!(
            "empty interval [{}, {})",
            span.start, span.end
        )));
    }
    validate_instant(span.start)?;
    validate_instant(span.end)?;
    if span.duration_ms() > DAY_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Slots of one call must not overlap each other.
pub(crate) fn check_disjoint(slots: &[Span]) -> Result<(), EngineError> {
    let mut sorted = slots.to_vec();
    sorted.sort_by_key(|s| s.start);
    for pair in sorted.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(EngineError::Validation(format!(
                "slots [{}, {}) and [{}, {}) overlap",
                pair[0].start, pair[0].end, pair[1].start, pair[1].end
            )));
        }
    }
    Ok(())
}

/// Fail if an active session, or a live lock held by someone other than
/// `student_id`, overlaps `span`. Locks listed in `own_locks` never conflict.
pub(crate) fn check_slot_free(
    cal: &TutorCalendar,
    span: &Span,
    student_id: Ulid,
    own_locks: &[Ulid],
    now: Ms,
) -> Result<(), EngineError> {
    for entry in cal.overlapping(span) {
        let conflicting = match entry.kind {
            EntryKind::Session { .. } => true,
            EntryKind::Lock { student_id: holder, .. } => {
                entry.is_live(now) && holder != student_id && !own_locks.contains(&entry.id)
            }
        };
        if conflicting {
            return Err(EngineError::Conflict {
                slot: *span,
                holder: entry.id,
            });
        }
    }
    Ok(())
}

/// Intervals a new slot for `student_id` must not touch: the tutor's sessions
/// and foreign live locks padded by `buffer`, plus the student's own sessions.
pub(crate) fn busy_spans(
    cal: &TutorCalendar,
    student_id: Ulid,
    student_sessions: &[Session],
    buffer: Ms,
    now: Ms,
) -> Vec<Span> {
    let mut busy: Vec<Span> = cal
        .entries
        .iter()
        .filter(|e| e.is_live(now) && (e.is_session() || e.holder() != student_id))
        .map(|e| e.span.padded(buffer))
        .collect();
    busy.extend(
        student_sessions
            .iter()
            .filter(|s| s.status.is_active())
            .map(|s| s.span),
    );
    busy.sort_by_key(|s| s.start);
    busy
}

/// Active sessions per local date on the tutor's calendar.
pub(crate) fn booked_per_day(cal: &TutorCalendar, tz: &FixedOffset) -> HashMap<NaiveDate, u32> {
    let mut counts = HashMap::new();
    for entry in cal.entries.iter().filter(|e| e.is_session()) {
        *counts.entry(local_date(entry.span.start, tz)).or_insert(0) += 1;
    }
    counts
}
