use std::collections::HashMap;

use chrono::{FixedOffset, NaiveDate};

use crate::model::*;

use super::matcher::slot_matches;

/// Inputs for cutting open intervals into bookable slots.
pub struct SlotQuery<'a> {
    pub preference: &'a ModulePreference,
    pub now: Ms,
    /// Sorted; already padded by the caller where a buffer applies.
    pub busy: &'a [Span],
    /// Sessions already booked per local date.
    pub booked_per_day: &'a HashMap<NaiveDate, u32>,
    /// Student's windows; empty accepts every slot.
    pub preferences: &'a [StudentPreference],
    pub tz: FixedOffset,
}

/// Cut `[len]` slots separated by `buffer` from each open interval. The grid
/// is anchored at the interval start; a short trailing remainder is dropped.
pub fn slot_grid(open: &[Span], preference: &ModulePreference) -> Vec<Span> {
    let len = preference.slot_length_ms();
    let step = len + preference.buffer_ms();
    let mut grid = Vec::new();
    if len <= 0 {
        return grid;
    }
    for interval in open {
        let mut start = interval.start;
        while start + len <= interval.end {
            grid.push(Span::new(start, start + len));
            start += step;
        }
    }
    grid.sort_by_key(|s| s.start);
    grid
}

/// Every grid slot with its verdict, ordered by start.
///
/// Checks run in order: lead time, booking window, busy overlap, student
/// preference, daily cap. The cap fills earliest-first from what is already
/// booked, and only slots that passed every other check take a seat.
pub fn evaluate_slots(open: &[Span], q: &SlotQuery<'_>) -> Vec<SlotVerdict> {
    let earliest = q.now + q.preference.lead_time_ms();
    let today = local_date(q.now, &q.tz);
    let window_days = q.preference.booking_window_days as i64;
    let cap = q.preference.max_sessions_per_day;
    let mut per_day: HashMap<NaiveDate, u32> = q.booked_per_day.clone();

    slot_grid(open, q.preference)
        .into_iter()
        .map(|span| {
            let date = local_date(span.start, &q.tz);
            let verdict = if span.start < earliest {
                Err(SlotRejection::LeadTime)
            } else if (date - today).num_days() > window_days {
                Err(SlotRejection::BookingWindow)
            } else if overlaps_any(q.busy, &span) {
                Err(SlotRejection::BufferConflict)
            } else if !slot_matches(&span, q.preferences, &q.tz) {
                Err(SlotRejection::StudentPreference)
            } else {
                let count = per_day.entry(date).or_insert(0);
                if *count >= cap {
                    Err(SlotRejection::DailyLimit)
                } else {
                    *count += 1;
                    Ok(())
                }
            };
            SlotVerdict { span, verdict }
        })
        .collect()
}

/// Accepted slots only.
pub fn generate_slots(open: &[Span], q: &SlotQuery<'_>) -> Vec<Span> {
    evaluate_slots(open, q)
        .into_iter()
        .filter(|v| v.verdict.is_ok())
        .map(|v| v.span)
        .collect()
}

/// `busy` sorted by start.
fn overlaps_any(busy: &[Span], span: &Span) -> bool {
    let right_bound = busy.partition_point(|b| b.start < span.end);
    busy[..right_bound].iter().any(|b| b.end > span.start)
}
