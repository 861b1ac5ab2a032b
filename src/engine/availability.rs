use chrono::{FixedOffset, NaiveDate};
use ulid::Ulid;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Open intervals per local date for `[from, to]` (inclusive).
///
/// Blocks: module-specific blocks for `module_id` OVERRIDE tutor-wide blocks
/// on a date where any apply; overlapping blocks UNION.
/// Exceptions: additions are unioned in, then blackouts are subtracted, so a
/// blackout always wins on its date.
pub fn resolve_availability(
    blocks: &[AvailabilityBlock],
    exceptions: &[AvailabilityException],
    module_id: Option<Ulid>,
    from: NaiveDate,
    to: NaiveDate,
    tz: &FixedOffset,
) -> Vec<DayAvailability> {
    from.iter_days()
        .take_while(|d| *d <= to)
        .map(|date| DayAvailability {
            date,
            open: resolve_day(blocks, exceptions, module_id, date, tz),
        })
        .collect()
}

fn resolve_day(
    blocks: &[AvailabilityBlock],
    exceptions: &[AvailabilityException],
    module_id: Option<Ulid>,
    date: NaiveDate,
    tz: &FixedOffset,
) -> Vec<Span> {
    let applicable: Vec<&AvailabilityBlock> =
        blocks.iter().filter(|b| b.applies_on(date)).collect();

    let specific: Vec<&AvailabilityBlock> = match module_id {
        Some(m) => applicable
            .iter()
            .copied()
            .filter(|b| b.module_id == Some(m))
            .collect(),
        None => Vec::new(),
    };
    let chosen = if specific.is_empty() {
        applicable
            .into_iter()
            .filter(|b| b.module_id.is_none())
            .collect()
    } else {
        specific
    };

    let mut open: Vec<Span> = chosen.iter().map(|b| b.span_on(date, tz)).collect();

    let todays: Vec<&AvailabilityException> =
        exceptions.iter().filter(|e| e.date == date).collect();

    // Step 1: additions
    for exception in todays.iter().filter(|e| e.kind == ExceptionKind::Addition) {
        if let Some(span) = exception_span(exception, blocks, tz) {
            open.push(span);
        }
    }
    open.sort_by_key(|s| s.start);
    open = merge_overlapping(&open);

    // Step 2: blackouts
    let mut blocked: Vec<Span> = todays
        .iter()
        .filter(|e| e.kind == ExceptionKind::Blackout)
        .filter_map(|e| match (e.time_range(), e.block_id) {
            (None, None) => Some(day_span(date, tz)),
            _ => exception_span(e, blocks, tz),
        })
        .collect();
    if !blocked.is_empty() {
        blocked.sort_by_key(|s| s.start);
        blocked = merge_overlapping(&blocked);
        open = subtract_intervals(&open, &blocked);
    }

    open
}

/// The exception's own time range, else the referenced block's span on the
/// exception's date.
fn exception_span(
    exception: &AvailabilityException,
    blocks: &[AvailabilityBlock],
    tz: &FixedOffset,
) -> Option<Span> {
    if let Some((start, end)) = exception.time_range() {
        return Some(local_span(exception.date, start, end, tz));
    }
    let block_id = exception.block_id?;
    blocks
        .iter()
        .find(|b| b.id == block_id)
        .map(|b| b.span_on(exception.date, tz))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveTime, Offset, Utc, Weekday};

    use super::*;

    fn utc() -> FixedOffset {
        Utc.fix()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    /// 2024-01-01
    fn monday() -> NaiveDate {
        date(2024, 1, 1)
    }

    fn at(d: NaiveDate, h: u32, m: u32) -> Ms {
        local_ms(d.and_time(hm(h, m)), &utc())
    }

    fn block(tutor: Ulid, module: Option<Ulid>, weekday: Weekday, start: NaiveTime, end: NaiveTime) -> AvailabilityBlock {
        AvailabilityBlock {
            id: Ulid::new(),
            tutor_id: tutor,
            module_id: module,
            weekday,
            start,
            end,
            recurring: true,
            effective_from: date(2023, 1, 1),
            effective_until: None,
            timezone: "UTC".into(),
        }
    }

    fn exception(tutor: Ulid, d: NaiveDate, kind: ExceptionKind, range: Option<(NaiveTime, NaiveTime)>) -> AvailabilityException {
        AvailabilityException {
            id: Ulid::new(),
            tutor_id: tutor,
            block_id: None,
            date: d,
            kind,
            start: range.map(|r| r.0),
            end: range.map(|r| r.1),
            reason: None,
        }
    }

    fn single_day(blocks: &[AvailabilityBlock], exceptions: &[AvailabilityException], module: Option<Ulid>, d: NaiveDate) -> Vec<Span> {
        let days = resolve_availability(blocks, exceptions, module, d, d, &utc());
        assert_eq!(days.len(), 1);
        days.into_iter().next().unwrap().open
    }

    #[test]
    fn blackout_splits_block() {
        let tutor = Ulid::new();
        let d = monday();
        let blocks = vec![block(tutor, None, Weekday::Mon, hm(8, 0), hm(17, 0))];
        let exceptions = vec![exception(tutor, d, ExceptionKind::Blackout, Some((hm(9, 0), hm(12, 0))))];
        assert_eq!(
            single_day(&blocks, &exceptions, None, d),
            vec![Span::new(at(d, 8, 0), at(d, 9, 0)), Span::new(at(d, 12, 0), at(d, 17, 0))]
        );
    }

    #[test]
    fn overlapping_blocks_union() {
        let tutor = Ulid::new();
        let d = monday();
        let blocks = vec![
            block(tutor, None, Weekday::Mon, hm(9, 0), hm(12, 0)),
            block(tutor, None, Weekday::Mon, hm(11, 0), hm(14, 0)),
            block(tutor, None, Weekday::Mon, hm(14, 0), hm(15, 0)),
        ];
        assert_eq!(single_day(&blocks, &[], None, d), vec![Span::new(at(d, 9, 0), at(d, 15, 0))]);
    }

    #[test]
    fn range_covers_each_date_and_weekday() {
        let tutor = Ulid::new();
        let blocks = vec![block(tutor, None, Weekday::Tue, hm(9, 0), hm(10, 0))];
        let days = resolve_availability(&blocks, &[], None, monday(), date(2024, 1, 7), &utc());
        assert_eq!(days.len(), 7);
        let open_days: Vec<NaiveDate> = days.iter().filter(|d| !d.open.is_empty()).map(|d| d.date).collect();
        assert_eq!(open_days, vec![date(2024, 1, 2)]);
    }

    #[test]
    fn module_blocks_override_tutor_wide() {
        let tutor = Ulid::new();
        let maths = Ulid::new();
        let physics = Ulid::new();
        let d = monday();
        let blocks = vec![
            block(tutor, None, Weekday::Mon, hm(8, 0), hm(17, 0)),
            block(tutor, Some(maths), Weekday::Mon, hm(13, 0), hm(15, 0)),
        ];
        assert_eq!(single_day(&blocks, &[], Some(maths), d), vec![Span::new(at(d, 13, 0), at(d, 15, 0))]);
        // another module falls back to tutor-wide blocks
        assert_eq!(single_day(&blocks, &[], Some(physics), d), vec![Span::new(at(d, 8, 0), at(d, 17, 0))]);
        // no module: module-specific blocks never apply
        assert_eq!(single_day(&blocks, &[], None, d), vec![Span::new(at(d, 8, 0), at(d, 17, 0))]);
    }

    #[test]
    fn module_override_is_per_date() {
        let tutor = Ulid::new();
        let maths = Ulid::new();
        let blocks = vec![
            block(tutor, None, Weekday::Mon, hm(8, 0), hm(10, 0)),
            block(tutor, None, Weekday::Tue, hm(8, 0), hm(10, 0)),
            block(tutor, Some(maths), Weekday::Mon, hm(18, 0), hm(19, 0)),
        ];
        let tuesday = date(2024, 1, 2);
        assert_eq!(
            single_day(&blocks, &[], Some(maths), tuesday),
            vec![Span::new(at(tuesday, 8, 0), at(tuesday, 10, 0))]
        );
    }

    #[test]
    fn addition_opens_time_outside_blocks() {
        let tutor = Ulid::new();
        let saturday = date(2024, 1, 6);
        let exceptions = vec![exception(tutor, saturday, ExceptionKind::Addition, Some((hm(10, 0), hm(12, 0))))];
        assert_eq!(
            single_day(&[], &exceptions, None, saturday),
            vec![Span::new(at(saturday, 10, 0), at(saturday, 12, 0))]
        );
    }

    #[test]
    fn addition_extends_adjacent_block() {
        let tutor = Ulid::new();
        let d = monday();
        let blocks = vec![block(tutor, None, Weekday::Mon, hm(9, 0), hm(12, 0))];
        let exceptions = vec![exception(tutor, d, ExceptionKind::Addition, Some((hm(12, 0), hm(14, 0))))];
        assert_eq!(single_day(&blocks, &exceptions, None, d), vec![Span::new(at(d, 9, 0), at(d, 14, 0))]);
    }

    #[test]
    fn blackout_wins_over_addition() {
        let tutor = Ulid::new();
        let d = monday();
        let exceptions = vec![
            exception(tutor, d, ExceptionKind::Addition, Some((hm(18, 0), hm(20, 0)))),
            exception(tutor, d, ExceptionKind::Blackout, Some((hm(18, 0), hm(19, 0)))),
        ];
        assert_eq!(single_day(&[], &exceptions, None, d), vec![Span::new(at(d, 19, 0), at(d, 20, 0))]);
    }

    #[test]
    fn blackout_without_range_clears_day() {
        let tutor = Ulid::new();
        let d = monday();
        let blocks = vec![
            block(tutor, None, Weekday::Mon, hm(8, 0), hm(10, 0)),
            block(tutor, None, Weekday::Mon, hm(14, 0), hm(16, 0)),
        ];
        let exceptions = vec![exception(tutor, d, ExceptionKind::Blackout, None)];
        assert!(single_day(&blocks, &exceptions, None, d).is_empty());
        // next Monday untouched
        let next = date(2024, 1, 8);
        assert_eq!(single_day(&blocks, &exceptions, None, next).len(), 2);
    }

    #[test]
    fn blackout_by_block_reference() {
        let tutor = Ulid::new();
        let d = monday();
        let morning = block(tutor, None, Weekday::Mon, hm(8, 0), hm(10, 0));
        let afternoon = block(tutor, None, Weekday::Mon, hm(14, 0), hm(16, 0));
        let mut cancel_morning = exception(tutor, d, ExceptionKind::Blackout, None);
        cancel_morning.block_id = Some(morning.id);
        let blocks = vec![morning, afternoon];
        assert_eq!(
            single_day(&blocks, &[cancel_morning], None, d),
            vec![Span::new(at(d, 14, 0), at(d, 16, 0))]
        );
    }

    #[test]
    fn non_recurring_block_only_first_week() {
        let tutor = Ulid::new();
        let mut once = block(tutor, None, Weekday::Mon, hm(9, 0), hm(10, 0));
        once.recurring = false;
        once.effective_from = monday();
        assert_eq!(single_day(std::slice::from_ref(&once), &[], None, monday()).len(), 1);
        assert!(single_day(&[once], &[], None, date(2024, 1, 8)).is_empty());
    }

    #[test]
    fn resolves_in_reference_offset() {
        let sast = FixedOffset::east_opt(2 * 3600).unwrap();
        let tutor = Ulid::new();
        let blocks = vec![block(tutor, None, Weekday::Mon, hm(8, 0), hm(9, 0))];
        let days = resolve_availability(&blocks, &[], None, monday(), monday(), &sast);
        // 08:00 at +02:00 is 06:00 UTC
        assert_eq!(days[0].open, vec![Span::new(at(monday(), 6, 0), at(monday(), 7, 0))]);
    }

    #[test]
    fn subtract_and_merge() {
        let merged = merge_overlapping(&[Span::new(0, 10), Span::new(10, 20), Span::new(30, 40)]);
        assert_eq!(merged, vec![Span::new(0, 20), Span::new(30, 40)]);
        let left = subtract_intervals(&merged, &[Span::new(5, 15), Span::new(35, 50)]);
        assert_eq!(left, vec![Span::new(0, 5), Span::new(15, 20), Span::new(30, 35)]);
    }
}
