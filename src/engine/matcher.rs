use chrono::FixedOffset;

use crate::model::*;

/// A slot passes if any preference row accepts its local start. An empty
/// preference set accepts everything.
pub fn slot_matches(slot: &Span, preferences: &[StudentPreference], tz: &FixedOffset) -> bool {
    if preferences.is_empty() {
        return true;
    }
    let start = local_datetime(slot.start, tz);
    preferences.iter().any(|p| p.matches(start))
}

pub fn filter_slots(slots: &[Span], preferences: &[StudentPreference], tz: &FixedOffset) -> Vec<Span> {
    slots
        .iter()
        .filter(|s| slot_matches(s, preferences, tz))
        .copied()
        .collect()
}
