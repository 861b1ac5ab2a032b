//! Hard limits on caller input. Exceeding any of these is `LimitExceeded`.

use crate::model::{DAY_MS, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest date range a single availability or preview query may cover.
pub const MAX_QUERY_DAYS: i64 = 120;
pub const MAX_QUERY_WINDOW_MS: Ms = MAX_QUERY_DAYS * DAY_MS;
/// Longest look-back for tutor analytics.
pub const MAX_ANALYTICS_DAYS: u32 = 365;

pub const MAX_CANDIDATE_SLOTS: usize = 64;
pub const MAX_BATCH_SIZE: usize = 64;
pub const MAX_BLOCKS_PER_TUTOR: usize = 512;
pub const MAX_EXCEPTIONS_PER_TUTOR: usize = 4096;
pub const MAX_PREFERENCE_ROWS: usize = 128;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_TIMEZONE_LEN: usize = 64;

/// Policy bounds for module preferences.
pub const MAX_SLOT_LENGTH_MINUTES: u32 = 8 * 60;
pub const MAX_BUFFER_MINUTES: u32 = 4 * 60;
pub const MAX_BOOKING_WINDOW_DAYS: u32 = 365;
pub const MAX_SESSIONS_PER_DAY: u32 = 48;
