//! Hard caps on input sizes.

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 8 * 1024;
pub const MAX_NEEDED_RESOURCES: usize = 64;
pub const MAX_PARTICIPANTS: usize = 1024;
pub const MAX_GROUP_NAME_LEN: usize = 128;
pub const MAX_PATTERNS_PER_GROUP: usize = 256;
pub const MAX_PATTERN_LEN: usize = 128;
/// Upper bound on occurrences one materialization run may insert for a series.
pub const MAX_OCCURRENCES_PER_RUN: usize = 4096;
/// Largest lead-day or horizon setting accepted from configuration (about ten years).
pub const MAX_SCHEDULING_DAYS: i64 = 3660;
