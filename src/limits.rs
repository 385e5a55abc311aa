//! Hard engine limits. These bound work per call regardless of configuration.

pub const MAX_TENANT_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 512;
pub const MAX_MEMBER_NAME_LEN: usize = 256;

/// Safety ceiling on occurrences emitted by a single expansion.
pub const MAX_GENERATED_OCCURRENCES: u32 = 500;
pub const MAX_RECURRENCE_INTERVAL: u32 = 1000;

pub const MAX_BULK_CHECKIN: usize = 1000;
pub const MAX_BULK_ASSIGNMENT: usize = 200;
pub const MAX_EVENT_CAPACITY: u32 = 100_000;

/// Longest single booking window the resolver will scan, in days.
pub const MAX_BOOKING_SPAN_DAYS: i64 = 31;

/// How far ahead a member's future bookings are read when counting concurrency.
pub const USAGE_LOOKAHEAD_DAYS: i64 = 3650;

/// Largest span any configured duration may take, in days.
pub const MAX_CONFIG_SPAN_DAYS: i64 = 3650;
