//! Hard caps applied before any state is touched.

pub const MAX_ROOM_TYPES_PER_TENANT: usize = 10_000;
pub const MAX_RATE_PLANS_PER_ROOM_TYPE: usize = 100_000;
/// Holds and bookings that have not checked out yet.
pub const MAX_OPEN_ALLOCATIONS_PER_ROOM_TYPE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 1024;
pub const MAX_UNITS_PER_ROOM_TYPE: u32 = 10_000;

/// Longest bookable stay, in nights.
pub const MAX_STAY_NIGHTS: i64 = 90;
/// Longest window for rate/availability reads, in nights.
pub const MAX_QUERY_NIGHTS: i64 = 731;
/// Longest single rate plan, in days (ten years).
pub const MAX_RATE_PLAN_DAYS: i64 = 3_653;

/// Dates outside `[MIN_VALID_YEAR, MAX_VALID_YEAR]` are rejected.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2200;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;
