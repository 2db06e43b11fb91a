use crate::model::Ms;

/// 1970-01-01. Anything earlier is a client bug.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// A single claim may not span more than a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_ITEMS: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTE_LEN: usize = 2_000;
pub const MAX_PHOTOS_PER_ACTIVITY: usize = 10;
pub const MAX_PHOTO_REF_LEN: usize = 512;
pub const MAX_USER_ID_LEN: usize = 128;

/// Pending claims an item accepts before further requests are refused.
pub const MAX_PENDING_CLAIMS_PER_ITEM: usize = 5;
/// Total claims (any status) retained per item.
pub const MAX_CLAIMS_PER_ITEM: usize = 10_000;
pub const MAX_UNAVAILABILITY_PER_OWNER: usize = 1_000;
pub const MAX_ALERTS_PER_ITEM: usize = 1_000;

/// Most recent activity rows returned by `lease_activity`.
pub const ACTIVITY_PAGE_SIZE: usize = 50;
/// Notifications retained per recipient; oldest are evicted first.
pub const MAX_INBOX_LEN: usize = 500;
