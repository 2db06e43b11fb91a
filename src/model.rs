use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every timestamp uses this.
pub type Ms = i64;

/// Authenticated subject id, as handed over by the identity layer.
pub type UserId = String;

/// Actor recorded on activities appended by the overdue sweep.
pub const SYSTEM_ACTOR: &str = "system";

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// The one-hour handover window starting at `start`.
    pub fn hour_from(start: Ms) -> Self {
        Self::new(start, start + HOUR_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

pub fn is_hour_aligned(t: Ms) -> bool {
    t.rem_euclid(HOUR_MS) == 0
}

/// `t` falls inside the 24h day that begins at `day_start`.
pub fn is_on_day(t: Ms, day_start: Ms) -> bool {
    day_start <= t && t < day_start + DAY_MS
}

/// Midnight of the local day containing `t`, for a zone `utc_offset_ms`
/// east of UTC.
pub fn start_of_day(t: Ms, utc_offset_ms: Ms) -> Ms {
    let local = t + utc_offset_ms;
    local - local.rem_euclid(DAY_MS) - utc_offset_ms
}

/// A giveaway is handed over during exactly one 24h day starting on an hour boundary.
pub fn is_single_day(span: &Span) -> bool {
    span.end == span.start + DAY_MS && is_hour_aligned(span.start)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    /// Shorter than a day, hour-aligned; handover windows are filled in on approval.
    Intraday,
    MultiDay,
}

impl LeaseKind {
    /// `None` when a sub-day span is not aligned to the hour.
    pub fn classify(span: &Span) -> Option<Self> {
        if span.duration_ms() < DAY_MS {
            if is_hour_aligned(span.start) && is_hour_aligned(span.end) {
                Some(Self::Intraday)
            } else {
                None
            }
        } else {
            Some(Self::MultiDay)
        }
    }
}

/// Optional per-item bounds on loan length, counted in started days.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseBounds {
    pub min_days: Option<u32>,
    pub max_days: Option<u32>,
}

impl LeaseBounds {
    pub fn is_valid(&self) -> bool {
        match (self.min_days, self.max_days) {
            (Some(0), _) | (_, Some(0)) => false,
            (Some(min), Some(max)) => min <= max,
            _ => true,
        }
    }

    pub fn admits(&self, span: &Span) -> bool {
        let days = span.duration_ms().div_euclid(DAY_MS)
            + i64::from(span.duration_ms().rem_euclid(DAY_MS) != 0);
        self.min_days.is_none_or(|min| days >= i64::from(min))
            && self.max_days.is_none_or(|max| days <= i64::from(max))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: Ulid,
    /// Reassigned to the claimant when a giveaway is picked up.
    pub owner_id: UserId,
    pub name: Option<String>,
    pub giveaway: bool,
    pub bounds: LeaseBounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimStatus {
    Pending,
    Approved,
    Rejected,
}

impl ClaimStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Pending => "pending",
            ClaimStatus::Approved => "approved",
            ClaimStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    Requested,
    Approved,
    Rejected,
    PickupProposed,
    PickupApproved,
    PickedUp,
    ReturnProposed,
    ReturnApproved,
    Returned,
    Transferred,
    Expired,
    Missing,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::Requested => "requested",
            ActivityKind::Approved => "approved",
            ActivityKind::Rejected => "rejected",
            ActivityKind::PickupProposed => "pickup_proposed",
            ActivityKind::PickupApproved => "pickup_approved",
            ActivityKind::PickedUp => "picked_up",
            ActivityKind::ReturnProposed => "return_proposed",
            ActivityKind::ReturnApproved => "return_approved",
            ActivityKind::Returned => "returned",
            ActivityKind::Transferred => "transferred",
            ActivityKind::Expired => "expired",
            ActivityKind::Missing => "missing",
        }
    }
}

impl FromStr for ActivityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "requested" => ActivityKind::Requested,
            "approved" => ActivityKind::Approved,
            "rejected" => ActivityKind::Rejected,
            "pickup_proposed" => ActivityKind::PickupProposed,
            "pickup_approved" => ActivityKind::PickupApproved,
            "picked_up" => ActivityKind::PickedUp,
            "return_proposed" => ActivityKind::ReturnProposed,
            "return_approved" => ActivityKind::ReturnApproved,
            "returned" => ActivityKind::Returned,
            "transferred" => ActivityKind::Transferred,
            "expired" => ActivityKind::Expired,
            "missing" => ActivityKind::Missing,
            other => return Err(format!("unknown activity type: {other}")),
        })
    }
}

/// The two handover moments that are negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Milestone {
    Pickup,
    Return,
}

impl Milestone {
    pub fn proposed(self) -> ActivityKind {
        match self {
            Milestone::Pickup => ActivityKind::PickupProposed,
            Milestone::Return => ActivityKind::ReturnProposed,
        }
    }

    pub fn approved(self) -> ActivityKind {
        match self {
            Milestone::Pickup => ActivityKind::PickupApproved,
            Milestone::Return => ActivityKind::ReturnApproved,
        }
    }

    pub fn confirmed(self) -> ActivityKind {
        match self {
            Milestone::Pickup => ActivityKind::PickedUp,
            Milestone::Return => ActivityKind::Returned,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Milestone::Pickup => "pickup",
            Milestone::Return => "return",
        }
    }
}

/// Correlates a window approval with the proposal it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalId {
    Random(Ulid),
    AutoPickup(Ulid),
    AutoReturn(Ulid),
}

impl ProposalId {
    pub fn fresh() -> Self {
        ProposalId::Random(Ulid::new())
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalId::Random(id) => write!(f, "{id}"),
            ProposalId::AutoPickup(claim) => write!(f, "auto-pickup-{claim}"),
            ProposalId::AutoReturn(claim) => write!(f, "auto-return-{claim}"),
        }
    }
}

impl FromStr for ProposalId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("auto-pickup-") {
            Ulid::from_string(rest).map(ProposalId::AutoPickup)
        } else if let Some(rest) = s.strip_prefix("auto-return-") {
            Ulid::from_string(rest).map(ProposalId::AutoReturn)
        } else {
            Ulid::from_string(s).map(ProposalId::Random)
        }
    }
}

/// One row of the append-only lease log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseActivity {
    pub id: Ulid,
    pub item_id: Ulid,
    pub claim_id: Ulid,
    pub kind: ActivityKind,
    pub actor_id: UserId,
    pub created_at: Ms,
    pub proposal_id: Option<ProposalId>,
    pub window: Option<Span>,
    pub note: Option<String>,
    pub photos: Vec<String>,
}

/// Latest timestamp of each milestone activity. Always derived from the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseCaches {
    pub requested_at: Option<Ms>,
    pub approved_at: Option<Ms>,
    pub rejected_at: Option<Ms>,
    pub picked_up_at: Option<Ms>,
    pub returned_at: Option<Ms>,
    pub expired_at: Option<Ms>,
    pub missing_at: Option<Ms>,
    pub transferred_at: Option<Ms>,
}

impl LeaseCaches {
    pub fn record(&mut self, activity: &LeaseActivity) {
        let at = Some(activity.created_at);
        match activity.kind {
            ActivityKind::Requested => self.requested_at = at,
            ActivityKind::Approved => self.approved_at = at,
            ActivityKind::Rejected => self.rejected_at = at,
            ActivityKind::PickedUp => self.picked_up_at = at,
            ActivityKind::Returned => self.returned_at = at,
            ActivityKind::Expired => self.expired_at = at,
            ActivityKind::Missing => self.missing_at = at,
            ActivityKind::Transferred => self.transferred_at = at,
            ActivityKind::PickupProposed
            | ActivityKind::PickupApproved
            | ActivityKind::ReturnProposed
            | ActivityKind::ReturnApproved => {}
        }
    }

    pub fn from_activity(activity: &[LeaseActivity]) -> Self {
        let mut caches = Self::default();
        for a in activity {
            caches.record(a);
        }
        caches
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: Ulid,
    pub item_id: Ulid,
    pub claimer_id: UserId,
    pub status: ClaimStatus,
    pub span: Span,
    pub caches: LeaseCaches,
}

impl Claim {
    /// Approved and still holding the item's calendar.
    pub fn is_active_approved(&self) -> bool {
        self.status == ClaimStatus::Approved
            && self.caches.expired_at.is_none()
            && self.caches.returned_at.is_none()
            && self.caches.transferred_at.is_none()
    }

    /// Pending, or approved and still active.
    pub fn is_open(&self) -> bool {
        self.status == ClaimStatus::Pending || self.is_active_approved()
    }
}

#[derive(Debug, Clone)]
pub struct ClaimState {
    pub claim: Claim,
    /// Append order; `created_at` is non-decreasing.
    pub activity: Vec<LeaseActivity>,
}

impl ClaimState {
    pub fn apply_activity(&mut self, activity: LeaseActivity) {
        match activity.kind {
            ActivityKind::Approved => self.claim.status = ClaimStatus::Approved,
            ActivityKind::Rejected => self.claim.status = ClaimStatus::Rejected,
            _ => {}
        }
        self.claim.caches.record(&activity);
        self.activity.push(activity);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unavailability {
    pub id: Ulid,
    pub owner_id: UserId,
    pub span: Span,
    pub note: Option<String>,
}

/// Per-owner blocks shared by every item the owner holds.
#[derive(Debug, Clone, Default)]
pub struct OwnerCalendar {
    pub blocks: BTreeMap<Ulid, Unavailability>,
}

impl OwnerCalendar {
    pub fn overlapping<'a>(&'a self, span: &'a Span) -> impl Iterator<Item = &'a Unavailability> + 'a {
        self.blocks.values().filter(move |b| b.span.overlaps(span))
    }
}

/// The side of a lease a rating is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RatedRole {
    Lender,
    Borrower,
}

impl RatedRole {
    pub fn as_str(self) -> &'static str {
        match self {
            RatedRole::Lender => "lender",
            RatedRole::Borrower => "borrower",
        }
    }
}

impl FromStr for RatedRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lender" => Ok(RatedRole::Lender),
            "borrower" => Ok(RatedRole::Borrower),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One party's verdict on the other after an approved lease has begun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rating {
    pub id: Ulid,
    pub claim_id: Ulid,
    pub item_id: Ulid,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    /// Role of `to_user_id` in the lease.
    pub role: RatedRole,
    /// 1 to 5.
    pub stars: u8,
    pub comment: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct ItemState {
    pub item: Item,
    pub claims: BTreeMap<Ulid, ClaimState>,
    /// Users waiting for an `item_available` notification.
    pub watchers: BTreeSet<UserId>,
}

impl ItemState {
    pub fn new(item: Item) -> Self {
        Self {
            item,
            claims: BTreeMap::new(),
            watchers: BTreeSet::new(),
        }
    }

    pub fn active_approved(&self) -> impl Iterator<Item = &Claim> {
        self.claims
            .values()
            .map(|c| &c.claim)
            .filter(|c| c.is_active_approved())
    }

    pub fn pending_count(&self) -> usize {
        self.claims
            .values()
            .filter(|c| c.claim.status == ClaimStatus::Pending)
            .count()
    }
}

/// WAL record. One record is one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ItemListed {
        id: Ulid,
        owner_id: UserId,
        name: Option<String>,
        giveaway: bool,
        bounds: LeaseBounds,
    },
    ItemDelisted {
        id: Ulid,
    },
    UnavailabilityAdded {
        id: Ulid,
        owner_id: UserId,
        span: Span,
        note: Option<String>,
    },
    UnavailabilityRemoved {
        id: Ulid,
        owner_id: UserId,
    },
    ClaimRequested {
        id: Ulid,
        item_id: Ulid,
        claimer_id: UserId,
        span: Span,
        activity: LeaseActivity,
    },
    /// Activities of one transition, applied in order. A `transferred`
    /// activity hands the item to the claimant.
    LeaseRecorded {
        item_id: Ulid,
        claim_id: Ulid,
        activities: Vec<LeaseActivity>,
    },
    ClaimWithdrawn {
        id: Ulid,
        item_id: Ulid,
        clear_alerts: bool,
    },
    /// Compaction snapshot of a claim; no side effects on the item.
    ClaimRestored {
        claim: Claim,
        activity: Vec<LeaseActivity>,
    },
    AlertSubscribed {
        item_id: Ulid,
        user_id: UserId,
    },
    AlertCleared {
        item_id: Ulid,
        user_id: UserId,
    },
    /// Ratings outlive the item they were given for.
    RatingRecorded {
        rating: Rating,
    },
}

impl Event {
    /// Item whose state this record touches, if any.
    pub fn item_id(&self) -> Option<Ulid> {
        match self {
            Event::ItemListed { id, .. } | Event::ItemDelisted { id } => Some(*id),
            Event::ClaimRequested { item_id, .. }
            | Event::LeaseRecorded { item_id, .. }
            | Event::ClaimWithdrawn { item_id, .. }
            | Event::AlertSubscribed { item_id, .. }
            | Event::AlertCleared { item_id, .. } => Some(*item_id),
            Event::ClaimRestored { claim, .. } => Some(claim.item_id),
            Event::UnavailabilityAdded { .. }
            | Event::UnavailabilityRemoved { .. }
            | Event::RatingRecorded { .. } => None,
        }
    }
}
