use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Refuses empty or inverted ranges, then applies the global limits.
pub(crate) fn check_span(span: &Span) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::Invalid("end must be after start"));
    }
    validate_span(span)
}

pub(crate) fn validate_evidence(note: Option<&str>, photos: &[String]) -> Result<(), EngineError> {
    if note.is_some_and(|n| n.len() > MAX_NOTE_LEN) {
        return Err(EngineError::LimitExceeded("note too long"));
    }
    if photos.len() > MAX_PHOTOS_PER_ACTIVITY {
        return Err(EngineError::LimitExceeded("too many photos"));
    }
    if photos.iter().any(|p| p.is_empty() || p.len() > MAX_PHOTO_REF_LEN) {
        return Err(EngineError::Invalid("photo reference must be 1..512 bytes"));
    }
    Ok(())
}

pub(crate) fn validate_user(user: &str) -> Result<(), EngineError> {
    if user.is_empty() {
        return Err(EngineError::Unauthenticated);
    }
    if user.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    if user == SYSTEM_ACTOR {
        return Err(EngineError::Unauthorized("reserved user id"));
    }
    Ok(())
}

/// Shape and timing rules for a new request. Returns the lease kind.
pub(crate) fn check_request_window(
    item: &Item,
    span: &Span,
    now: Ms,
    utc_offset_ms: Ms,
) -> Result<LeaseKind, EngineError> {
    let kind = LeaseKind::classify(span)
        .ok_or(EngineError::Invalid("time must be aligned to the hour"))?;

    if item.giveaway {
        if !is_single_day(span) {
            return Err(EngineError::Invalid(
                "giveaway pickup must cover exactly one day starting on the hour",
            ));
        }
        if span.end <= now {
            return Err(EngineError::Invalid("pickup day is in the past"));
        }
        return Ok(kind);
    }

    match kind {
        LeaseKind::Intraday => {
            if span.start <= now {
                return Err(EngineError::Invalid("start must be in the future"));
            }
        }
        LeaseKind::MultiDay => {
            if span.start < start_of_day(now, utc_offset_ms) {
                return Err(EngineError::Invalid("start date is in the past"));
            }
            if !item.bounds.admits(span) {
                return Err(EngineError::Invalid("loan length outside the item's bounds"));
            }
        }
    }
    Ok(kind)
}

pub(crate) fn check_owner_calendar(calendar: Option<&OwnerCalendar>, span: &Span) -> Result<(), EngineError> {
    if let Some(cal) = calendar
        && cal.overlapping(span).next().is_some() {
            return Err(EngineError::Conflict("owner is unavailable for these dates"));
        }
    Ok(())
}

/// No two active approved claims on one item may overlap.
pub(crate) fn check_no_double_booking(
    item: &ItemState,
    span: &Span,
    except: Option<Ulid>,
) -> Result<(), EngineError> {
    let clash = item
        .active_approved()
        .any(|c| Some(c.id) != except && c.span.overlaps(span));
    if clash {
        return Err(EngineError::Conflict("dates overlap an approved claim"));
    }
    Ok(())
}

pub(crate) fn check_self_overlap(item: &ItemState, claimer: &str, span: &Span) -> Result<(), EngineError> {
    let clash = item
        .claims
        .values()
        .map(|c| &c.claim)
        .any(|c| c.claimer_id == claimer && c.is_open() && c.span.overlaps(span));
    if clash {
        return Err(EngineError::Conflict("you already have a claim for these dates"));
    }
    Ok(())
}

pub(crate) fn check_waitlist(item: &ItemState) -> Result<(), EngineError> {
    if item.pending_count() >= MAX_PENDING_CLAIMS_PER_ITEM {
        return Err(EngineError::Conflict("waitlist is full"));
    }
    if item.claims.len() >= MAX_CLAIMS_PER_ITEM {
        return Err(EngineError::LimitExceeded("too many claims on item"));
    }
    Ok(())
}
