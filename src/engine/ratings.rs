use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_NOTE_LEN;
use crate::model::*;

use super::conflict::validate_user;
use super::{store, Engine, EngineError, SharedItemState};

/// Star averages a user has received, rounded to one decimal.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingSummary {
    pub user_id: UserId,
    pub total: usize,
    pub average: Option<f64>,
    pub as_lender: RoleSummary,
    pub as_borrower: RoleSummary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoleSummary {
    pub count: usize,
    pub average: Option<f64>,
}

/// A lease the user took part in and has not rated yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRating {
    pub claim_id: Ulid,
    pub item_id: Ulid,
    pub item_name: Option<String>,
    pub target_role: RatedRole,
    pub target_user_id: UserId,
    pub span: Span,
}

impl Engine {
    /// Rate the other party of an approved claim once its lease has begun.
    /// Each participant rates a claim at most once.
    pub async fn rate_claim(
        &self,
        claim_id: Ulid,
        actor: &str,
        stars: i64,
        comment: Option<String>,
    ) -> Result<Ulid, EngineError> {
        validate_user(actor)?;
        let stars = u8::try_from(stars)
            .ok()
            .filter(|s| (1..=5).contains(s))
            .ok_or(EngineError::Invalid("stars must be an integer from 1 to 5"))?;
        if comment.as_ref().is_some_and(|c| c.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("comment too long"));
        }

        let _gate = self.commit_gate.read().await;
        // The item write lock serializes ratings of one claim.
        let guard = self.resolve_claim_write(&claim_id).await?;
        let now = self.clock.now_ms();
        let (role, to_user_id) = rating_target(&guard.item, &guard.claims[&claim_id], actor, now)?;
        if self.has_rated(claim_id, actor) {
            return Err(EngineError::AlreadyExists(claim_id));
        }

        let rating = Rating {
            id: Ulid::new(),
            claim_id,
            item_id: guard.item.id,
            from_user_id: actor.to_string(),
            to_user_id,
            role,
            stars,
            comment,
            created_at: now,
        };
        self.wal_append(&Event::RatingRecorded { rating: rating.clone() }).await?;
        store::apply_rating(&self.ratings, &rating);
        metrics::counter!(crate::observability::RATINGS_TOTAL, "role" => role.as_str()).increment(1);
        info!(claim = %claim_id, from = actor, to = %rating.to_user_id, stars, "rating recorded");
        Ok(rating.id)
    }

    /// Ratings `user` has received, newest first.
    pub fn ratings_for_user(&self, user: &str, role: Option<RatedRole>) -> Vec<Rating> {
        let mut out = Vec::new();
        for entry in self.ratings.iter() {
            out.extend(
                entry
                    .value()
                    .iter()
                    .filter(|r| r.to_user_id == user && role.is_none_or(|role| r.role == role))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        out
    }

    pub fn rating_summary(&self, user: &str) -> RatingSummary {
        let received = self.ratings_for_user(user, None);
        let by_role = |role: RatedRole| {
            let stars: Vec<u8> = received.iter().filter(|r| r.role == role).map(|r| r.stars).collect();
            RoleSummary {
                count: stars.len(),
                average: average(&stars),
            }
        };
        let all: Vec<u8> = received.iter().map(|r| r.stars).collect();
        RatingSummary {
            user_id: user.to_string(),
            total: all.len(),
            average: average(&all),
            as_lender: by_role(RatedRole::Lender),
            as_borrower: by_role(RatedRole::Borrower),
        }
    }

    /// Claims the actor may still rate.
    pub async fn pending_ratings(&self, actor: &str) -> Result<Vec<PendingRating>, EngineError> {
        validate_user(actor)?;
        let now = self.clock.now_ms();
        let items: Vec<SharedItemState> = self.items.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for item in items {
            let guard = item.read().await;
            for cs in guard.claims.values() {
                let Ok((target_role, target_user_id)) = rating_target(&guard.item, cs, actor, now) else {
                    continue;
                };
                if self.has_rated(cs.claim.id, actor) {
                    continue;
                }
                out.push(PendingRating {
                    claim_id: cs.claim.id,
                    item_id: guard.item.id,
                    item_name: guard.item.name.clone(),
                    target_role,
                    target_user_id,
                    span: cs.claim.span,
                });
            }
        }
        out.sort_by_key(|p| (p.span.start, p.claim_id));
        Ok(out)
    }

    fn has_rated(&self, claim_id: Ulid, user: &str) -> bool {
        self.ratings
            .get(&claim_id)
            .is_some_and(|ratings| ratings.iter().any(|r| r.from_user_id == user))
    }
}

/// The owner who approved the claim. After a giveaway transfer the item
/// lists the claimant as owner, so the approval is the record of who lent.
fn lender_of<'a>(item: &'a Item, cs: &'a ClaimState) -> &'a str {
    cs.activity
        .iter()
        .find(|a| a.kind == ActivityKind::Approved)
        .map_or(item.owner_id.as_str(), |a| a.actor_id.as_str())
}

/// Whom `actor` rates on this claim, and in which role.
fn rating_target(item: &Item, cs: &ClaimState, actor: &str, now: Ms) -> Result<(RatedRole, UserId), EngineError> {
    let lender = lender_of(item, cs);
    let target = if actor == lender {
        (RatedRole::Borrower, cs.claim.claimer_id.clone())
    } else if actor == cs.claim.claimer_id {
        (RatedRole::Lender, lender.to_string())
    } else {
        return Err(EngineError::Unauthorized("not a participant in this claim"));
    };
    if cs.claim.status != ClaimStatus::Approved {
        return Err(EngineError::InvalidTransition("only approved claims can be rated"));
    }
    if now < cs.claim.span.start {
        return Err(EngineError::InvalidTransition("lease has not started"));
    }
    Ok(target)
}

fn average(stars: &[u8]) -> Option<f64> {
    if stars.is_empty() {
        return None;
    }
    let sum: u32 = stars.iter().map(|&s| u32::from(s)).sum();
    let mean = f64::from(sum) / stars.len() as f64;
    Some((mean * 10.0).round() / 10.0)
}
