use ulid::Ulid;

use crate::limits::ACTIVITY_PAGE_SIZE;
use crate::model::*;
use crate::notify::Notification;

use super::availability::{busy_spans, subtract_intervals};
use super::conflict::{check_span, validate_user};
use super::projection::{allowed_actions, display_state, Action};
use super::{Engine, EngineError, SharedItemState};

/// A claim as presented to one participant.
#[derive(Debug, Clone)]
pub struct ClaimInfo {
    pub claim: Claim,
    pub state: &'static str,
    pub actions: Vec<Action>,
}

impl Engine {
    /// Busy spans of an item, merged and sorted.
    pub async fn availability(&self, item_id: Ulid) -> Result<Vec<Span>, EngineError> {
        let state = self.get_item(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = state.read().await;
        let cal = self.calendar_of(&guard.item.owner_id);
        let cal_guard = match &cal {
            Some(c) => Some(c.read().await),
            None => None,
        };
        Ok(busy_spans(&guard, cal_guard.as_deref()))
    }

    /// Gaps inside `window` that a new request could still take.
    pub async fn free_slots(&self, item_id: Ulid, window: Span) -> Result<Vec<Span>, EngineError> {
        check_span(&window)?;
        let busy = self.availability(item_id).await?;
        Ok(subtract_intervals(&[window], &busy))
    }

    /// The most recent activity of a claim, oldest first. Participants only.
    pub async fn lease_activity(&self, claim_id: Ulid, actor: &str) -> Result<Vec<LeaseActivity>, EngineError> {
        validate_user(actor)?;
        let item_id = self
            .get_item_for_claim(&claim_id)
            .ok_or(EngineError::NotFound(claim_id))?;
        let state = self.get_item(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = state.read().await;
        let cs = guard.claims.get(&claim_id).ok_or(EngineError::NotFound(claim_id))?;
        if guard.item.owner_id != actor && cs.claim.claimer_id != actor {
            return Err(EngineError::Unauthorized("not a participant in this claim"));
        }
        let skip = cs.activity.len().saturating_sub(ACTIVITY_PAGE_SIZE);
        Ok(cs.activity[skip..].to_vec())
    }

    pub async fn get_claim(&self, claim_id: Ulid) -> Option<ClaimState> {
        let item_id = self.get_item_for_claim(&claim_id)?;
        let state = self.get_item(&item_id)?;
        let guard = state.read().await;
        guard.claims.get(&claim_id).cloned()
    }

    /// Every claim on an item. Owner only.
    pub async fn claims_for_item(&self, item_id: Ulid, actor: &str) -> Result<Vec<ClaimInfo>, EngineError> {
        validate_user(actor)?;
        let state = self.get_item(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = state.read().await;
        if guard.item.owner_id != actor {
            return Err(EngineError::Unauthorized("only the owner can list an item's claims"));
        }
        let now = self.clock.now_ms();
        Ok(guard
            .claims
            .values()
            .map(|cs| claim_info(&guard.item, cs, actor, now))
            .collect())
    }

    /// Claims the actor has made, across all items.
    pub async fn claims_for_claimer(&self, actor: &str) -> Result<Vec<ClaimInfo>, EngineError> {
        validate_user(actor)?;
        let now = self.clock.now_ms();
        let items: Vec<SharedItemState> = self.items.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for item in items {
            let guard = item.read().await;
            out.extend(
                guard
                    .claims
                    .values()
                    .filter(|cs| cs.claim.claimer_id == actor)
                    .map(|cs| claim_info(&guard.item, cs, actor, now)),
            );
        }
        out.sort_by_key(|c| (c.claim.span.start, c.claim.id));
        Ok(out)
    }

    pub async fn list_items(&self) -> Vec<Item> {
        let items: Vec<SharedItemState> = self.items.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(item.read().await.item.clone());
        }
        out.sort_by_key(|i| i.id);
        out
    }

    pub async fn get_item_info(&self, item_id: Ulid) -> Option<Item> {
        let state = self.get_item(&item_id)?;
        let item = state.read().await.item.clone();
        Some(item)
    }

    pub async fn owner_unavailability(&self, owner: &str) -> Vec<Unavailability> {
        let Some(cal) = self.calendar_of(owner) else {
            return Vec::new();
        };
        let guard = cal.read().await;
        let mut blocks: Vec<Unavailability> = guard.blocks.values().cloned().collect();
        blocks.sort_by_key(|b| (b.span.start, b.id));
        blocks
    }

    pub async fn alert_subscribers(&self, item_id: Ulid) -> Result<Vec<UserId>, EngineError> {
        let state = self.get_item(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = state.read().await;
        Ok(guard.watchers.iter().cloned().collect())
    }

    pub fn notifications(&self, user: &str) -> Result<Vec<Notification>, EngineError> {
        validate_user(user)?;
        Ok(self.notify.inbox(user))
    }

    pub fn dismiss_notifications(&self, user: &str, id: Option<Ulid>) -> Result<usize, EngineError> {
        validate_user(user)?;
        Ok(self.notify.dismiss(user, id))
    }
}

fn claim_info(item: &Item, cs: &ClaimState, actor: &str, now: Ms) -> ClaimInfo {
    ClaimInfo {
        claim: cs.claim.clone(),
        state: display_state(cs, now),
        actions: allowed_actions(item, cs, actor, now),
    }
}
