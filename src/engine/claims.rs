use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotificationKind;

use super::conflict::*;
use super::projection::{can_cancel, project, LeaseState};
use super::{activity, Engine, EngineError};

impl Engine {
    pub async fn list_item(
        &self,
        id: Ulid,
        owner: &str,
        name: Option<String>,
        giveaway: bool,
        bounds: LeaseBounds,
    ) -> Result<(), EngineError> {
        validate_user(owner)?;
        if self.items.len() >= MAX_ITEMS {
            return Err(EngineError::LimitExceeded("too many items"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("item name too long"));
            }
        if !bounds.is_valid() {
            return Err(EngineError::Invalid("lease bounds must be positive and min <= max"));
        }
        let _gate = self.commit_gate.read().await;
        if self.items.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ItemListed {
            id,
            owner_id: owner.to_string(),
            name: name.clone(),
            giveaway,
            bounds,
        };
        self.wal_append(&event).await?;
        let state = ItemState::new(Item {
            id,
            owner_id: owner.to_string(),
            name,
            giveaway,
            bounds,
        });
        self.items.insert(id, Arc::new(RwLock::new(state)));
        info!(item = %id, owner, giveaway, "item listed");
        Ok(())
    }

    /// Owner only. Refused while a claim is still pending or the item is out.
    pub async fn delist_item(&self, id: Ulid, actor: &str) -> Result<(), EngineError> {
        validate_user(actor)?;
        let _gate = self.commit_gate.read().await;
        let state = self.get_item(&id).ok_or(EngineError::NotFound(id))?;
        let guard = state.write().await;
        if guard.item.owner_id != actor {
            return Err(EngineError::Unauthorized("only the owner can delist an item"));
        }
        let busy = guard.claims.values().any(|c| {
            c.claim.status == ClaimStatus::Pending
                || matches!(project(&c.activity), LeaseState::Approved | LeaseState::PickedUp)
        });
        if busy {
            return Err(EngineError::InvalidTransition("item has open claims"));
        }

        let event = Event::ItemDelisted { id };
        self.wal_append(&event).await?;
        for claim_id in guard.claims.keys() {
            self.claim_to_item.remove(claim_id);
        }
        self.items.remove(&id);
        info!(item = %id, "item delisted");
        Ok(())
    }

    pub async fn add_unavailability(
        &self,
        id: Ulid,
        owner: &str,
        span: Span,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        validate_user(owner)?;
        check_span(&span)?;
        validate_evidence(note.as_deref(), &[])?;
        let _gate = self.commit_gate.read().await;
        if self.block_to_owner.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let cal = self
            .calendars
            .entry(owner.to_string())
            .or_default()
            .value()
            .clone();
        let mut guard = cal.write().await;
        if guard.blocks.len() >= MAX_UNAVAILABILITY_PER_OWNER {
            return Err(EngineError::LimitExceeded("too many unavailability blocks"));
        }
        let event = Event::UnavailabilityAdded {
            id,
            owner_id: owner.to_string(),
            span,
            note,
        };
        self.persist_calendar(&mut guard, &event).await
    }

    pub async fn remove_unavailability(&self, id: Ulid, actor: &str) -> Result<(), EngineError> {
        validate_user(actor)?;
        let _gate = self.commit_gate.read().await;
        let owner = self
            .block_to_owner
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if owner != actor {
            return Err(EngineError::Unauthorized("only the owner can remove a block"));
        }
        let cal = self.calendar_of(&owner).ok_or(EngineError::NotFound(id))?;
        let mut guard = cal.write().await;
        if !guard.blocks.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::UnavailabilityRemoved { id, owner_id: owner };
        self.persist_calendar(&mut guard, &event).await
    }

    /// Register `claimer`'s interest in `span`. All checks run under the
    /// item write lock, in the order callers see them reported.
    pub async fn request_claim(
        &self,
        id: Ulid,
        item_id: Ulid,
        claimer: &str,
        span: Span,
    ) -> Result<Ulid, EngineError> {
        validate_user(claimer)?;
        let _gate = self.commit_gate.read().await;
        if self.claim_to_item.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let state = self.get_item(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let mut guard = state.write().await;
        let now = self.clock.now_ms();

        if guard.item.owner_id == claimer {
            return Err(EngineError::Unauthorized("cannot claim your own item"));
        }
        check_span(&span)?;
        {
            let cal = self.calendar_of(&guard.item.owner_id);
            let cal_guard = match &cal {
                Some(c) => Some(c.read().await),
                None => None,
            };
            check_owner_calendar(cal_guard.as_deref(), &span)?;
        }
        let kind = check_request_window(&guard.item, &span, now, self.settings.utc_offset_ms)?;
        check_no_double_booking(&guard, &span, None)?;
        check_self_overlap(&guard, claimer, &span)?;
        check_waitlist(&guard)?;

        let owner = guard.item.owner_id.clone();
        let event = Event::ClaimRequested {
            id,
            item_id,
            claimer_id: claimer.to_string(),
            span,
            activity: activity(item_id, id, ActivityKind::Requested, claimer, now),
        };
        let note = self.notification(&owner, NotificationKind::NewRequest, item_id, Some(id), Some(span));
        self.persist_and_apply(&mut guard, &event, vec![note]).await?;
        info!(claim = %id, item = %item_id, claimer, ?kind, "claim requested");
        Ok(id)
    }

    pub async fn approve_claim(&self, claim_id: Ulid, actor: &str) -> Result<(), EngineError> {
        validate_user(actor)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_claim_write(&claim_id).await?;
        let now = self.clock.now_ms();
        let item = guard.item.clone();
        if item.owner_id != actor {
            return Err(EngineError::Unauthorized("only the owner can approve a claim"));
        }
        let claim = guard.claims[&claim_id].claim.clone();
        if claim.status != ClaimStatus::Pending {
            return Err(EngineError::InvalidTransition("claim is not pending"));
        }
        check_no_double_booking(&guard, &claim.span, Some(claim_id))?;

        let intraday = LeaseKind::classify(&claim.span) == Some(LeaseKind::Intraday);
        let mut activities = vec![activity(item.id, claim_id, ActivityKind::Approved, actor, now)];
        // Giveaways span 24h and never classify as intraday, so their pickup is negotiated.
        if intraday {
            let window = Span::hour_from(claim.span.start);
            activities.extend(auto_handshake(
                &item,
                &claim,
                Milestone::Pickup,
                ProposalId::AutoPickup(claim_id),
                window,
                now,
            ));
            let window = Span::hour_from(claim.span.end);
            activities.extend(auto_handshake(
                &item,
                &claim,
                Milestone::Return,
                ProposalId::AutoReturn(claim_id),
                window,
                now,
            ));
        }

        let event = Event::LeaseRecorded {
            item_id: item.id,
            claim_id,
            activities,
        };
        let note = self.notification(
            &claim.claimer_id,
            NotificationKind::RequestApproved,
            item.id,
            Some(claim_id),
            Some(claim.span),
        );
        self.persist_and_apply(&mut guard, &event, vec![note]).await?;
        info!(claim = %claim_id, item = %item.id, intraday, "claim approved");
        Ok(())
    }

    pub async fn reject_claim(&self, claim_id: Ulid, actor: &str) -> Result<(), EngineError> {
        validate_user(actor)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_claim_write(&claim_id).await?;
        let now = self.clock.now_ms();
        let item_id = guard.item.id;
        if guard.item.owner_id != actor {
            return Err(EngineError::Unauthorized("only the owner can reject a claim"));
        }
        let claim = guard.claims[&claim_id].claim.clone();
        if claim.status != ClaimStatus::Pending {
            return Err(EngineError::InvalidTransition("claim is not pending"));
        }

        let event = Event::LeaseRecorded {
            item_id,
            claim_id,
            activities: vec![activity(item_id, claim_id, ActivityKind::Rejected, actor, now)],
        };
        let note = self.notification(
            &claim.claimer_id,
            NotificationKind::RequestRejected,
            item_id,
            Some(claim_id),
            None,
        );
        self.persist_and_apply(&mut guard, &event, vec![note]).await?;
        info!(claim = %claim_id, item = %item_id, "claim rejected");
        Ok(())
    }

    /// Claimant withdraws before any handover happened. The claim and its
    /// log are removed; if it held the calendar, waiting users are told the
    /// item is free again.
    pub async fn cancel_claim(&self, claim_id: Ulid, actor: &str) -> Result<(), EngineError> {
        validate_user(actor)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_claim_write(&claim_id).await?;
        let item_id = guard.item.id;
        let cs = &guard.claims[&claim_id];
        if cs.claim.claimer_id != actor {
            return Err(EngineError::Unauthorized("only the claimant can cancel a claim"));
        }
        if !can_cancel(project(&cs.activity)) {
            return Err(EngineError::InvalidTransition("claim can no longer be cancelled"));
        }
        let was_approved = cs.claim.status == ClaimStatus::Approved;

        let notes = if was_approved {
            guard
                .watchers
                .iter()
                .map(|w| self.notification(w, NotificationKind::ItemAvailable, item_id, None, None))
                .collect()
        } else {
            Vec::new()
        };
        let event = Event::ClaimWithdrawn {
            id: claim_id,
            item_id,
            clear_alerts: was_approved && !guard.watchers.is_empty(),
        };
        let alerted = notes.len();
        self.persist_and_apply(&mut guard, &event, notes).await?;
        info!(claim = %claim_id, item = %item_id, was_approved, alerted, "claim cancelled");
        Ok(())
    }

    /// Subscribe or unsubscribe `user` from "available again" alerts.
    pub async fn set_availability_alert(&self, item_id: Ulid, user: &str, on: bool) -> Result<(), EngineError> {
        validate_user(user)?;
        let _gate = self.commit_gate.read().await;
        let state = self.get_item(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let mut guard = state.write().await;
        if guard.item.owner_id == user {
            return Err(EngineError::Unauthorized("owners are not alerted about their own items"));
        }
        let subscribed = guard.watchers.contains(user);
        let event = match (on, subscribed) {
            (true, false) => {
                if guard.watchers.len() >= MAX_ALERTS_PER_ITEM {
                    return Err(EngineError::LimitExceeded("too many alerts on item"));
                }
                Event::AlertSubscribed {
                    item_id,
                    user_id: user.to_string(),
                }
            }
            (false, true) => Event::AlertCleared {
                item_id,
                user_id: user.to_string(),
            },
            _ => return Ok(()),
        };
        self.persist_and_apply(&mut guard, &event, Vec::new()).await
    }
}

/// Claimant proposes and owner approves the same window, as the pair of
/// activities approval writes for fixed-time handovers.
fn auto_handshake(
    item: &Item,
    claim: &Claim,
    milestone: Milestone,
    id: ProposalId,
    window: Span,
    now: Ms,
) -> [LeaseActivity; 2] {
    let mut proposed = activity(item.id, claim.id, milestone.proposed(), &claim.claimer_id, now);
    proposed.proposal_id = Some(id);
    proposed.window = Some(window);
    let mut approved = activity(item.id, claim.id, milestone.approved(), &item.owner_id, now);
    approved.proposal_id = Some(id);
    approved.window = Some(window);
    [proposed, approved]
}
