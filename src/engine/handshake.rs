use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotificationKind;

use super::conflict::{validate_evidence, validate_user};
use super::projection::{can_start_pickup, can_start_return, project, Handshake};
use super::{activity, Engine, EngineError};

/// Optional proof attached to a confirmation.
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    pub note: Option<String>,
    pub photos: Vec<String>,
}

fn proposed_kind(milestone: Milestone) -> NotificationKind {
    match milestone {
        Milestone::Pickup => NotificationKind::PickupProposed,
        Milestone::Return => NotificationKind::ReturnProposed,
    }
}

fn approved_kind(milestone: Milestone) -> NotificationKind {
    match milestone {
        Milestone::Pickup => NotificationKind::PickupApproved,
        Milestone::Return => NotificationKind::ReturnApproved,
    }
}

fn confirmed_kind(milestone: Milestone) -> NotificationKind {
    match milestone {
        Milestone::Pickup => NotificationKind::PickupConfirmed,
        Milestone::Return => NotificationKind::ReturnConfirmed,
    }
}

/// Negotiation on `milestone` is only open while the lease sits in the
/// state that precedes it.
fn check_milestone_open(item: &Item, claim: &ClaimState, milestone: Milestone) -> Result<(), EngineError> {
    if claim.claim.status != ClaimStatus::Approved {
        return Err(EngineError::InvalidTransition("claim is not approved"));
    }
    let state = project(&claim.activity);
    match milestone {
        Milestone::Pickup if !can_start_pickup(state) => {
            Err(EngineError::InvalidTransition("pickup is no longer open"))
        }
        Milestone::Return if item.giveaway => {
            Err(EngineError::InvalidTransition("giveaways are not returned"))
        }
        Milestone::Return if !can_start_return(item, state) => {
            Err(EngineError::InvalidTransition("return is not open"))
        }
        _ => Ok(()),
    }
}

/// The other party, or `Unauthorized` when `actor` is not a participant.
fn counterparty<'a>(item: &'a Item, claim: &'a Claim, actor: &str) -> Result<&'a str, EngineError> {
    if item.owner_id == actor {
        Ok(&claim.claimer_id)
    } else if claim.claimer_id == actor {
        Ok(&item.owner_id)
    } else {
        Err(EngineError::Unauthorized("not a participant in this claim"))
    }
}

impl Engine {
    pub async fn propose_pickup_window(
        &self,
        claim_id: Ulid,
        actor: &str,
        window_start: Ms,
    ) -> Result<ProposalId, EngineError> {
        self.propose_window(claim_id, actor, Milestone::Pickup, window_start).await
    }

    pub async fn propose_return_window(
        &self,
        claim_id: Ulid,
        actor: &str,
        window_start: Ms,
    ) -> Result<ProposalId, EngineError> {
        self.propose_window(claim_id, actor, Milestone::Return, window_start).await
    }

    pub async fn approve_pickup_window(
        &self,
        claim_id: Ulid,
        actor: &str,
        expected: Option<ProposalId>,
    ) -> Result<(), EngineError> {
        self.approve_window(claim_id, actor, Milestone::Pickup, expected).await
    }

    pub async fn approve_return_window(
        &self,
        claim_id: Ulid,
        actor: &str,
        expected: Option<ProposalId>,
    ) -> Result<(), EngineError> {
        self.approve_window(claim_id, actor, Milestone::Return, expected).await
    }

    pub async fn confirm_pickup(&self, claim_id: Ulid, actor: &str, evidence: Evidence) -> Result<(), EngineError> {
        self.confirm_handover(claim_id, actor, Milestone::Pickup, evidence).await
    }

    pub async fn confirm_return(&self, claim_id: Ulid, actor: &str, evidence: Evidence) -> Result<(), EngineError> {
        self.confirm_handover(claim_id, actor, Milestone::Return, evidence).await
    }

    /// Either party suggests a one-hour window. A new proposal supersedes
    /// any earlier one for the same milestone.
    pub async fn propose_window(
        &self,
        claim_id: Ulid,
        actor: &str,
        milestone: Milestone,
        window_start: Ms,
    ) -> Result<ProposalId, EngineError> {
        validate_user(actor)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_claim_write(&claim_id).await?;
        let now = self.clock.now_ms();
        let item = guard.item.clone();
        let cs = &guard.claims[&claim_id];
        let other = counterparty(&item, &cs.claim, actor)?.to_string();
        check_milestone_open(&item, cs, milestone)?;

        if !is_hour_aligned(window_start) {
            return Err(EngineError::Invalid("time must be aligned to the hour"));
        }
        if window_start <= now {
            return Err(EngineError::Invalid("window must start in the future"));
        }
        let anchor = match milestone {
            Milestone::Pickup => cs.claim.span.start,
            Milestone::Return => cs.claim.span.end,
        };
        // Windows sit on the local calendar date of the anchor. A giveaway
        // starting in the evening cannot be picked up after that midnight.
        if !is_on_day(window_start, start_of_day(anchor, self.settings.utc_offset_ms)) {
            return Err(match milestone {
                Milestone::Pickup => EngineError::Invalid("pickup window must be on the start date"),
                Milestone::Return => EngineError::Invalid("return window must be on the end date"),
            });
        }

        let id = ProposalId::fresh();
        let window = Span::hour_from(window_start);
        let mut proposed = activity(item.id, claim_id, milestone.proposed(), actor, now);
        proposed.proposal_id = Some(id);
        proposed.window = Some(window);
        let event = Event::LeaseRecorded {
            item_id: item.id,
            claim_id,
            activities: vec![proposed],
        };
        let note = self.notification(&other, proposed_kind(milestone), item.id, Some(claim_id), Some(window));
        self.persist_and_apply(&mut guard, &event, vec![note]).await?;
        info!(claim = %claim_id, milestone = milestone.as_str(), proposal = %id, "window proposed");
        Ok(id)
    }

    /// The counterparty accepts the proposal currently in force. Naming an
    /// older proposal fails rather than silently approving the newer one.
    pub async fn approve_window(
        &self,
        claim_id: Ulid,
        actor: &str,
        milestone: Milestone,
        expected: Option<ProposalId>,
    ) -> Result<(), EngineError> {
        validate_user(actor)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_claim_write(&claim_id).await?;
        let now = self.clock.now_ms();
        let item = guard.item.clone();
        let cs = &guard.claims[&claim_id];
        counterparty(&item, &cs.claim, actor)?;
        check_milestone_open(&item, cs, milestone)?;

        let hs = Handshake::fold(&cs.activity, milestone);
        let (id, window) = hs
            .latest()
            .ok_or(EngineError::InvalidTransition("no window has been proposed"))?;
        if expected.is_some_and(|e| e != id) {
            return Err(EngineError::InvalidTransition("proposal superseded"));
        }
        let Handshake::Proposed { proposer, .. } = hs else {
            return Err(EngineError::InvalidTransition("proposal already approved"));
        };
        if proposer == actor {
            return Err(EngineError::Unauthorized("cannot approve your own proposal"));
        }
        if now > window.end {
            return Err(EngineError::Stale(id));
        }

        let mut approved = activity(item.id, claim_id, milestone.approved(), actor, now);
        approved.proposal_id = Some(id);
        approved.window = Some(window);
        let event = Event::LeaseRecorded {
            item_id: item.id,
            claim_id,
            activities: vec![approved],
        };
        let note = self.notification(&proposer, approved_kind(milestone), item.id, Some(claim_id), Some(window));
        self.persist_and_apply(&mut guard, &event, vec![note]).await?;
        info!(claim = %claim_id, milestone = milestone.as_str(), proposal = %id, "window approved");
        Ok(())
    }

    /// Either party records the handover inside the approved window. A
    /// giveaway pickup also hands the item to the claimant.
    pub async fn confirm_handover(
        &self,
        claim_id: Ulid,
        actor: &str,
        milestone: Milestone,
        evidence: Evidence,
    ) -> Result<(), EngineError> {
        validate_user(actor)?;
        validate_evidence(evidence.note.as_deref(), &evidence.photos)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_claim_write(&claim_id).await?;
        let now = self.clock.now_ms();
        let item = guard.item.clone();
        let cs = &guard.claims[&claim_id];
        let other = counterparty(&item, &cs.claim, actor)?.to_string();
        check_milestone_open(&item, cs, milestone)?;

        let hs = Handshake::fold(&cs.activity, milestone);
        let (id, window) = hs
            .latest()
            .ok_or(EngineError::InvalidTransition("no window has been proposed"))?;
        if now > window.end {
            return Err(EngineError::Stale(id));
        }
        if now < window.start {
            return Err(EngineError::InvalidTransition("window has not started"));
        }
        if !matches!(hs, Handshake::Approved { .. }) {
            return Err(EngineError::InvalidTransition("window has not been approved"));
        }

        let mut confirmed = activity(item.id, claim_id, milestone.confirmed(), actor, now);
        confirmed.proposal_id = Some(id);
        confirmed.window = Some(window);
        confirmed.note = evidence.note;
        confirmed.photos = evidence.photos;
        let mut activities = vec![confirmed];
        let transfer = milestone == Milestone::Pickup && item.giveaway;
        if transfer {
            activities.push(activity(item.id, claim_id, ActivityKind::Transferred, actor, now));
        }
        let event = Event::LeaseRecorded {
            item_id: item.id,
            claim_id,
            activities,
        };
        let note = self.notification(&other, confirmed_kind(milestone), item.id, Some(claim_id), Some(window));
        self.persist_and_apply(&mut guard, &event, vec![note]).await?;
        info!(claim = %claim_id, milestone = milestone.as_str(), transfer, "handover confirmed");
        Ok(())
    }
}
