//! Read-side folds over a claim's activity log: the canonical lease state,
//! the per-milestone handshake, and which actions a participant may take.

use crate::model::*;

/// Canonical lifecycle state, derived only from the activity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Requested,
    Approved,
    PickedUp,
    Expired,
    Transferred,
    Returned,
    Missing,
    Rejected,
}

impl LeaseState {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseState::Requested => "requested",
            LeaseState::Approved => "approved",
            LeaseState::PickedUp => "picked_up",
            LeaseState::Expired => "expired",
            LeaseState::Transferred => "transferred",
            LeaseState::Returned => "returned",
            LeaseState::Missing => "missing",
            LeaseState::Rejected => "rejected",
        }
    }
}

/// Highest-precedence state present in the log. An empty log is `Requested`.
pub fn project(activity: &[LeaseActivity]) -> LeaseState {
    let has = |kind: ActivityKind| activity.iter().any(|a| a.kind == kind);
    if has(ActivityKind::Rejected) {
        LeaseState::Rejected
    } else if has(ActivityKind::Missing) {
        LeaseState::Missing
    } else if has(ActivityKind::Returned) {
        LeaseState::Returned
    } else if has(ActivityKind::Transferred) {
        LeaseState::Transferred
    } else if has(ActivityKind::Expired) {
        LeaseState::Expired
    } else if has(ActivityKind::PickedUp) {
        LeaseState::PickedUp
    } else if has(ActivityKind::Approved) {
        LeaseState::Approved
    } else {
        LeaseState::Requested
    }
}

/// Same precedence evaluated over the timestamp caches.
pub fn project_caches(caches: &LeaseCaches) -> LeaseState {
    if caches.rejected_at.is_some() {
        LeaseState::Rejected
    } else if caches.missing_at.is_some() {
        LeaseState::Missing
    } else if caches.returned_at.is_some() {
        LeaseState::Returned
    } else if caches.transferred_at.is_some() {
        LeaseState::Transferred
    } else if caches.expired_at.is_some() {
        LeaseState::Expired
    } else if caches.picked_up_at.is_some() {
        LeaseState::PickedUp
    } else if caches.approved_at.is_some() {
        LeaseState::Approved
    } else {
        LeaseState::Requested
    }
}

/// State shown to users: a pending claim whose start has passed is `past_due`.
pub fn display_state(claim: &ClaimState, now: Ms) -> &'static str {
    let state = project(&claim.activity);
    if state == LeaseState::Requested && claim.claim.span.start < now {
        "past_due"
    } else {
        state.as_str()
    }
}

/// Negotiation state of one milestone. A new proposal always replaces
/// whatever came before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    NoProposal,
    Proposed {
        id: ProposalId,
        window: Span,
        proposer: UserId,
    },
    Approved {
        id: ProposalId,
        window: Span,
        proposer: UserId,
    },
    Confirmed {
        id: ProposalId,
        window: Span,
        at: Ms,
    },
}

impl Handshake {
    pub fn fold(activity: &[LeaseActivity], milestone: Milestone) -> Self {
        let mut hs = Handshake::NoProposal;
        for a in activity {
            if a.kind == milestone.proposed() {
                if let (Some(id), Some(window)) = (a.proposal_id, a.window) {
                    hs = Handshake::Proposed {
                        id,
                        window,
                        proposer: a.actor_id.clone(),
                    };
                }
            } else if a.kind == milestone.approved() {
                hs = match hs {
                    Handshake::Proposed { id, window, proposer } if a.proposal_id == Some(id) => {
                        Handshake::Approved { id, window, proposer }
                    }
                    other => other,
                };
            } else if a.kind == milestone.confirmed() {
                hs = match hs {
                    Handshake::Approved { id, window, .. } => Handshake::Confirmed {
                        id,
                        window,
                        at: a.created_at,
                    },
                    other => other,
                };
            }
        }
        hs
    }

    /// The proposal currently in force, whatever its stage.
    pub fn latest(&self) -> Option<(ProposalId, Span)> {
        match self {
            Handshake::NoProposal => None,
            Handshake::Proposed { id, window, .. }
            | Handshake::Approved { id, window, .. }
            | Handshake::Confirmed { id, window, .. } => Some((*id, *window)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Reject,
    Cancel,
    ProposePickup,
    ApprovePickup,
    ConfirmPickup,
    ProposeReturn,
    ApproveReturn,
    ConfirmReturn,
    MarkExpired,
    MarkMissing,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Cancel => "cancel",
            Action::ProposePickup => "propose_pickup",
            Action::ApprovePickup => "approve_pickup",
            Action::ConfirmPickup => "confirm_pickup",
            Action::ProposeReturn => "propose_return",
            Action::ApproveReturn => "approve_return",
            Action::ConfirmReturn => "confirm_return",
            Action::MarkExpired => "mark_expired",
            Action::MarkMissing => "mark_missing",
        }
    }
}

pub fn can_cancel(state: LeaseState) -> bool {
    matches!(state, LeaseState::Requested | LeaseState::Approved)
}

pub fn can_start_pickup(state: LeaseState) -> bool {
    state == LeaseState::Approved
}

pub fn can_start_return(item: &Item, state: LeaseState) -> bool {
    !item.giveaway && state == LeaseState::PickedUp
}

/// Actions `actor` could take on `claim` right now.
pub fn allowed_actions(item: &Item, claim: &ClaimState, actor: &str, now: Ms) -> Vec<Action> {
    let is_owner = item.owner_id == actor;
    let is_claimant = claim.claim.claimer_id == actor;
    if !is_owner && !is_claimant {
        return Vec::new();
    }
    let state = project(&claim.activity);
    let mut actions = Vec::new();

    if is_owner && claim.claim.status == ClaimStatus::Pending {
        actions.push(Action::Approve);
        actions.push(Action::Reject);
    }
    if is_claimant && can_cancel(state) {
        actions.push(Action::Cancel);
    }

    let approved = claim.claim.status == ClaimStatus::Approved;
    let mut negotiate = |milestone: Milestone, open: bool, propose, approve, confirm| {
        if !approved || !open {
            return;
        }
        actions.push(propose);
        match Handshake::fold(&claim.activity, milestone) {
            Handshake::Proposed { window, proposer, .. } if proposer != actor && now <= window.end => {
                actions.push(approve);
            }
            Handshake::Approved { window, .. } if window.start <= now && now <= window.end => {
                actions.push(confirm);
            }
            _ => {}
        }
    };
    negotiate(
        Milestone::Pickup,
        can_start_pickup(state),
        Action::ProposePickup,
        Action::ApprovePickup,
        Action::ConfirmPickup,
    );
    negotiate(
        Milestone::Return,
        can_start_return(item, state),
        Action::ProposeReturn,
        Action::ApproveReturn,
        Action::ConfirmReturn,
    );

    if is_owner && approved && can_start_pickup(state) {
        actions.push(Action::MarkExpired);
    }
    if is_owner && approved && can_start_return(item, state) {
        actions.push(Action::MarkMissing);
    }
    actions
}
