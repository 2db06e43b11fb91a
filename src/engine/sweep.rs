use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotificationKind;

use super::conflict::{validate_evidence, validate_user};
use super::projection::{can_start_pickup, can_start_return, project, Handshake};
use super::{activity, Engine, EngineError, SharedItemState};

/// A handshake whose latest window has ended without a confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverdueCandidate {
    pub item_id: Ulid,
    pub claim_id: Ulid,
    pub milestone: Milestone,
    pub proposal_id: ProposalId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub candidates: usize,
    pub expired: usize,
    pub missing: usize,
    pub skipped: usize,
}

fn overdue_in(item: &ItemState, now: Ms, out: &mut Vec<OverdueCandidate>) {
    for cs in item.claims.values() {
        if cs.claim.status != ClaimStatus::Approved {
            continue;
        }
        let state = project(&cs.activity);
        for milestone in [Milestone::Pickup, Milestone::Return] {
            let open = match milestone {
                Milestone::Pickup => can_start_pickup(state),
                Milestone::Return => can_start_return(&item.item, state),
            };
            if !open {
                continue;
            }
            if let Some((proposal_id, window)) = Handshake::fold(&cs.activity, milestone).latest()
                && window.end < now {
                    out.push(OverdueCandidate {
                        item_id: item.item.id,
                        claim_id: cs.claim.id,
                        milestone,
                        proposal_id,
                    });
                }
        }
    }
}

impl Engine {
    /// Owner gives up on a pickup that never happened.
    pub async fn mark_expired(&self, claim_id: Ulid, actor: &str, note: Option<String>) -> Result<(), EngineError> {
        self.escalate(claim_id, actor, Milestone::Pickup, note).await
    }

    /// Owner reports that a borrowed item never came back.
    pub async fn mark_missing(&self, claim_id: Ulid, actor: &str, note: Option<String>) -> Result<(), EngineError> {
        self.escalate(claim_id, actor, Milestone::Return, note).await
    }

    async fn escalate(
        &self,
        claim_id: Ulid,
        actor: &str,
        milestone: Milestone,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        validate_user(actor)?;
        validate_evidence(note.as_deref(), &[])?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_claim_write(&claim_id).await?;
        let now = self.clock.now_ms();
        let item = guard.item.clone();
        if item.owner_id != actor {
            return Err(EngineError::Unauthorized("only the owner can escalate a claim"));
        }
        let cs = &guard.claims[&claim_id];
        if cs.claim.status != ClaimStatus::Approved {
            return Err(EngineError::InvalidTransition("claim is not approved"));
        }
        let state = project(&cs.activity);
        let claimer = cs.claim.claimer_id.clone();
        let (kind, notice) = match milestone {
            Milestone::Pickup if can_start_pickup(state) => (ActivityKind::Expired, NotificationKind::PickupExpired),
            Milestone::Return if can_start_return(&item, state) => {
                (ActivityKind::Missing, NotificationKind::ReturnMissing)
            }
            Milestone::Pickup => return Err(EngineError::InvalidTransition("pickup is no longer open")),
            Milestone::Return => return Err(EngineError::InvalidTransition("item is not out on loan")),
        };

        let mut escalation = activity(item.id, claim_id, kind, actor, now);
        escalation.note = note;
        let event = Event::LeaseRecorded {
            item_id: item.id,
            claim_id,
            activities: vec![escalation],
        };
        let n = self.notification(&claimer, notice, item.id, Some(claim_id), None);
        self.persist_and_apply(&mut guard, &event, vec![n]).await?;
        info!(claim = %claim_id, kind = kind.as_str(), "claim escalated by owner");
        Ok(())
    }

    /// Read-only pass over every item. Candidates are re-checked when resolved.
    pub async fn collect_overdue(&self, now: Ms) -> Vec<OverdueCandidate> {
        let items: Vec<SharedItemState> = self.items.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for item in items {
            overdue_in(&*item.read().await, now, &mut out);
        }
        out
    }

    /// Resolve one candidate under the item write lock. `Ok(None)` means the
    /// candidate no longer applies.
    pub async fn resolve_overdue(&self, candidate: OverdueCandidate) -> Result<Option<ActivityKind>, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_claim_write(&candidate.claim_id).await?;
        let now = self.clock.now_ms();
        let item = guard.item.clone();
        let cs = &guard.claims[&candidate.claim_id];
        if cs.claim.status != ClaimStatus::Approved {
            return Ok(None);
        }
        let latest = Handshake::fold(&cs.activity, candidate.milestone).latest();
        let Some((proposal_id, window)) = latest else {
            return Ok(None);
        };
        if proposal_id != candidate.proposal_id || window.end >= now {
            return Ok(None);
        }
        let state = project(&cs.activity);
        let (kind, notice) = match candidate.milestone {
            Milestone::Pickup if can_start_pickup(state) => (ActivityKind::Expired, NotificationKind::PickupExpired),
            Milestone::Return if can_start_return(&item, state) => {
                (ActivityKind::Missing, NotificationKind::ReturnMissing)
            }
            _ => return Ok(None),
        };
        let claimer = cs.claim.claimer_id.clone();

        let mut escalation = activity(item.id, candidate.claim_id, kind, SYSTEM_ACTOR, now);
        escalation.proposal_id = Some(proposal_id);
        escalation.window = Some(window);
        let event = Event::LeaseRecorded {
            item_id: item.id,
            claim_id: candidate.claim_id,
            activities: vec![escalation],
        };
        let notes = vec![
            self.notification(&item.owner_id, notice, item.id, Some(candidate.claim_id), Some(window)),
            self.notification(&claimer, notice, item.id, Some(candidate.claim_id), Some(window)),
        ];
        self.persist_and_apply(&mut guard, &event, notes).await?;
        Ok(Some(kind))
    }

    /// One sweep. Returns `None` when another sweep is still running.
    pub async fn run_overdue_sweep(&self) -> Option<SweepReport> {
        let Ok(_running) = self.sweep_lock.try_lock() else {
            debug!("overdue sweep already running, skipping");
            return None;
        };
        let now = self.clock.now_ms();
        let candidates = self.collect_overdue(now).await;
        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };
        for candidate in candidates {
            match self.resolve_overdue(candidate).await {
                Ok(Some(ActivityKind::Expired)) => {
                    info!(claim = %candidate.claim_id, "pickup window lapsed, lease expired");
                    report.expired += 1;
                }
                Ok(Some(_)) => {
                    info!(claim = %candidate.claim_id, "return window lapsed, item marked missing");
                    report.missing += 1;
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    debug!("sweep skip {}: {e}", candidate.claim_id);
                    report.skipped += 1;
                }
            }
        }
        metrics::counter!(crate::observability::SWEEP_RUNS_TOTAL).increment(1);
        metrics::counter!(crate::observability::SWEEP_RESOLVED_TOTAL, "outcome" => "expired")
            .increment(report.expired as u64);
        metrics::counter!(crate::observability::SWEEP_RESOLVED_TOTAL, "outcome" => "missing")
            .increment(report.missing as u64);
        Some(report)
    }
}
