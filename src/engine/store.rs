use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Apply an item-scoped event to an ItemState. The caller holds the lock.
/// `claim_index` maps claim id → item id and is kept in step.
pub(super) fn apply_to_item(state: &mut ItemState, event: &Event, claim_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ClaimRequested {
            id,
            item_id,
            claimer_id,
            span,
            activity,
        } => {
            let mut claim = ClaimState {
                claim: Claim {
                    id: *id,
                    item_id: *item_id,
                    claimer_id: claimer_id.clone(),
                    status: ClaimStatus::Pending,
                    span: *span,
                    caches: LeaseCaches::default(),
                },
                activity: Vec::new(),
            };
            claim.apply_activity(activity.clone());
            state.claims.insert(*id, claim);
            claim_index.insert(*id, *item_id);
        }
        Event::LeaseRecorded {
            claim_id,
            activities,
            ..
        } => {
            let Some(claim) = state.claims.get_mut(claim_id) else {
                return;
            };
            for activity in activities {
                if activity.kind == ActivityKind::Transferred {
                    state.item.owner_id = claim.claim.claimer_id.clone();
                }
                claim.apply_activity(activity.clone());
            }
        }
        Event::ClaimWithdrawn { id, clear_alerts, .. } => {
            state.claims.remove(id);
            claim_index.remove(id);
            if *clear_alerts {
                state.watchers.clear();
            }
        }
        Event::ClaimRestored { claim, activity } => {
            state.claims.insert(
                claim.id,
                ClaimState {
                    claim: claim.clone(),
                    activity: activity.clone(),
                },
            );
            claim_index.insert(claim.id, claim.item_id);
        }
        Event::AlertSubscribed { user_id, .. } => {
            state.watchers.insert(user_id.clone());
        }
        Event::AlertCleared { user_id, .. } => {
            state.watchers.remove(user_id);
        }
        // Listing, delisting, calendars and ratings are handled above the item level.
        Event::ItemListed { .. }
        | Event::ItemDelisted { .. }
        | Event::UnavailabilityAdded { .. }
        | Event::UnavailabilityRemoved { .. }
        | Event::RatingRecorded { .. } => {}
    }
}

pub(super) fn apply_to_calendar(cal: &mut OwnerCalendar, event: &Event, block_index: &DashMap<Ulid, UserId>) {
    match event {
        Event::UnavailabilityAdded {
            id,
            owner_id,
            span,
            note,
        } => {
            cal.blocks.insert(
                *id,
                Unavailability {
                    id: *id,
                    owner_id: owner_id.clone(),
                    span: *span,
                    note: note.clone(),
                },
            );
            block_index.insert(*id, owner_id.clone());
        }
        Event::UnavailabilityRemoved { id, .. } => {
            cal.blocks.remove(id);
            block_index.remove(id);
        }
        _ => {}
    }
}

pub(super) fn new_item_state(event: &Event) -> Option<ItemState> {
    match event {
        Event::ItemListed {
            id,
            owner_id,
            name,
            giveaway,
            bounds,
        } => Some(ItemState::new(Item {
            id: *id,
            owner_id: owner_id.clone(),
            name: name.clone(),
            giveaway: *giveaway,
            bounds: *bounds,
        })),
        _ => None,
    }
}

/// Events that recreate the item exactly as it stands, for WAL compaction.
pub(super) fn snapshot_item(state: &ItemState, out: &mut Vec<Event>) {
    out.push(Event::ItemListed {
        id: state.item.id,
        owner_id: state.item.owner_id.clone(),
        name: state.item.name.clone(),
        giveaway: state.item.giveaway,
        bounds: state.item.bounds,
    });
    let mut claims: Vec<&ClaimState> = state.claims.values().collect();
    claims.sort_by_key(|c| (c.claim.caches.requested_at, c.claim.id));
    for c in claims {
        out.push(Event::ClaimRestored {
            claim: c.claim.clone(),
            activity: c.activity.clone(),
        });
    }
    for user_id in &state.watchers {
        out.push(Event::AlertSubscribed {
            item_id: state.item.id,
            user_id: user_id.clone(),
        });
    }
}

pub(super) fn snapshot_calendar(cal: &OwnerCalendar, out: &mut Vec<Event>) {
    for block in cal.blocks.values() {
        out.push(Event::UnavailabilityAdded {
            id: block.id,
            owner_id: block.owner_id.clone(),
            span: block.span,
            note: block.note.clone(),
        });
    }
}

/// Ratings are keyed by the claim they were given for.
pub(super) fn apply_rating(book: &DashMap<Ulid, Vec<Rating>>, rating: &Rating) {
    book.entry(rating.claim_id).or_default().push(rating.clone());
}

pub(super) fn snapshot_ratings(book: &DashMap<Ulid, Vec<Rating>>, out: &mut Vec<Event>) {
    let mut ratings: Vec<Rating> = Vec::new();
    for entry in book.iter() {
        ratings.extend(entry.value().iter().cloned());
    }
    ratings.sort_by_key(|r| (r.created_at, r.id));
    out.extend(ratings.into_iter().map(|rating| Event::RatingRecorded { rating }));
}
