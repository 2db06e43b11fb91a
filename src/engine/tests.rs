use std::path::PathBuf;

use tokio_test::{assert_err, assert_ok};

use super::projection::{project, project_caches, Action, Handshake, LeaseState};
use super::*;
use crate::clock::ManualClock;
use crate::notify::NotificationKind;

/// Midnight UTC of "today" in every scenario; the clock starts at 08:00.
const DAY0: Ms = 20_000 * DAY_MS;
const MIN: Ms = 60_000;

const ALICE: &str = "alice";
const BOB: &str = "bob";
const CAROL: &str = "carol";

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("lendlog_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: PathBuf, clock: Arc<ManualClock>) -> Engine {
    Engine::new(path, Arc::new(NotifyHub::new()), clock, EngineSettings::default()).unwrap()
}

fn setup(name: &str) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(DAY0 + 8 * HOUR_MS));
    (open(test_wal_path(name), clock.clone()), clock)
}

async fn list(engine: &Engine, giveaway: bool) -> Ulid {
    let id = Ulid::new();
    engine
        .list_item(id, ALICE, Some("drill".into()), giveaway, LeaseBounds::default())
        .await
        .unwrap();
    id
}

async fn request(engine: &Engine, item: Ulid, who: &str, start: Ms, end: Ms) -> Result<Ulid, EngineError> {
    engine.request_claim(Ulid::new(), item, who, Span { start, end }).await
}

async fn kinds(engine: &Engine, claim: Ulid) -> Vec<ActivityKind> {
    engine
        .get_claim(claim)
        .await
        .unwrap()
        .activity
        .iter()
        .map(|a| a.kind)
        .collect()
}

async fn state_of(engine: &Engine, claim: Ulid) -> LeaseState {
    project(&engine.get_claim(claim).await.unwrap().activity)
}

fn inbox_kinds(engine: &Engine, user: &str) -> Vec<NotificationKind> {
    engine.notifications(user).unwrap().iter().map(|n| n.kind).collect()
}

// ── Requests and approval ────────────────────────────────

#[tokio::test]
async fn approved_claims_never_overlap() {
    let (engine, _clock) = setup("no_double_booking.wal");
    let item = list(&engine, false).await;

    let first = assert_ok!(request(&engine, item, BOB, DAY0 + 2 * DAY_MS, DAY0 + 4 * DAY_MS).await);
    // Pending claims do not hold the calendar.
    let second = assert_ok!(request(&engine, item, CAROL, DAY0 + 3 * DAY_MS, DAY0 + 5 * DAY_MS).await);

    assert_ok!(engine.approve_claim(first, ALICE).await);
    let err = assert_err!(engine.approve_claim(second, ALICE).await);
    assert!(matches!(err, EngineError::Conflict(_)));

    let err = assert_err!(request(&engine, item, "dave", DAY0 + 3 * DAY_MS, DAY0 + 4 * DAY_MS).await);
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(err.sqlstate(), "23P01");
}

#[tokio::test]
async fn touching_claims_can_both_be_approved() {
    let (engine, _clock) = setup("touching_claims.wal");
    let item = list(&engine, false).await;

    let a = request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await.unwrap();
    let b = request(&engine, item, CAROL, DAY0 + 3 * DAY_MS, DAY0 + 5 * DAY_MS).await.unwrap();
    assert_ok!(engine.approve_claim(a, ALICE).await);
    assert_ok!(engine.approve_claim(b, ALICE).await);

    assert_eq!(
        engine.availability(item).await.unwrap(),
        vec![Span::new(DAY0 + DAY_MS, DAY0 + 5 * DAY_MS)]
    );
}

#[tokio::test]
async fn request_window_rules() {
    let (engine, _clock) = setup("request_window.wal");
    let item = list(&engine, false).await;

    // Inverted span reports invalid input, not a conflict.
    let err = assert_err!(request(&engine, item, BOB, DAY0 + 3 * DAY_MS, DAY0 + 2 * DAY_MS).await);
    assert!(matches!(err, EngineError::Invalid(_)));

    // Intraday must be hour-aligned and in the future.
    let err = assert_err!(request(&engine, item, BOB, DAY0 + 10 * HOUR_MS + MIN, DAY0 + 12 * HOUR_MS).await);
    assert!(matches!(err, EngineError::Invalid(_)));
    let err = assert_err!(request(&engine, item, BOB, DAY0 + 7 * HOUR_MS, DAY0 + 9 * HOUR_MS).await);
    assert!(matches!(err, EngineError::Invalid(_)));

    // Multi-day may start today but not yesterday.
    let err = assert_err!(request(&engine, item, BOB, DAY0 - DAY_MS, DAY0 + DAY_MS).await);
    assert!(matches!(err, EngineError::Invalid(_)));
    assert_ok!(request(&engine, item, BOB, DAY0, DAY0 + 2 * DAY_MS).await);
}

#[tokio::test]
async fn lease_bounds_apply_to_multi_day_loans() {
    let (engine, _clock) = setup("lease_bounds.wal");
    let item = Ulid::new();
    let bounds = LeaseBounds { min_days: Some(2), max_days: Some(7) };
    engine.list_item(item, ALICE, None, false, bounds).await.unwrap();

    let err = assert_err!(request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 2 * DAY_MS).await);
    assert!(matches!(err, EngineError::Invalid(_)));
    let err = assert_err!(request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 9 * DAY_MS).await);
    assert!(matches!(err, EngineError::Invalid(_)));
    assert_ok!(request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await);
    // Intraday loans ignore day bounds.
    assert_ok!(request(&engine, item, CAROL, DAY0 + 10 * HOUR_MS, DAY0 + 12 * HOUR_MS).await);

    let bad = LeaseBounds { min_days: Some(5), max_days: Some(2) };
    let err = assert_err!(engine.list_item(Ulid::new(), ALICE, None, false, bad).await);
    assert!(matches!(err, EngineError::Invalid(_)));
}

#[tokio::test]
async fn claimant_cannot_overlap_own_open_claim() {
    let (engine, _clock) = setup("self_overlap.wal");
    let item = list(&engine, false).await;
    request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await.unwrap();
    let err = assert_err!(request(&engine, item, BOB, DAY0 + 2 * DAY_MS, DAY0 + 4 * DAY_MS).await);
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn waitlist_holds_five_pending_claims() {
    let (engine, _clock) = setup("waitlist.wal");
    let item = list(&engine, false).await;
    for i in 0..5 {
        let user = format!("user{i}");
        assert_ok!(request(&engine, item, &user, DAY0 + DAY_MS, DAY0 + 2 * DAY_MS).await);
    }
    let err = assert_err!(request(&engine, item, "user5", DAY0 + 4 * DAY_MS, DAY0 + 5 * DAY_MS).await);
    assert!(matches!(err, EngineError::Conflict("waitlist is full")));
}

#[tokio::test]
async fn owner_unavailability_blocks_requests() {
    let (engine, _clock) = setup("unavailability.wal");
    let item = list(&engine, false).await;
    let block = Ulid::new();
    engine
        .add_unavailability(
            block,
            ALICE,
            Span::new(DAY0 + 5 * DAY_MS, DAY0 + 6 * DAY_MS),
            Some("away".into()),
        )
        .await
        .unwrap();

    let err = assert_err!(request(&engine, item, BOB, DAY0 + 4 * DAY_MS, DAY0 + 6 * DAY_MS).await);
    assert!(matches!(err, EngineError::Conflict(_)));
    // Inverted span inside the block is still reported as invalid first.
    let err = assert_err!(request(&engine, item, BOB, DAY0 + 6 * DAY_MS, DAY0 + 5 * DAY_MS).await);
    assert!(matches!(err, EngineError::Invalid(_)));

    assert_eq!(engine.owner_unavailability(ALICE).await.len(), 1);
    let ratings = engine.ratings_for_user(ALICE, None);
    assert_eq!(ratings.len(), 1);
    assert_eq!((ratings[0].from_user_id.as_str(), ratings[0].stars), (CAROL, 4));
    let err = assert_err!(engine.rate_claim(ratings[0].claim_id, CAROL, 5, None).await);
    assert!(matches!(err, EngineError::AlreadyExists(_)));
    let err = assert_err!(engine.remove_unavailability(block, BOB).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));
    assert_ok!(engine.remove_unavailability(block, ALICE).await);
    assert_ok!(request(&engine, item, BOB, DAY0 + 4 * DAY_MS, DAY0 + 6 * DAY_MS).await);
}

#[tokio::test]
async fn free_slots_subtract_claims_and_blocks() {
    let (engine, _clock) = setup("free_slots.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + 2 * DAY_MS, DAY0 + 4 * DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();
    engine
        .add_unavailability(Ulid::new(), ALICE, Span::new(DAY0 + 6 * DAY_MS, DAY0 + 7 * DAY_MS), None)
        .await
        .unwrap();

    let free = engine
        .free_slots(item, Span::new(DAY0, DAY0 + 10 * DAY_MS))
        .await
        .unwrap();
    assert_eq!(
        free,
        vec![
            Span::new(DAY0, DAY0 + 2 * DAY_MS),
            Span::new(DAY0 + 4 * DAY_MS, DAY0 + 6 * DAY_MS),
            Span::new(DAY0 + 7 * DAY_MS, DAY0 + 10 * DAY_MS),
        ]
    );
}

// ── Handshakes ───────────────────────────────────────────

#[tokio::test]
async fn intraday_approval_fills_both_handshakes() {
    let (engine, _clock) = setup("intraday_auto.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + 10 * HOUR_MS, DAY0 + 12 * HOUR_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();

    assert_eq!(
        kinds(&engine, claim).await,
        vec![
            ActivityKind::Requested,
            ActivityKind::Approved,
            ActivityKind::PickupProposed,
            ActivityKind::PickupApproved,
            ActivityKind::ReturnProposed,
            ActivityKind::ReturnApproved,
        ]
    );
    let log = engine.get_claim(claim).await.unwrap().activity;
    assert_eq!(log[2].proposal_id, Some(ProposalId::AutoPickup(claim)));
    assert_eq!(log[2].window, Some(Span::hour_from(DAY0 + 10 * HOUR_MS)));
    assert_eq!(log[4].proposal_id, Some(ProposalId::AutoReturn(claim)));
    assert_eq!(log[4].window, Some(Span::hour_from(DAY0 + 12 * HOUR_MS)));
}

#[tokio::test]
async fn latest_proposal_wins() {
    let (engine, _clock) = setup("latest_wins.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();

    let first = engine
        .propose_pickup_window(claim, BOB, DAY0 + DAY_MS + 9 * HOUR_MS)
        .await
        .unwrap();
    let second = engine
        .propose_pickup_window(claim, ALICE, DAY0 + DAY_MS + 14 * HOUR_MS)
        .await
        .unwrap();

    let err = assert_err!(engine.approve_pickup_window(claim, BOB, Some(first)).await);
    assert!(matches!(err, EngineError::InvalidTransition("proposal superseded")));
    let err = assert_err!(engine.approve_pickup_window(claim, ALICE, Some(second)).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));
    assert_ok!(engine.approve_pickup_window(claim, BOB, Some(second)).await);

    let cs = engine.get_claim(claim).await.unwrap();
    match Handshake::fold(&cs.activity, Milestone::Pickup) {
        Handshake::Approved { id, window, .. } => {
            assert_eq!(id, second);
            assert_eq!(window, Span::hour_from(DAY0 + DAY_MS + 14 * HOUR_MS));
        }
        other => panic!("expected approved handshake, got {other:?}"),
    }
}

#[tokio::test]
async fn proposal_window_must_fall_on_the_right_day() {
    let (engine, _clock) = setup("proposal_day.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();

    let err = assert_err!(engine.propose_pickup_window(claim, BOB, DAY0 + 2 * DAY_MS + 9 * HOUR_MS).await);
    assert!(matches!(err, EngineError::Invalid(_)));
    let err = assert_err!(engine.propose_pickup_window(claim, BOB, DAY0 + DAY_MS + 9 * HOUR_MS + MIN).await);
    assert!(matches!(err, EngineError::Invalid(_)));
    // Return cannot be negotiated before pickup.
    let err = assert_err!(engine.propose_return_window(claim, BOB, DAY0 + 3 * DAY_MS + 9 * HOUR_MS).await);
    assert!(matches!(err, EngineError::InvalidTransition(_)));
    let err = assert_err!(engine.propose_pickup_window(claim, CAROL, DAY0 + DAY_MS + 9 * HOUR_MS).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));
}

#[tokio::test]
async fn confirmation_requires_an_approved_window() {
    let (engine, clock) = setup("confirm_needs_approval.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();

    let err = assert_err!(engine.confirm_pickup(claim, BOB, Evidence::default()).await);
    assert!(matches!(err, EngineError::InvalidTransition("no window has been proposed")));

    let window_start = DAY0 + DAY_MS + 9 * HOUR_MS;
    engine.propose_pickup_window(claim, BOB, window_start).await.unwrap();
    clock.set(window_start + 5 * MIN);
    let err = assert_err!(engine.confirm_pickup(claim, ALICE, Evidence::default()).await);
    assert!(matches!(err, EngineError::InvalidTransition("window has not been approved")));
    assert_eq!(state_of(&engine, claim).await, LeaseState::Approved);
}

#[tokio::test]
async fn reproposal_voids_an_earlier_approval() {
    let (engine, clock) = setup("reproposal.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();

    let first = engine.propose_pickup_window(claim, BOB, DAY0 + DAY_MS + 9 * HOUR_MS).await.unwrap();
    engine.approve_pickup_window(claim, ALICE, Some(first)).await.unwrap();
    let second = engine.propose_pickup_window(claim, ALICE, DAY0 + DAY_MS + 10 * HOUR_MS).await.unwrap();

    clock.set(DAY0 + DAY_MS + 10 * HOUR_MS + 5 * MIN);
    let err = assert_err!(engine.confirm_pickup(claim, BOB, Evidence::default()).await);
    assert!(matches!(err, EngineError::InvalidTransition("window has not been approved")));
    let err = assert_err!(engine.approve_pickup_window(claim, BOB, Some(first)).await);
    assert!(matches!(err, EngineError::InvalidTransition("proposal superseded")));

    engine.approve_pickup_window(claim, BOB, Some(second)).await.unwrap();
    assert_ok!(engine.confirm_pickup(claim, BOB, Evidence::default()).await);
    assert_eq!(state_of(&engine, claim).await, LeaseState::PickedUp);
}

#[tokio::test]
async fn lapsed_windows_are_stale() {
    let (engine, clock) = setup("stale_window.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();

    let window_start = DAY0 + DAY_MS + 9 * HOUR_MS;
    let pid = engine.propose_pickup_window(claim, BOB, window_start).await.unwrap();
    clock.set(window_start + HOUR_MS + 1);
    let err = assert_err!(engine.approve_pickup_window(claim, ALICE, Some(pid)).await);
    assert!(matches!(err, EngineError::Stale(id) if id == pid));
    assert_eq!(err.sqlstate(), "25P03");

    // A fresh proposal reopens negotiation.
    let next = engine
        .propose_pickup_window(claim, ALICE, DAY0 + DAY_MS + 15 * HOUR_MS)
        .await
        .unwrap();
    assert_ok!(engine.approve_pickup_window(claim, BOB, Some(next)).await);
}

#[tokio::test]
async fn confirm_outside_window_is_refused() {
    let (engine, clock) = setup("confirm_window.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + 10 * HOUR_MS, DAY0 + 12 * HOUR_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();

    let err = assert_err!(engine.confirm_pickup(claim, BOB, Evidence::default()).await);
    assert!(matches!(err, EngineError::InvalidTransition("window has not started")));
    clock.set(DAY0 + 11 * HOUR_MS + 1);
    let err = assert_err!(engine.confirm_pickup(claim, BOB, Evidence::default()).await);
    assert!(matches!(err, EngineError::Stale(_)));
}

#[tokio::test]
async fn multi_day_loan_end_to_end() {
    let (engine, clock) = setup("multi_day_e2e.wal");
    let item = list(&engine, false).await;
    let start = DAY0 + DAY_MS;
    let end = DAY0 + 3 * DAY_MS;
    let claim = request(&engine, item, BOB, start, end).await.unwrap();
    assert!(inbox_kinds(&engine, ALICE).contains(&NotificationKind::NewRequest));

    engine.approve_claim(claim, ALICE).await.unwrap();
    assert_eq!(kinds(&engine, claim).await, vec![ActivityKind::Requested, ActivityKind::Approved]);

    let pickup = engine.propose_pickup_window(claim, BOB, start + 9 * HOUR_MS).await.unwrap();
    engine.approve_pickup_window(claim, ALICE, Some(pickup)).await.unwrap();
    clock.set(start + 9 * HOUR_MS + 10 * MIN);
    let evidence = Evidence {
        note: Some("charger included".into()),
        photos: vec!["photos/drill-front.jpg".into()],
    };
    engine.confirm_pickup(claim, ALICE, evidence).await.unwrap();
    assert_eq!(state_of(&engine, claim).await, LeaseState::PickedUp);

    let ret = engine.propose_return_window(claim, ALICE, end + 10 * HOUR_MS).await.unwrap();
    engine.approve_return_window(claim, BOB, Some(ret)).await.unwrap();
    clock.set(end + 10 * HOUR_MS + 30 * MIN);
    engine.confirm_return(claim, BOB, Evidence::default()).await.unwrap();

    let cs = engine.get_claim(claim).await.unwrap();
    assert_eq!(project(&cs.activity), LeaseState::Returned);
    assert_eq!(
        cs.activity.iter().map(|a| a.kind).collect::<Vec<_>>(),
        vec![
            ActivityKind::Requested,
            ActivityKind::Approved,
            ActivityKind::PickupProposed,
            ActivityKind::PickupApproved,
            ActivityKind::PickedUp,
            ActivityKind::ReturnProposed,
            ActivityKind::ReturnApproved,
            ActivityKind::Returned,
        ]
    );
    let picked = &cs.activity[4];
    assert_eq!(picked.note.as_deref(), Some("charger included"));
    assert_eq!(picked.photos.len(), 1);
    assert_eq!(picked.proposal_id, Some(pickup));

    // Caches are a pure function of the log.
    assert_eq!(cs.claim.caches, LeaseCaches::from_activity(&cs.activity));
    assert_eq!(project_caches(&cs.claim.caches), project(&cs.activity));
    assert!(cs.activity.windows(2).all(|w| w[0].created_at <= w[1].created_at));

    let bob_inbox = inbox_kinds(&engine, BOB);
    assert!(bob_inbox.contains(&NotificationKind::RequestApproved));
    assert!(bob_inbox.contains(&NotificationKind::PickupConfirmed));
    assert!(bob_inbox.contains(&NotificationKind::ReturnProposed));
    let alice_inbox = inbox_kinds(&engine, ALICE);
    assert!(alice_inbox.contains(&NotificationKind::PickupProposed));
    assert!(alice_inbox.contains(&NotificationKind::ReturnConfirmed));

    // Returned loans no longer hold the calendar.
    assert!(engine.availability(item).await.unwrap().is_empty());
}

// ── Giveaways ────────────────────────────────────────────

#[tokio::test]
async fn giveaway_pickup_transfers_ownership() {
    let (engine, clock) = setup("giveaway.wal");
    let item = list(&engine, true).await;
    let day_start = DAY0 + DAY_MS + 18 * HOUR_MS;

    let err = assert_err!(request(&engine, item, BOB, day_start, day_start + 6 * HOUR_MS).await);
    assert!(matches!(err, EngineError::Invalid(_)));
    let claim = request(&engine, item, BOB, day_start, day_start + DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();
    assert_eq!(
        kinds(&engine, claim).await,
        vec![ActivityKind::Requested, ActivityKind::Approved]
    );

    // Pickup proposals stay on the calendar date the pickup day starts on,
    // even though the 24h span runs into the next date.
    let err = assert_err!(engine.propose_pickup_window(claim, BOB, DAY0 + 2 * DAY_MS + 10 * HOUR_MS).await);
    assert!(matches!(err, EngineError::Invalid("pickup window must be on the start date")));

    let pid = engine.propose_pickup_window(claim, BOB, day_start + HOUR_MS).await.unwrap();
    engine.approve_pickup_window(claim, ALICE, Some(pid)).await.unwrap();
    clock.set(day_start + HOUR_MS + 5 * MIN);
    engine.confirm_pickup(claim, BOB, Evidence::default()).await.unwrap();
    assert_eq!(state_of(&engine, claim).await, LeaseState::Transferred);
    assert_eq!(engine.get_item_info(item).await.unwrap().owner_id, BOB);
    let log = kinds(&engine, claim).await;
    assert_eq!(log.iter().filter(|k| **k == ActivityKind::Transferred).count(), 1);
    assert!(!log.contains(&ActivityKind::ReturnProposed));

    // The new owner still rates the giver as lender.
    assert_ok!(engine.rate_claim(claim, BOB, 5, None).await);
    assert_eq!(engine.ratings_for_user(ALICE, Some(RatedRole::Lender)).len(), 1);

    let err = assert_err!(engine.propose_return_window(claim, BOB, day_start + 2 * HOUR_MS).await);
    assert!(matches!(err, EngineError::InvalidTransition(_)));
}

#[tokio::test]
async fn approved_giveaway_waits_for_a_negotiated_pickup() {
    let (engine, clock) = setup("giveaway_unattended.wal");
    let item = list(&engine, true).await;
    let midnight = DAY0 + DAY_MS;
    let claim = request(&engine, item, BOB, midnight, midnight + DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();

    clock.set(midnight + HOUR_MS + 1);
    let report = engine.run_overdue_sweep().await.unwrap();
    assert_eq!(report.candidates, 0);
    assert_eq!(report.expired, 0);
    assert_eq!(state_of(&engine, claim).await, LeaseState::Approved);
    assert_eq!(engine.availability(item).await.unwrap(), vec![Span::new(midnight, midnight + DAY_MS)]);
}

#[tokio::test]
async fn giveaway_approved_on_its_pickup_day_can_still_be_handed_over() {
    let (engine, clock) = setup("giveaway_same_day.wal");
    let item = list(&engine, true).await;
    // Requested at 08:00 for the day that started at midnight.
    let claim = request(&engine, item, BOB, DAY0, DAY0 + DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();

    let report = engine.run_overdue_sweep().await.unwrap();
    assert_eq!(report.expired, 0);

    let pid = engine.propose_pickup_window(claim, ALICE, DAY0 + 9 * HOUR_MS).await.unwrap();
    engine.approve_pickup_window(claim, BOB, Some(pid)).await.unwrap();
    clock.set(DAY0 + 9 * HOUR_MS + 10 * MIN);
    assert_ok!(engine.confirm_pickup(claim, BOB, Evidence::default()).await);
    assert_eq!(state_of(&engine, claim).await, LeaseState::Transferred);
}

#[tokio::test]
async fn giveaway_pickup_day_must_not_be_over() {
    let (engine, _clock) = setup("giveaway_past.wal");
    let item = list(&engine, true).await;
    let now = DAY0 + 8 * HOUR_MS;

    let err = assert_err!(request(&engine, item, BOB, now - DAY_MS, now).await);
    assert!(matches!(err, EngineError::Invalid("pickup day is in the past")));
    let err = assert_err!(request(&engine, item, BOB, now - 2 * DAY_MS, now - DAY_MS).await);
    assert!(matches!(err, EngineError::Invalid("pickup day is in the past")));
    // Started yesterday evening, still running.
    assert_ok!(request(&engine, item, BOB, now - DAY_MS + HOUR_MS, now + HOUR_MS).await);
}

// ── Escalation and sweep ─────────────────────────────────

#[tokio::test]
async fn sweep_expires_lapsed_pickup_once() {
    let (engine, clock) = setup("sweep_expire.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + 10 * HOUR_MS, DAY0 + 12 * HOUR_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();

    // Window end itself is still within the window.
    clock.set(DAY0 + 11 * HOUR_MS);
    let report = engine.run_overdue_sweep().await.unwrap();
    assert_eq!(report.expired, 0);

    clock.set(DAY0 + 11 * HOUR_MS + 1);
    let report = engine.run_overdue_sweep().await.unwrap();
    assert_eq!(report.expired, 1);
    let again = engine.run_overdue_sweep().await.unwrap();
    assert_eq!(again.expired + again.missing, 0);

    let cs = engine.get_claim(claim).await.unwrap();
    let expired: Vec<_> = cs.activity.iter().filter(|a| a.kind == ActivityKind::Expired).collect();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].actor_id, SYSTEM_ACTOR);
    assert_eq!(project(&cs.activity), LeaseState::Expired);
    assert!(inbox_kinds(&engine, BOB).contains(&NotificationKind::PickupExpired));
    assert!(inbox_kinds(&engine, ALICE).contains(&NotificationKind::PickupExpired));
    assert!(engine.availability(item).await.unwrap().is_empty());
}

#[tokio::test]
async fn sweep_marks_unreturned_item_missing() {
    let (engine, clock) = setup("sweep_missing.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + 10 * HOUR_MS, DAY0 + 12 * HOUR_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();
    clock.set(DAY0 + 10 * HOUR_MS + 30 * MIN);
    engine.confirm_pickup(claim, BOB, Evidence::default()).await.unwrap();

    clock.set(DAY0 + 13 * HOUR_MS + 1);
    let report = engine.run_overdue_sweep().await.unwrap();
    assert_eq!(report.missing, 1);
    assert_eq!(state_of(&engine, claim).await, LeaseState::Missing);
    assert!(inbox_kinds(&engine, ALICE).contains(&NotificationKind::ReturnMissing));
}

#[tokio::test]
async fn stale_candidate_is_skipped_after_new_proposal() {
    let (engine, clock) = setup("sweep_recheck.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();
    engine.propose_pickup_window(claim, BOB, DAY0 + DAY_MS + 9 * HOUR_MS).await.unwrap();

    clock.set(DAY0 + DAY_MS + 10 * HOUR_MS + 1);
    let candidates = engine.collect_overdue(engine.now_ms()).await;
    assert_eq!(candidates.len(), 1);

    // A new proposal lands between collection and resolution.
    engine.propose_pickup_window(claim, ALICE, DAY0 + DAY_MS + 15 * HOUR_MS).await.unwrap();
    assert_eq!(engine.resolve_overdue(candidates[0]).await.unwrap(), None);
    assert_eq!(state_of(&engine, claim).await, LeaseState::Approved);
}

#[tokio::test]
async fn owner_escalations() {
    let (engine, clock) = setup("owner_escalation.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();

    let err = assert_err!(engine.mark_missing(claim, ALICE, None).await);
    assert!(matches!(err, EngineError::InvalidTransition(_)));
    let err = assert_err!(engine.mark_expired(claim, BOB, None).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));
    assert_ok!(engine.mark_expired(claim, ALICE, Some("never showed up".into())).await);
    assert_eq!(state_of(&engine, claim).await, LeaseState::Expired);
    assert!(engine.availability(item).await.unwrap().is_empty());

    let other = request(&engine, item, CAROL, DAY0 + 10 * HOUR_MS, DAY0 + 12 * HOUR_MS).await.unwrap();
    engine.approve_claim(other, ALICE).await.unwrap();
    clock.set(DAY0 + 10 * HOUR_MS + 10 * MIN);
    engine.confirm_pickup(other, CAROL, Evidence::default()).await.unwrap();
    assert_ok!(engine.mark_missing(other, ALICE, None).await);
    assert_eq!(state_of(&engine, other).await, LeaseState::Missing);
}

// ── Cancellation, alerts, delisting ──────────────────────

#[tokio::test]
async fn cancelling_approved_claim_alerts_watchers() {
    let (engine, _clock) = setup("cancel_alerts.wal");
    let item = list(&engine, false).await;
    let pending = request(&engine, item, "dave", DAY0 + 6 * DAY_MS, DAY0 + 7 * DAY_MS).await.unwrap();
    let claim = request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();
    engine.set_availability_alert(item, CAROL, true).await.unwrap();
    let err = assert_err!(engine.set_availability_alert(item, ALICE, true).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));

    // Withdrawing a pending claim frees nothing.
    engine.cancel_claim(pending, "dave").await.unwrap();
    assert!(!inbox_kinds(&engine, CAROL).contains(&NotificationKind::ItemAvailable));

    let err = assert_err!(engine.cancel_claim(claim, ALICE).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));
    engine.cancel_claim(claim, BOB).await.unwrap();

    assert_eq!(inbox_kinds(&engine, CAROL), vec![NotificationKind::ItemAvailable]);
    assert!(engine.alert_subscribers(item).await.unwrap().is_empty());
    assert!(engine.get_claim(claim).await.is_none());
    assert!(engine.availability(item).await.unwrap().is_empty());
}

#[tokio::test]
async fn picked_up_claim_cannot_be_cancelled() {
    let (engine, clock) = setup("cancel_picked_up.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + 10 * HOUR_MS, DAY0 + 12 * HOUR_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();
    clock.set(DAY0 + 10 * HOUR_MS);
    engine.confirm_pickup(claim, ALICE, Evidence::default()).await.unwrap();
    let err = assert_err!(engine.cancel_claim(claim, BOB).await);
    assert!(matches!(err, EngineError::InvalidTransition(_)));
}

#[tokio::test]
async fn delist_waits_for_open_claims() {
    let (engine, _clock) = setup("delist.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 2 * DAY_MS).await.unwrap();

    let err = assert_err!(engine.delist_item(item, ALICE).await);
    assert!(matches!(err, EngineError::InvalidTransition(_)));
    let err = assert_err!(engine.delist_item(item, BOB).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));

    engine.reject_claim(claim, ALICE).await.unwrap();
    assert!(inbox_kinds(&engine, BOB).contains(&NotificationKind::RequestRejected));
    assert_ok!(engine.delist_item(item, ALICE).await);
    assert!(engine.get_item_info(item).await.is_none());
    assert!(engine.get_claim(claim).await.is_none());
}

// ── Identity and listings ────────────────────────────────

#[tokio::test]
async fn permissions_and_identity() {
    let (engine, _clock) = setup("permissions.wal");
    let item = list(&engine, false).await;

    let err = assert_err!(request(&engine, item, "", DAY0 + DAY_MS, DAY0 + 2 * DAY_MS).await);
    assert!(matches!(err, EngineError::Unauthenticated));
    assert_eq!(err.sqlstate(), "28000");
    let err = assert_err!(request(&engine, item, SYSTEM_ACTOR, DAY0 + DAY_MS, DAY0 + 2 * DAY_MS).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));
    let err = assert_err!(request(&engine, item, ALICE, DAY0 + DAY_MS, DAY0 + 2 * DAY_MS).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));

    let claim = request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 2 * DAY_MS).await.unwrap();
    let err = assert_err!(engine.approve_claim(claim, CAROL).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));
    let err = assert_err!(engine.approve_claim(claim, BOB).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));
    let err = assert_err!(engine.lease_activity(claim, CAROL).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));
    let err = assert_err!(engine.claims_for_item(item, BOB).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));

    let err = assert_err!(engine.approve_claim(Ulid::new(), ALICE).await);
    assert!(matches!(err, EngineError::NotFound(_)));
    let err = assert_err!(
        engine
            .request_claim(claim, item, CAROL, Span::new(DAY0 + 5 * DAY_MS, DAY0 + 6 * DAY_MS))
            .await
    );
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn claim_listings_show_state_and_actions() {
    let (engine, _clock) = setup("listings.wal");
    let item = list(&engine, false).await;
    // Started at midnight, clock is 08:00: an unanswered request is past due.
    let late = request(&engine, item, BOB, DAY0, DAY0 + 2 * DAY_MS).await.unwrap();
    let later = request(&engine, item, CAROL, DAY0 + 4 * DAY_MS, DAY0 + 5 * DAY_MS).await.unwrap();

    let owner_view = engine.claims_for_item(item, ALICE).await.unwrap();
    assert_eq!(owner_view.len(), 2);
    let late_info = owner_view.iter().find(|c| c.claim.id == late).unwrap();
    assert_eq!(late_info.state, "past_due");
    assert_eq!(late_info.actions, vec![Action::Approve, Action::Reject]);
    let later_info = owner_view.iter().find(|c| c.claim.id == later).unwrap();
    assert_eq!(later_info.state, "requested");

    let bob_view = engine.claims_for_claimer(BOB).await.unwrap();
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view[0].actions, vec![Action::Cancel]);

    engine.approve_claim(later, ALICE).await.unwrap();
    let carol_view = engine.claims_for_claimer(CAROL).await.unwrap();
    assert_eq!(carol_view[0].state, "approved");
    assert!(carol_view[0].actions.contains(&Action::ProposePickup));
    assert!(carol_view[0].actions.contains(&Action::Cancel));

    assert_eq!(engine.lease_activity(later, CAROL).await.unwrap().len(), 2);
    assert_eq!(engine.list_items().await.len(), 1);
}

#[tokio::test]
async fn inbox_can_be_dismissed() {
    let (engine, _clock) = setup("inbox.wal");
    let item = list(&engine, false).await;
    request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 2 * DAY_MS).await.unwrap();
    request(&engine, item, CAROL, DAY0 + DAY_MS, DAY0 + 2 * DAY_MS).await.unwrap();

    let inbox = engine.notifications(ALICE).unwrap();
    assert_eq!(inbox.len(), 2);
    assert_eq!(engine.dismiss_notifications(ALICE, Some(inbox[0].id)).unwrap(), 1);
    assert_eq!(engine.dismiss_notifications(ALICE, None).unwrap(), 1);
    assert!(engine.notifications(ALICE).unwrap().is_empty());
}

// ── Ratings ──────────────────────────────────────────────

#[tokio::test]
async fn participants_rate_each_other_once_the_lease_begins() {
    let (engine, clock) = setup("ratings.wal");
    let item = list(&engine, false).await;
    let claim = request(&engine, item, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await.unwrap();
    let pending = request(&engine, item, CAROL, DAY0 + 5 * DAY_MS, DAY0 + 6 * DAY_MS).await.unwrap();
    engine.approve_claim(claim, ALICE).await.unwrap();

    let err = assert_err!(engine.rate_claim(claim, BOB, 5, None).await);
    assert!(matches!(err, EngineError::InvalidTransition("lease has not started")));
    assert!(engine.pending_ratings(BOB).await.unwrap().is_empty());

    clock.set(DAY0 + DAY_MS + 9 * HOUR_MS);
    let err = assert_err!(engine.rate_claim(claim, CAROL, 5, None).await);
    assert!(matches!(err, EngineError::Unauthorized(_)));
    for stars in [0, 6, -1] {
        let err = assert_err!(engine.rate_claim(claim, BOB, stars, None).await);
        assert!(matches!(err, EngineError::Invalid(_)));
    }
    let err = assert_err!(engine.rate_claim(pending, CAROL, 4, None).await);
    assert!(matches!(err, EngineError::InvalidTransition("only approved claims can be rated")));

    let todo = engine.pending_ratings(ALICE).await.unwrap();
    assert_eq!(todo.len(), 1);
    assert_eq!(todo[0].target_role, RatedRole::Borrower);
    assert_eq!(todo[0].target_user_id, BOB);

    assert_ok!(engine.rate_claim(claim, BOB, 5, Some("spotless".into())).await);
    let err = assert_err!(engine.rate_claim(claim, BOB, 4, None).await);
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == claim));
    assert_eq!(err.sqlstate(), "23505");
    assert_ok!(engine.rate_claim(claim, ALICE, 3, None).await);
    assert!(engine.pending_ratings(ALICE).await.unwrap().is_empty());

    let received = engine.ratings_for_user(ALICE, None);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].from_user_id, BOB);
    assert_eq!(received[0].role, RatedRole::Lender);
    assert!(engine.ratings_for_user(ALICE, Some(RatedRole::Borrower)).is_empty());

    let alice = engine.rating_summary(ALICE);
    assert_eq!(alice.total, 1);
    assert_eq!(alice.average, Some(5.0));
    assert_eq!(alice.as_lender, RoleSummary { count: 1, average: Some(5.0) });
    assert_eq!(alice.as_borrower, RoleSummary::default());
    let bob = engine.rating_summary(BOB);
    assert_eq!(bob.as_borrower.average, Some(3.0));
    assert_eq!(engine.rating_summary(CAROL).average, None);
}

// ── Durability ───────────────────────────────────────────

async fn durable_scenario(engine: &Engine, clock: &ManualClock) -> (Ulid, Ulid, Ulid) {
    let drill = list(engine, false).await;
    let sofa = list(engine, true).await;
    engine
        .add_unavailability(Ulid::new(), ALICE, Span::new(DAY0 + 8 * DAY_MS, DAY0 + 9 * DAY_MS), None)
        .await
        .unwrap();
    engine.set_availability_alert(drill, CAROL, true).await.unwrap();

    let loan = request(engine, drill, BOB, DAY0 + DAY_MS, DAY0 + 3 * DAY_MS).await.unwrap();
    engine.approve_claim(loan, ALICE).await.unwrap();
    let pid = engine.propose_pickup_window(loan, BOB, DAY0 + DAY_MS + 9 * HOUR_MS).await.unwrap();
    engine.approve_pickup_window(loan, ALICE, Some(pid)).await.unwrap();

    let gift = request(engine, sofa, CAROL, DAY0 + 10 * HOUR_MS, DAY0 + 34 * HOUR_MS).await.unwrap();
    engine.approve_claim(gift, ALICE).await.unwrap();
    let handover = engine.propose_pickup_window(gift, ALICE, DAY0 + 10 * HOUR_MS).await.unwrap();
    engine.approve_pickup_window(gift, CAROL, Some(handover)).await.unwrap();
    clock.set(DAY0 + 10 * HOUR_MS + 15 * MIN);
    engine.confirm_pickup(gift, CAROL, Evidence::default()).await.unwrap();
    engine.rate_claim(gift, CAROL, 4, Some("lovely sofa".into())).await.unwrap();

    let dropped = request(engine, drill, "dave", DAY0 + 5 * DAY_MS, DAY0 + 6 * DAY_MS).await.unwrap();
    engine.cancel_claim(dropped, "dave").await.unwrap();
    (drill, sofa, loan)
}

async fn assert_durable_state(engine: &Engine, drill: Ulid, sofa: Ulid, loan: Ulid) {
    assert_eq!(engine.get_item_info(sofa).await.unwrap().owner_id, CAROL);
    assert_eq!(engine.get_item_info(drill).await.unwrap().owner_id, ALICE);
    assert_eq!(engine.alert_subscribers(drill).await.unwrap(), vec![CAROL.to_string()]);
    assert_eq!(engine.owner_unavailability(ALICE).await.len(), 1);
    let ratings = engine.ratings_for_user(ALICE, None);
    assert_eq!(ratings.len(), 1);
    assert_eq!((ratings[0].from_user_id.as_str(), ratings[0].stars), (CAROL, 4));
    let err = assert_err!(engine.rate_claim(ratings[0].claim_id, CAROL, 5, None).await);
    assert!(matches!(err, EngineError::AlreadyExists(_)));

    let cs = engine.get_claim(loan).await.unwrap();
    assert_eq!(cs.claim.status, ClaimStatus::Approved);
    assert_eq!(cs.activity.len(), 4);
    assert_eq!(cs.claim.caches, LeaseCaches::from_activity(&cs.activity));
    assert!(matches!(
        Handshake::fold(&cs.activity, Milestone::Pickup),
        Handshake::Approved { .. }
    ));
    assert_eq!(engine.claims_for_item(drill, ALICE).await.unwrap().len(), 1);
}

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay_state.wal");
    let clock = Arc::new(ManualClock::new(DAY0 + 8 * HOUR_MS));
    let engine = open(path.clone(), clock.clone());
    let (drill, sofa, loan) = durable_scenario(&engine, &clock).await;
    drop(engine);

    let reopened = open(path, clock);
    assert_durable_state(&reopened, drill, sofa, loan).await;
}

#[tokio::test]
async fn compaction_keeps_transfers_and_logs() {
    let path = test_wal_path("compact_state.wal");
    let clock = Arc::new(ManualClock::new(DAY0 + 8 * HOUR_MS));
    let engine = open(path.clone(), clock.clone());
    let (drill, sofa, loan) = durable_scenario(&engine, &clock).await;

    assert!(engine.appends_since_compact().await.unwrap() > 0);
    let records = engine.compact().await.unwrap();
    assert!(records > 0);
    assert_eq!(engine.appends_since_compact().await.unwrap(), 0);
    assert_durable_state(&engine, drill, sofa, loan).await;
    drop(engine);

    let reopened = open(path, clock);
    assert_durable_state(&reopened, drill, sofa, loan).await;
    // The compacted log still accepts new transitions.
    assert_ok!(reopened.propose_pickup_window(loan, ALICE, DAY0 + DAY_MS + 11 * HOUR_MS).await);
}

#[tokio::test]
async fn concurrent_requests_for_same_dates_approve_at_most_one() {
    let (engine, _clock) = setup("concurrent_approve.wal");
    let engine = Arc::new(engine);
    let item = list(&engine, false).await;
    let mut claims = Vec::new();
    for i in 0..5 {
        let c = request(&engine, item, &format!("user{i}"), DAY0 + DAY_MS, DAY0 + 2 * DAY_MS)
            .await
            .unwrap();
        claims.push(c);
    }

    let handles: Vec<_> = claims
        .iter()
        .map(|&c| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.approve_claim(c, ALICE).await })
        })
        .collect();
    let mut approved = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            approved += 1;
        }
    }
    assert_eq!(approved, 1);
    let guard = engine.get_item(&item).unwrap();
    assert_eq!(guard.read().await.active_approved().count(), 1);
}
