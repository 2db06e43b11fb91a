mod availability;
mod claims;
mod conflict;
mod error;
mod handshake;
pub mod projection;
mod queries;
mod ratings;
mod store;
mod sweep;
#[cfg(test)]
mod tests;

pub use availability::{busy_spans, merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use handshake::Evidence;
pub use queries::ClaimInfo;
pub use ratings::{PendingRating, RatingSummary, RoleSummary};
pub use sweep::{OverdueCandidate, SweepReport};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::{Notification, NotificationKind, NotifyHub};
use crate::wal::Wal;

pub type SharedItemState = Arc<RwLock<ItemState>>;
pub type SharedCalendar = Arc<RwLock<OwnerCalendar>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineSettings {
    /// Offset of the community's local time from UTC, used for day boundaries.
    pub utc_offset_ms: Ms,
}

pub struct Engine {
    pub(super) items: DashMap<Ulid, SharedItemState>,
    pub(super) calendars: DashMap<UserId, SharedCalendar>,
    /// Reverse lookup: claim id → item id
    pub(super) claim_to_item: DashMap<Ulid, Ulid>,
    /// Reverse lookup: unavailability block id → owner
    pub(super) block_to_owner: DashMap<Ulid, UserId>,
    /// Ratings by claim id.
    pub(super) ratings: DashMap<Ulid, Vec<Rating>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss a concurrent commit.
    pub(super) commit_gate: RwLock<()>,
    pub(super) sweep_lock: Mutex<()>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::open_and_replay(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            items: DashMap::new(),
            calendars: DashMap::new(),
            claim_to_item: DashMap::new(),
            block_to_owner: DashMap::new(),
            ratings: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            sweep_lock: Mutex::new(()),
            notify,
            clock,
            settings,
        };

        // Replay into plain values first; nothing else can observe them yet.
        let mut items: HashMap<Ulid, ItemState> = HashMap::new();
        let mut calendars: HashMap<UserId, OwnerCalendar> = HashMap::new();
        for event in &events {
            match event {
                Event::ItemListed { id, .. } => {
                    if let Some(state) = store::new_item_state(event) {
                        items.insert(*id, state);
                    }
                }
                Event::ItemDelisted { id } => {
                    if let Some(state) = items.remove(id) {
                        for claim_id in state.claims.keys() {
                            engine.claim_to_item.remove(claim_id);
                        }
                    }
                }
                Event::UnavailabilityAdded { owner_id, .. } => {
                    let cal = calendars.entry(owner_id.clone()).or_default();
                    store::apply_to_calendar(cal, event, &engine.block_to_owner);
                }
                Event::UnavailabilityRemoved { owner_id, .. } => {
                    if let Some(cal) = calendars.get_mut(owner_id) {
                        store::apply_to_calendar(cal, event, &engine.block_to_owner);
                    }
                }
                Event::RatingRecorded { rating } => store::apply_rating(&engine.ratings, rating),
                other => {
                    if let Some(item_id) = other.item_id()
                        && let Some(state) = items.get_mut(&item_id) {
                            store::apply_to_item(state, other, &engine.claim_to_item);
                        }
                }
            }
        }
        for (id, state) in items {
            engine.items.insert(id, Arc::new(RwLock::new(state)));
        }
        for (owner, cal) in calendars {
            engine.calendars.insert(owner, Arc::new(RwLock::new(cal)));
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn get_item(&self, id: &Ulid) -> Option<SharedItemState> {
        self.items.get(id).map(|e| e.value().clone())
    }

    pub fn get_item_for_claim(&self, claim_id: &Ulid) -> Option<Ulid> {
        self.claim_to_item.get(claim_id).map(|e| *e.value())
    }

    pub(super) fn calendar_of(&self, owner: &str) -> Option<SharedCalendar> {
        self.calendars.get(owner).map(|e| e.value().clone())
    }

    /// WAL-append + apply + notify. The caller holds the item write lock,
    /// which makes the three steps one transaction.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut ItemState,
        event: &Event,
        notifications: Vec<Notification>,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        store::apply_to_item(state, event, &self.claim_to_item);
        record_transitions(event);
        for n in notifications {
            self.notify.deliver(n);
        }
        Ok(())
    }

    pub(super) async fn persist_calendar(
        &self,
        cal: &mut OwnerCalendar,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        store::apply_to_calendar(cal, event, &self.block_to_owner);
        Ok(())
    }

    /// Lookup claim → item, acquire the item write lock, and make sure the
    /// claim survived until the lock was granted.
    pub(super) async fn resolve_claim_write(
        &self,
        claim_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ItemState>, EngineError> {
        let item_id = self
            .get_item_for_claim(claim_id)
            .ok_or(EngineError::NotFound(*claim_id))?;
        let state = self.get_item(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = state.write_owned().await;
        if !guard.claims.contains_key(claim_id) {
            return Err(EngineError::NotFound(*claim_id));
        }
        Ok(guard)
    }

    pub(super) fn notification(
        &self,
        recipient: &str,
        kind: NotificationKind,
        item_id: Ulid,
        claim_id: Option<Ulid>,
        window: Option<Span>,
    ) -> Notification {
        Notification {
            id: Ulid::new(),
            recipient_id: recipient.to_string(),
            kind,
            item_id,
            claim_id,
            window,
            created_at: self.clock.now_ms(),
        }
    }

    pub async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    /// Rewrite the WAL as the minimal event set that recreates current state.
    pub async fn compact(&self) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        let calendars: Vec<SharedCalendar> = self.calendars.iter().map(|e| e.value().clone()).collect();
        for cal in calendars {
            store::snapshot_calendar(&*cal.read().await, &mut events);
        }
        let items: Vec<SharedItemState> = self.items.iter().map(|e| e.value().clone()).collect();
        for item in items {
            store::snapshot_item(&*item.read().await, &mut events);
        }
        store::snapshot_ratings(&self.ratings, &mut events);

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        Ok(count)
    }
}

/// Activity factory for one transition at `at`.
pub(super) fn activity(
    item_id: Ulid,
    claim_id: Ulid,
    kind: ActivityKind,
    actor: &str,
    at: Ms,
) -> LeaseActivity {
    LeaseActivity {
        id: Ulid::new(),
        item_id,
        claim_id,
        kind,
        actor_id: actor.to_string(),
        created_at: at,
        proposal_id: None,
        window: None,
        note: None,
        photos: Vec::new(),
    }
}

fn record_transitions(event: &Event) {
    match event {
        Event::ClaimRequested { activity, .. } => {
            metrics::counter!(crate::observability::LEASE_TRANSITIONS_TOTAL, "kind" => activity.kind.as_str())
                .increment(1);
        }
        Event::LeaseRecorded { activities, .. } => {
            for a in activities {
                metrics::counter!(crate::observability::LEASE_TRANSITIONS_TOTAL, "kind" => a.kind.as_str())
                    .increment(1);
            }
        }
        _ => {}
    }
}
