mod availability;
mod error;
mod mutations;
mod queries;
mod quote;
mod rates;
mod validate;
#[cfg(test)]
mod tests;

pub use availability::{availability, first_sold_out_night};
pub use error::EngineError;
pub use quote::{nightly_rates, quote_stay, NightQuote, Quote, QuoteError};
pub use rates::{resolve_night_rate, weekday_bit, weekday_index, NightRate};
pub(crate) use validate::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomTypeState = Arc<RwLock<RoomTypeState>>;

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
/// 2. Drain all immediately available Appends into the batch.
/// 3. Single flush_sync for the whole batch, then answer every sender.
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

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped: {}", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
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

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedRoomTypeState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: rate plan / hold / booking id → room type id
    pub(super) entity_to_room_type: DashMap<Ulid, Ulid>,
    /// Mutations hold it shared from first lock to apply; compaction holds it
    /// exclusively so its snapshot and the WAL swap see every committed event.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply an event to a RoomTypeState. Caller holds the write lock.
fn apply_to_room_type(rt: &mut RoomTypeState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RatePlanAdded { plan } => {
            entity_map.insert(plan.id, plan.room_type_id);
            rt.insert_rate_plan(plan.clone());
        }
        Event::RatePlanRemoved { id, .. } => {
            rt.remove_rate_plan(*id);
            entity_map.remove(id);
        }
        Event::HoldPlaced {
            id,
            room_type_id,
            stay,
            total,
            expires_at,
        } => {
            rt.insert_allocation(Allocation {
                id: *id,
                stay: *stay,
                total: *total,
                kind: AllocationKind::Hold { expires_at: *expires_at },
            });
            entity_map.insert(*id, *room_type_id);
        }
        Event::BookingConfirmed {
            id,
            room_type_id,
            stay,
            total,
            label,
        } => {
            rt.insert_allocation(Allocation {
                id: *id,
                stay: *stay,
                total: *total,
                kind: AllocationKind::Booking { label: label.clone() },
            });
            entity_map.insert(*id, *room_type_id);
        }
        Event::HoldReleased { id, .. } | Event::BookingCancelled { id, .. } => {
            rt.remove_allocation(*id);
            entity_map.remove(id);
        }
        // RoomTypeCreated/Deleted are handled at the DashMap level, not here
        Event::RoomTypeCreated { .. } | Event::RoomTypeDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            entity_to_room_type: DashMap::new(),
            commit_gate: RwLock::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write never contends.
        // blocking_write is off-limits: this may run inside an async context.
        for event in &events {
            match event {
                Event::RoomTypeCreated { id, name, units } => {
                    let rt = RoomTypeState::new(*id, name.clone(), *units);
                    engine.state.insert(*id, Arc::new(RwLock::new(rt)));
                }
                Event::RoomTypeDeleted { id } => {
                    if let Some((_, rt)) = engine.state.remove(id)
                        && let Ok(guard) = rt.try_read()
                    {
                        engine.forget_entities(&guard);
                    }
                }
                other => {
                    if let Some(room_type_id) = other.room_type_id()
                        && let Some(entry) = engine.state.get(&room_type_id)
                    {
                        let rt = entry.clone();
                        match rt.try_write() {
                            Ok(mut guard) => apply_to_room_type(&mut guard, other, &engine.entity_to_room_type),
                            Err(_) => tracing::warn!("replay: room type {room_type_id} locked, event skipped"),
                        }
                    }
                }
            }
        }

        tracing::debug!(
            "replayed {} events into {} room types from {}",
            events.len(),
            engine.state.len(),
            wal_path.display()
        );
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

    pub fn get_room_type(&self, id: &Ulid) -> Option<SharedRoomTypeState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_room_type_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_room_type.get(entity_id).map(|e| *e.value())
    }

    /// Drop the reverse-lookup entries of everything attached to a room type.
    pub(super) fn forget_entities(&self, rt: &RoomTypeState) {
        for plan in &rt.rate_plans {
            self.entity_to_room_type.remove(&plan.id);
        }
        for allocation in &rt.allocations {
            self.entity_to_room_type.remove(&allocation.id);
        }
    }

    /// Reserve an id in the reverse map. Atomic, so concurrent inserts with
    /// the same id cannot both pass.
    pub(super) fn claim_entity(&self, id: Ulid, room_type_id: Ulid) -> Result<(), EngineError> {
        match self.entity_to_room_type.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(room_type_id);
                Ok(())
            }
        }
    }

    /// `persist_and_apply` for an event whose id was claimed; a failed
    /// append gives the id back.
    pub(super) async fn persist_claimed(
        &self,
        id: Ulid,
        rt: &mut RoomTypeState,
        event: &Event,
    ) -> Result<(), EngineError> {
        let result = self.persist_and_apply(rt, event).await;
        if result.is_err() {
            self.entity_to_room_type.remove(&id);
        }
        result
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(&self, rt: &mut RoomTypeState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room_type(rt, event, &self.entity_to_room_type);
        Ok(())
    }

    /// Lookup entity → room type, get it, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomTypeState>), EngineError> {
        let room_type_id = self
            .get_room_type_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let rt = self
            .get_room_type(&room_type_id)
            .ok_or(EngineError::NotFound(room_type_id))?;
        let guard = rt.write_owned().await;
        Ok((room_type_id, guard))
    }
}
