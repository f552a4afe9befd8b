use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::quote::quote_stay;
use super::validate::{check_units_free, now_ms, today, validate_rate_plan, validate_stay};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_room_type(&self, id: Ulid, name: Option<String>, units: u32) -> Result<(), EngineError> {
        if self.state.len() >= MAX_ROOM_TYPES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many room types"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("room type name too long"));
        }
        if units > MAX_UNITS_PER_ROOM_TYPE {
            return Err(EngineError::LimitExceeded("too many units"));
        }

        let _commit = self.commit_gate.read().await;
        let rt = Arc::new(RwLock::new(RoomTypeState::new(id, name.clone(), units)));
        // Readers of the new room type wait until its creation is durable.
        let _pending = rt.clone().write_owned().await;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(rt);
            }
        }

        let event = Event::RoomTypeCreated { id, name, units };
        if let Err(e) = self.wal_append(&event).await {
            self.state.remove(&id);
            return Err(e);
        }
        tracing::debug!("room type {id} created with {units} units");
        Ok(())
    }

    pub async fn delete_room_type(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let rt = self.get_room_type(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rt.write().await;
        if !guard.allocations.is_empty() {
            return Err(EngineError::HasAllocations(id));
        }

        let event = Event::RoomTypeDeleted { id };
        self.wal_append(&event).await?;
        self.forget_entities(&guard);
        self.state.remove(&id);
        tracing::debug!("room type {id} deleted");
        Ok(())
    }

    pub async fn add_rate_plan(&self, plan: RatePlanInterval) -> Result<(), EngineError> {
        validate_rate_plan(&plan)?;
        if self.entity_to_room_type.contains_key(&plan.id) {
            return Err(EngineError::AlreadyExists(plan.id));
        }
        let _commit = self.commit_gate.read().await;
        let (id, room_type_id) = (plan.id, plan.room_type_id);
        let rt = self
            .get_room_type(&room_type_id)
            .ok_or(EngineError::NotFound(room_type_id))?;
        let mut guard = rt.write().await;
        if guard.rate_plans.len() >= MAX_RATE_PLANS_PER_ROOM_TYPE {
            return Err(EngineError::LimitExceeded("too many rate plans on room type"));
        }

        self.claim_entity(id, room_type_id)?;
        let event = Event::RatePlanAdded { plan };
        self.persist_claimed(id, &mut guard, &event).await
    }

    pub async fn remove_rate_plan(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (room_type_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.rate_plans.iter().any(|p| p.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RatePlanRemoved { id, room_type_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room_type_id)
    }

    /// Reserve one unit for a pending checkout until `expires_at`.
    pub async fn place_hold(
        &self,
        id: Ulid,
        room_type_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        expires_at: Ms,
    ) -> Result<Cents, EngineError> {
        let stay = validate_stay(check_in, check_out, MAX_STAY_NIGHTS)?;
        if self.entity_to_room_type.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let _commit = self.commit_gate.read().await;
        let rt = self
            .get_room_type(&room_type_id)
            .ok_or(EngineError::NotFound(room_type_id))?;
        let mut guard = rt.write().await;
        check_open_allocations(&guard)?;

        let total = priced_and_free(&guard, &stay)?;
        self.claim_entity(id, room_type_id)?;
        let event = Event::HoldPlaced { id, room_type_id, stay, total, expires_at };
        self.persist_claimed(id, &mut guard, &event).await?;
        Ok(total)
    }

    pub async fn release_hold(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (room_type_id, mut guard) = self.resolve_entity_write(&id).await?;
        let is_hold = guard
            .allocations
            .iter()
            .any(|a| a.id == id && matches!(a.kind, AllocationKind::Hold { .. }));
        if !is_hold {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::HoldReleased { id, room_type_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room_type_id)
    }

    /// Book one unit for every night of the stay. All nights must be priced
    /// and have a free unit; the quoted total is stored with the booking.
    pub async fn confirm_booking(
        &self,
        id: Ulid,
        room_type_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        label: Option<String>,
    ) -> Result<Cents, EngineError> {
        let stay = validate_stay(check_in, check_out, MAX_STAY_NIGHTS)?;
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN
        {
            return Err(EngineError::LimitExceeded("label too long"));
        }
        if self.entity_to_room_type.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let _commit = self.commit_gate.read().await;
        let rt = self
            .get_room_type(&room_type_id)
            .ok_or(EngineError::NotFound(room_type_id))?;
        let mut guard = rt.write().await;
        check_open_allocations(&guard)?;

        let total = priced_and_free(&guard, &stay)?;
        self.claim_entity(id, room_type_id)?;
        let event = Event::BookingConfirmed { id, room_type_id, stay, total, label };
        self.persist_claimed(id, &mut guard, &event).await?;
        Ok(total)
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (room_type_id, mut guard) = self.resolve_entity_write(&id).await?;
        let is_booking = guard
            .allocations
            .iter()
            .any(|a| a.id == id && matches!(a.kind, AllocationKind::Booking { .. }));
        if !is_booking {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BookingCancelled { id, room_type_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room_type_id)
    }

    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            let rt = entry.value().clone();
            if let Ok(guard) = rt.try_read() {
                for allocation in &guard.allocations {
                    if let AllocationKind::Hold { expires_at } = allocation.kind
                        && expires_at <= now
                    {
                        expired.push((allocation.id, guard.id));
                    }
                }
            }
        }
        expired
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    /// No mutation runs between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _commit = self.commit_gate.write().await;
        let mut events = Vec::new();
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();

        for rt in shared {
            let guard = rt.read().await;
            events.push(Event::RoomTypeCreated {
                id: guard.id,
                name: guard.name.clone(),
                units: guard.units,
            });
            for plan in &guard.rate_plans {
                events.push(Event::RatePlanAdded { plan: plan.clone() });
            }
            for allocation in &guard.allocations {
                events.push(match &allocation.kind {
                    AllocationKind::Hold { expires_at } => Event::HoldPlaced {
                        id: allocation.id,
                        room_type_id: guard.id,
                        stay: allocation.stay,
                        total: allocation.total,
                        expires_at: *expires_at,
                    },
                    AllocationKind::Booking { label } => Event::BookingConfirmed {
                        id: allocation.id,
                        room_type_id: guard.id,
                        stay: allocation.stay,
                        total: allocation.total,
                        label: label.clone(),
                    },
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::debug!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn check_open_allocations(rt: &RoomTypeState) -> Result<(), EngineError> {
    if rt.open_allocation_count(today(), now_ms()) >= MAX_OPEN_ALLOCATIONS_PER_ROOM_TYPE {
        return Err(EngineError::LimitExceeded("too many open holds and bookings on room type"));
    }
    Ok(())
}

/// Quote the stay against the room type's own plans, then make sure a unit is free.
fn priced_and_free(rt: &RoomTypeState, stay: &Stay) -> Result<Cents, EngineError> {
    let intervals: Vec<RatePlanInterval> = rt.rate_plans_overlapping(stay).cloned().collect();
    let quote = quote_stay(Some(rt.id), stay, &intervals)?;
    check_units_free(rt, stay, now_ms())?;
    Ok(quote.total)
}
