use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::availability;
use super::quote::{nightly_rates, quote_stay, Quote};
use super::rates::NightRate;
use super::validate::{now_ms, validate_stay};
use super::{Engine, EngineError};

impl Engine {
    /// Snapshot every rate plan of the room type overlapping the stay.
    /// One read lock per quote; nights are then resolved against the copy.
    async fn fetch_rate_plans(&self, room_type_id: Ulid, stay: &Stay) -> Result<Vec<RatePlanInterval>, EngineError> {
        let rt = self
            .get_room_type(&room_type_id)
            .ok_or(EngineError::NotFound(room_type_id))?;
        let guard = rt.read().await;
        Ok(guard.rate_plans_overlapping(stay).cloned().collect())
    }

    /// Price a whole stay; fails on the first night without a rate.
    pub async fn quote(
        &self,
        room_type_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    ) -> Result<Quote, EngineError> {
        let stay = validate_stay(check_in, check_out, MAX_STAY_NIGHTS)?;
        let intervals = self.fetch_rate_plans(room_type_id, &stay).await?;
        let result = quote_stay(Some(room_type_id), &stay, &intervals);
        let outcome = if result.is_ok() { "priced" } else { "unpriced" };
        metrics::counter!(crate::observability::QUOTES_TOTAL, "outcome" => outcome).increment(1);
        Ok(result?)
    }

    /// Per-night resolution including nights with no rate.
    pub async fn nightly_rates(
        &self,
        room_type_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    ) -> Result<Vec<(NaiveDate, NightRate)>, EngineError> {
        let stay = validate_stay(check_in, check_out, MAX_QUERY_NIGHTS)?;
        let intervals = self.fetch_rate_plans(room_type_id, &stay).await?;
        Ok(nightly_rates(Some(room_type_id), &stay, &intervals))
    }

    pub async fn availability(
        &self,
        room_type_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    ) -> Result<Vec<NightAvailability>, EngineError> {
        let stay = validate_stay(check_in, check_out, MAX_QUERY_NIGHTS)?;
        let rt = self
            .get_room_type(&room_type_id)
            .ok_or(EngineError::NotFound(room_type_id))?;
        let guard = rt.read().await;
        Ok(availability(&guard, &stay, now_ms()))
    }

    pub async fn list_room_types(&self) -> Vec<RoomTypeInfo> {
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(shared.len());
        for rt in shared {
            let guard = rt.read().await;
            infos.push(RoomTypeInfo {
                id: guard.id,
                name: guard.name.clone(),
                units: guard.units,
            });
        }
        infos.sort_by_key(|i| i.id);
        infos
    }

    pub async fn get_rate_plans(&self, room_type_id: Ulid) -> Vec<RatePlanInterval> {
        let Some(rt) = self.get_room_type(&room_type_id) else {
            return vec![];
        };
        let guard = rt.read().await;
        guard.rate_plans.clone()
    }

    pub async fn get_bookings(&self, room_type_id: Ulid) -> Vec<BookingInfo> {
        let Some(rt) = self.get_room_type(&room_type_id) else {
            return vec![];
        };
        let guard = rt.read().await;
        guard
            .allocations
            .iter()
            .filter_map(|a| match &a.kind {
                AllocationKind::Booking { label } => Some(BookingInfo {
                    id: a.id,
                    room_type_id,
                    stay: a.stay,
                    total: a.total,
                    label: label.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub async fn get_holds(&self, room_type_id: Ulid) -> Vec<HoldInfo> {
        let Some(rt) = self.get_room_type(&room_type_id) else {
            return vec![];
        };
        let guard = rt.read().await;
        guard
            .allocations
            .iter()
            .filter_map(|a| match &a.kind {
                AllocationKind::Hold { expires_at } => Some(HoldInfo {
                    id: a.id,
                    room_type_id,
                    stay: a.stay,
                    total: a.total,
                    expires_at: *expires_at,
                }),
                _ => None,
            })
            .collect()
    }
}
