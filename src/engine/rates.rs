use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::model::*;

// ── Night Rate Resolution ─────────────────────────────────────────

/// Outcome of resolving one night. `NoRate` is an expected result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NightRate {
    Priced {
        rate_plan_id: Ulid,
        base_rate: Cents,
        /// Equal to `base_rate` until surcharges are layered on top.
        total_rate: Cents,
    },
    NoRate,
}

impl NightRate {
    pub fn base_rate(&self) -> Option<Cents> {
        match self {
            NightRate::Priced { base_rate, .. } => Some(*base_rate),
            NightRate::NoRate => None,
        }
    }

    pub fn total_rate(&self) -> Option<Cents> {
        match self {
            NightRate::Priced { total_rate, .. } => Some(*total_rate),
            NightRate::NoRate => None,
        }
    }

    pub fn rate_plan_id(&self) -> Option<Ulid> {
        match self {
            NightRate::Priced { rate_plan_id, .. } => Some(*rate_plan_id),
            NightRate::NoRate => None,
        }
    }
}

/// Weekday index with Monday = 0 … Sunday = 6.
pub fn weekday_index(night: NaiveDate) -> u32 {
    night.weekday().num_days_from_monday()
}

/// The `dow_mask` bit that must be set for a plan to apply on `night`.
pub fn weekday_bit(night: NaiveDate) -> u8 {
    1 << weekday_index(night)
}

/// Pick the rate plan that prices `night` for `room_type_id`.
///
/// Candidates are open plans of the same room type whose `[start_date, end_date)`
/// contains the night and whose mask has the night's weekday bit. Highest
/// `priority` wins; equal priorities go to the most recently created plan
/// (greatest ULID). No room type means no rate, and `intervals` is not read.
pub fn resolve_night_rate(
    room_type_id: Option<Ulid>,
    night: NaiveDate,
    intervals: &[RatePlanInterval],
) -> NightRate {
    let Some(room_type_id) = room_type_id else {
        return NightRate::NoRate;
    };
    let bit = weekday_bit(night);

    let winner = intervals
        .iter()
        .filter(|p| p.room_type_id == room_type_id)
        .filter(|p| !p.closed && p.covers(night) && p.applies_on(bit))
        .max_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));

    match winner {
        Some(plan) => NightRate::Priced {
            rate_plan_id: plan.id,
            base_rate: plan.base_rate,
            total_rate: plan.base_rate,
        },
        None => NightRate::NoRate,
    }
}
