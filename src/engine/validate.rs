use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;

use super::availability::first_sold_out_night;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

/// Current UTC calendar date.
pub(crate) fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

fn date_in_range(date: NaiveDate) -> bool {
    (MIN_VALID_YEAR..=MAX_VALID_YEAR).contains(&date.year())
}

/// Reject malformed ranges before any rate plan is read.
pub(crate) fn validate_stay(check_in: NaiveDate, check_out: NaiveDate, max_nights: i64) -> Result<Stay, EngineError> {
    if !date_in_range(check_in) || !date_in_range(check_out) {
        return Err(EngineError::InvalidStay("date out of range"));
    }
    if check_out <= check_in {
        return Err(EngineError::InvalidStay("check_out must be after check_in"));
    }
    let stay = Stay::new(check_in, check_out);
    if stay.num_nights() > max_nights {
        return Err(EngineError::InvalidStay("stay too long"));
    }
    Ok(stay)
}

pub(crate) fn validate_rate_plan(plan: &RatePlanInterval) -> Result<(), EngineError> {
    if !date_in_range(plan.start_date) || !date_in_range(plan.end_date) {
        return Err(EngineError::InvalidRatePlan("date out of range"));
    }
    if plan.end_date <= plan.start_date {
        return Err(EngineError::InvalidRatePlan("end_date must be after start_date"));
    }
    if (plan.end_date - plan.start_date).num_days() > MAX_RATE_PLAN_DAYS {
        return Err(EngineError::InvalidRatePlan("date range too wide"));
    }
    if plan.dow_mask == 0 || plan.dow_mask > ALL_DAYS {
        return Err(EngineError::InvalidRatePlan("dow_mask must be within 1..=127"));
    }
    if plan.base_rate < 0 {
        return Err(EngineError::InvalidRatePlan("base_rate must not be negative"));
    }
    Ok(())
}

pub(crate) fn check_units_free(rt: &RoomTypeState, stay: &Stay, now: Ms) -> Result<(), EngineError> {
    match first_sold_out_night(rt, stay, now) {
        Some(night) => Err(EngineError::SoldOut(night)),
        None => Ok(()),
    }
}
