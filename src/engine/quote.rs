use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::rates::{resolve_night_rate, NightRate};

// ── Stay Aggregation ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NightQuote {
    pub night: NaiveDate,
    pub rate_plan_id: Ulid,
    pub base_rate: Cents,
    pub total_rate: Cents,
}

/// Priced stay: every night resolved to a rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub room_type_id: Ulid,
    pub stay: Stay,
    pub nights: Vec<NightQuote>,
    pub total: Cents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteError {
    /// First night of the stay without a configured rate.
    Unpriced(NaiveDate),
    Overflow,
}

impl std::fmt::Display for QuoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuoteError::Unpriced(night) => write!(f, "no rate configured for night {night}"),
            QuoteError::Overflow => write!(f, "quote total overflows"),
        }
    }
}

impl std::error::Error for QuoteError {}

/// Resolve every night of the stay, without judging the result.
pub fn nightly_rates(
    room_type_id: Option<Ulid>,
    stay: &Stay,
    intervals: &[RatePlanInterval],
) -> Vec<(NaiveDate, NightRate)> {
    stay.nights()
        .map(|night| (night, resolve_night_rate(room_type_id, night, intervals)))
        .collect()
}

/// All nights must price or the stay is unquotable.
pub fn quote_stay(
    room_type_id: Option<Ulid>,
    stay: &Stay,
    intervals: &[RatePlanInterval],
) -> Result<Quote, QuoteError> {
    let Some(rt) = room_type_id else {
        return Err(QuoteError::Unpriced(stay.check_in));
    };

    let mut nights = Vec::with_capacity(stay.num_nights().max(0) as usize);
    let mut total: Cents = 0;
    for night in stay.nights() {
        match resolve_night_rate(Some(rt), night, intervals) {
            NightRate::Priced { rate_plan_id, base_rate, total_rate } => {
                total = total.checked_add(total_rate).ok_or(QuoteError::Overflow)?;
                nights.push(NightQuote { night, rate_plan_id, base_rate, total_rate });
            }
            NightRate::NoRate => return Err(QuoteError::Unpriced(night)),
        }
    }

    Ok(Quote {
        room_type_id: rt,
        stay: *stay,
        nights,
        total,
    })
}
