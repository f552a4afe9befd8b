use chrono::NaiveDate;
use ulid::Ulid;

use super::quote::QuoteError;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Room type still has holds or bookings.
    HasAllocations(Ulid),
    /// No rate configured for this night of the stay.
    Unpriced(NaiveDate),
    /// Every unit is taken on this night.
    SoldOut(NaiveDate),
    InvalidStay(&'static str),
    InvalidRatePlan(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::HasAllocations(id) => {
                write!(f, "cannot delete room type {id}: has holds or bookings")
            }
            EngineError::Unpriced(night) => write!(f, "no rate configured for night {night}"),
            EngineError::SoldOut(night) => write!(f, "sold out on night {night}"),
            EngineError::InvalidStay(msg) => write!(f, "invalid stay: {msg}"),
            EngineError::InvalidRatePlan(msg) => write!(f, "invalid rate plan: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<QuoteError> for EngineError {
    fn from(e: QuoteError) -> Self {
        match e {
            QuoteError::Unpriced(night) => EngineError::Unpriced(night),
            QuoteError::Overflow => EngineError::LimitExceeded("quote total overflows"),
        }
    }
}
