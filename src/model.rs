use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for hold expiry.
pub type Ms = i64;

/// Money in the smallest currency unit.
pub type Cents = i64;

/// Every weekday bit set (Monday = bit 0 … Sunday = bit 6).
pub const ALL_DAYS: u8 = 0b111_1111;

/// Half-open stay `[check_in, check_out)`. Each date in it is one night.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl Stay {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        debug_assert!(check_in < check_out, "Stay check_in must be before check_out");
        Self { check_in, check_out }
    }

    pub fn num_nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    /// Iterate the nights of the stay; the checkout date is not a night.
    pub fn nights(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.check_out;
        std::iter::successors(Some(self.check_in), |d| d.succ_opt()).take_while(move |d| *d < end)
    }

    pub fn contains_night(&self, night: NaiveDate) -> bool {
        self.check_in <= night && night < self.check_out
    }

    pub fn overlaps(&self, other: &Stay) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }
}

/// Date- and weekday-scoped pricing rule for one room type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePlanInterval {
    pub id: Ulid,
    pub room_type_id: Ulid,
    /// First covered night.
    pub start_date: NaiveDate,
    /// First night NOT covered.
    pub end_date: NaiveDate,
    /// Bit `i` applies the plan on weekday `i`, Monday = 0.
    pub dow_mask: u8,
    /// Stop-sell: never selected by the resolver.
    pub closed: bool,
    pub priority: i32,
    pub base_rate: Cents,
}

impl RatePlanInterval {
    pub fn covers(&self, night: NaiveDate) -> bool {
        self.start_date <= night && night < self.end_date
    }

    pub fn applies_on(&self, weekday_bit: u8) -> bool {
        self.dow_mask & weekday_bit != 0
    }
}

/// What an allocation represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationKind {
    /// Pending checkout, stops occupying a unit at `expires_at`.
    Hold { expires_at: Ms },
    /// Confirmed stay with optional guest label.
    Booking { label: Option<String> },
}

/// One unit of a room type occupied for every night of `stay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub stay: Stay,
    /// Quoted total when the allocation was made.
    pub total: Cents,
    pub kind: AllocationKind,
}

impl Allocation {
    pub fn is_active(&self, now: Ms) -> bool {
        match self.kind {
            AllocationKind::Hold { expires_at } => expires_at > now,
            AllocationKind::Booking { .. } => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoomTypeState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Physical rooms sellable per night.
    pub units: u32,
    /// Sorted by `start_date`.
    pub rate_plans: Vec<RatePlanInterval>,
    /// Sorted by `stay.check_in`.
    pub allocations: Vec<Allocation>,
}

impl RoomTypeState {
    pub fn new(id: Ulid, name: Option<String>, units: u32) -> Self {
        Self {
            id,
            name,
            units,
            rate_plans: Vec::new(),
            allocations: Vec::new(),
        }
    }

    pub fn insert_rate_plan(&mut self, plan: RatePlanInterval) {
        let pos = self
            .rate_plans
            .binary_search_by_key(&plan.start_date, |p| p.start_date)
            .unwrap_or_else(|e| e);
        self.rate_plans.insert(pos, plan);
    }

    pub fn remove_rate_plan(&mut self, id: Ulid) -> Option<RatePlanInterval> {
        let pos = self.rate_plans.iter().position(|p| p.id == id)?;
        Some(self.rate_plans.remove(pos))
    }

    pub fn insert_allocation(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .binary_search_by_key(&allocation.stay.check_in, |a| a.stay.check_in)
            .unwrap_or_else(|e| e);
        self.allocations.insert(pos, allocation);
    }

    pub fn remove_allocation(&mut self, id: Ulid) -> Option<Allocation> {
        let pos = self.allocations.iter().position(|a| a.id == id)?;
        Some(self.allocations.remove(pos))
    }

    /// Allocations still occupying or about to occupy a unit: live at `now`
    /// and checking out after `today`. Past stays stay stored but do not count.
    pub fn open_allocation_count(&self, today: NaiveDate, now: Ms) -> usize {
        self.allocations
            .iter()
            .filter(|a| a.stay.check_out > today && a.is_active(now))
            .count()
    }

    /// Rate plans whose range overlaps the stay.
    /// Binary search skips plans starting on or after `stay.check_out`.
    pub fn rate_plans_overlapping(&self, stay: &Stay) -> impl Iterator<Item = &RatePlanInterval> {
        let right_bound = self
            .rate_plans
            .partition_point(|p| p.start_date < stay.check_out);
        self.rate_plans[..right_bound]
            .iter()
            .filter(move |p| p.end_date > stay.check_in)
    }

    pub fn allocations_overlapping(&self, stay: &Stay) -> impl Iterator<Item = &Allocation> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.stay.check_in < stay.check_out);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.stay.overlaps(stay))
    }
}

/// Flat event records; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomTypeCreated {
        id: Ulid,
        name: Option<String>,
        units: u32,
    },
    RoomTypeDeleted {
        id: Ulid,
    },
    RatePlanAdded {
        plan: RatePlanInterval,
    },
    RatePlanRemoved {
        id: Ulid,
        room_type_id: Ulid,
    },
    HoldPlaced {
        id: Ulid,
        room_type_id: Ulid,
        stay: Stay,
        total: Cents,
        expires_at: Ms,
    },
    HoldReleased {
        id: Ulid,
        room_type_id: Ulid,
    },
    BookingConfirmed {
        id: Ulid,
        room_type_id: Ulid,
        stay: Stay,
        total: Cents,
        label: Option<String>,
    },
    BookingCancelled {
        id: Ulid,
        room_type_id: Ulid,
    },
}

impl Event {
    /// Room type whose state the event changes (create/delete are handled at map level).
    pub fn room_type_id(&self) -> Option<Ulid> {
        match self {
            Event::RatePlanAdded { plan } => Some(plan.room_type_id),
            Event::RatePlanRemoved { room_type_id, .. }
            | Event::HoldPlaced { room_type_id, .. }
            | Event::HoldReleased { room_type_id, .. }
            | Event::BookingConfirmed { room_type_id, .. }
            | Event::BookingCancelled { room_type_id, .. } => Some(*room_type_id),
            Event::RoomTypeCreated { .. } | Event::RoomTypeDeleted { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomTypeInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub units: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub room_type_id: Ulid,
    pub stay: Stay,
    pub total: Cents,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldInfo {
    pub id: Ulid,
    pub room_type_id: Ulid,
    pub stay: Stay,
    pub total: Cents,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NightAvailability {
    pub night: NaiveDate,
    pub available: u32,
}
