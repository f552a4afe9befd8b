use chrono::NaiveDate;

use crate::model::*;

// ── Availability ─────────────────────────────────────────────────

/// Units free on each night of `stay`: `units` minus active allocations covering the night.
pub fn availability(room_type: &RoomTypeState, stay: &Stay, now: Ms) -> Vec<NightAvailability> {
    let active: Vec<Stay> = room_type
        .allocations_overlapping(stay)
        .filter(|a| a.is_active(now))
        .map(|a| a.stay)
        .collect();

    stay.nights()
        .map(|night| NightAvailability {
            night,
            available: room_type.units.saturating_sub(occupancy(&active, night)),
        })
        .collect()
}

/// First night of `stay` on which every unit is already taken.
pub fn first_sold_out_night(room_type: &RoomTypeState, stay: &Stay, now: Ms) -> Option<NaiveDate> {
    availability(room_type, stay, now)
        .into_iter()
        .find(|n| n.available == 0)
        .map(|n| n.night)
}

fn occupancy(stays: &[Stay], night: NaiveDate) -> u32 {
    stays.iter().filter(|s| s.contains_night(night)).count() as u32
}
