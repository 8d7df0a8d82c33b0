use crate::domain::availability::AvailabilityResolver;
use crate::domain::blocked_slots::BlockedSlotStore;
use crate::domain::models::{AvailabilityConfig, BlockedSlot, Event, SlotKey};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    Occupied { event: Event },
    Blocked { slot: BlockedSlot },
    Available,
    Unavailable,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Occupied { .. } => "occupied",
            Self::Blocked { .. } => "blocked",
            Self::Available => "available",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    #[default]
    Booking,
    ConfigureGeneral,
    ConfigureSpecific,
}

/// What the UI should offer after a slot is selected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SlotAction {
    ShowEvent { event: Event },
    OfferUnblock { key: SlotKey, slot_id: String },
    OfferBlock { key: SlotKey, recurring_allowed: bool },
    ToggleAvailability {
        key: SlotKey,
        currently_available: bool,
        next: AvailabilityConfig,
    },
}

/// Derives the render state of one slot. Precedence: occupied, then blocked,
/// then resolver membership.
pub fn derive_slot_state(
    resolver: &AvailabilityResolver,
    store: &BlockedSlotStore,
    event: Option<Event>,
    weekday: u8,
    date: NaiveDate,
    hour: u8,
) -> SlotState {
    if let Some(event) = event {
        return SlotState::Occupied { event };
    }
    if let Some(slot) = store.get(&SlotKey::new(date, hour)) {
        return SlotState::Blocked { slot: slot.clone() };
    }
    if resolver.is_available(weekday, date, hour) {
        SlotState::Available
    } else {
        SlotState::Unavailable
    }
}

pub fn select_slot(
    state: SlotState,
    resolver: &AvailabilityResolver,
    mode: InteractionMode,
    weekday: u8,
    date: NaiveDate,
    hour: u8,
) -> SlotAction {
    let key = SlotKey::new(date, hour);
    match state {
        SlotState::Occupied { event } => SlotAction::ShowEvent { event },
        SlotState::Blocked { slot } => SlotAction::OfferUnblock {
            key,
            slot_id: slot.id,
        },
        SlotState::Available | SlotState::Unavailable => match mode {
            InteractionMode::Booking => SlotAction::OfferBlock {
                key,
                recurring_allowed: true,
            },
            InteractionMode::ConfigureGeneral => {
                let mut hours = resolver
                    .general(weekday)
                    .cloned()
                    .unwrap_or_else(|| default_hours(resolver, weekday, date));
                let currently_available = toggle(&mut hours, hour);
                SlotAction::ToggleAvailability {
                    key,
                    currently_available,
                    next: AvailabilityConfig::General { weekday, hours },
                }
            }
            InteractionMode::ConfigureSpecific => {
                let mut hours = resolver.resolve_availability(weekday, date);
                let currently_available = toggle(&mut hours, hour);
                SlotAction::ToggleAvailability {
                    key,
                    currently_available,
                    next: AvailabilityConfig::Specific {
                        date,
                        weekday,
                        hours,
                    },
                }
            }
        },
    }
}

fn default_hours(resolver: &AvailabilityResolver, weekday: u8, date: NaiveDate) -> BTreeSet<u8> {
    if resolver.is_configured() {
        BTreeSet::new()
    } else {
        resolver.resolve_availability(weekday, date)
    }
}

// Returns whether the hour was a member before toggling.
fn toggle(hours: &mut BTreeSet<u8>, hour: u8) -> bool {
    if hours.remove(&hour) {
        true
    } else {
        hours.insert(hour);
        false
    }
}
