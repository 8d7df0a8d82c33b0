pub mod availability;
pub mod blocked_slots;
pub mod error;
pub mod models;
pub mod slot_state;
pub mod week_calendar;
