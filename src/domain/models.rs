use crate::domain::error::SlotError;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

/// Display names indexed by weekday number, 0 = Sunday.
pub const WEEKDAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeekDay {
    pub weekday: u8,
    pub date: NaiveDate,
    pub name: String,
    pub is_today: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatingHours {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl Default for OperatingHours {
    fn default() -> Self {
        Self {
            start_hour: 8,
            end_hour: 23,
        }
    }
}

impl OperatingHours {
    pub fn validate(&self) -> Result<(), SlotError> {
        if self.end_hour > 24 {
            return Err(SlotError::InvalidInput(
                "operating_hours.end_hour must be <= 24".to_string(),
            ));
        }
        if self.start_hour >= self.end_hour {
            return Err(SlotError::InvalidInput(
                "operating_hours.start_hour must be before end_hour".to_string(),
            ));
        }
        Ok(())
    }

    pub fn contains(&self, hour: u8) -> bool {
        hour >= self.start_hour && hour < self.end_hour
    }

    pub fn hours(&self) -> BTreeSet<u8> {
        (self.start_hour..self.end_hour).collect()
    }

    pub fn check_hour(&self, hour: u8) -> Result<(), SlotError> {
        if self.contains(hour) {
            return Ok(());
        }
        Err(SlotError::InvalidInput(format!(
            "hour {hour} is outside operating hours {}..{}",
            self.start_hour, self.end_hour
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeSlot {
    pub hour: u8,
    pub label: String,
}

impl TimeSlot {
    pub fn new(hour: u8) -> Self {
        Self {
            hour,
            label: format!("{hour:02}:00"),
        }
    }
}

/// Composite identity of a slot. The exact date is the key axis; two slots on
/// the same weekday of different weeks never compare equal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub hour: u8,
}

impl SlotKey {
    pub fn new(date: NaiveDate, hour: u8) -> Self {
        Self { date, hour }
    }

    pub fn weekday(&self) -> u8 {
        weekday_index(self.date)
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:02}", self.date.format(ISO_DATE_FORMAT), self.hour)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlotOrigin {
    LocalPending,
    ServerConfirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockedSlot {
    pub id: String,
    pub date: NaiveDate,
    pub hour: u8,
    pub weekday: u8,
    pub recurring: bool,
    pub origin: SlotOrigin,
}

impl BlockedSlot {
    pub fn new(
        id: impl Into<String>,
        date: NaiveDate,
        hour: u8,
        recurring: bool,
        origin: SlotOrigin,
    ) -> Self {
        Self {
            id: id.into(),
            date,
            hour,
            weekday: weekday_index(date),
            recurring,
            origin,
        }
    }

    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.date, self.hour)
    }

    pub fn is_confirmed(&self) -> bool {
        self.origin == SlotOrigin::ServerConfirmed
    }

    pub fn validate(&self) -> Result<(), SlotError> {
        if self.id.trim().is_empty() {
            return Err(SlotError::InvalidInput(
                "blocked_slot.id must not be empty".to_string(),
            ));
        }
        if self.hour > 23 {
            return Err(SlotError::InvalidInput(
                "blocked_slot.hour must be <= 23".to_string(),
            ));
        }
        if self.weekday != weekday_index(self.date) {
            return Err(SlotError::InvalidInput(format!(
                "blocked_slot.weekday {} does not match date {}",
                self.weekday, self.date
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum AvailabilityConfig {
    General {
        weekday: u8,
        hours: BTreeSet<u8>,
    },
    Specific {
        date: NaiveDate,
        weekday: u8,
        hours: BTreeSet<u8>,
    },
}

impl AvailabilityConfig {
    pub fn hours(&self) -> &BTreeSet<u8> {
        match self {
            Self::General { hours, .. } | Self::Specific { hours, .. } => hours,
        }
    }

    pub fn weekday(&self) -> u8 {
        match self {
            Self::General { weekday, .. } | Self::Specific { weekday, .. } => *weekday,
        }
    }
}

/// Read-only view of a booked event occupying `start_hour..end_hour` on `date`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub date: NaiveDate,
    pub start_hour: u8,
    pub end_hour: u8,
}

impl Event {
    pub fn validate(&self) -> Result<(), SlotError> {
        if self.id.trim().is_empty() {
            return Err(SlotError::InvalidInput("event.id must not be empty".to_string()));
        }
        if self.end_hour <= self.start_hour || self.end_hour > 24 {
            return Err(SlotError::InvalidInput(
                "event.end_hour must be after event.start_hour and <= 24".to_string(),
            ));
        }
        Ok(())
    }

    pub fn occupies(&self, date: NaiveDate, hour: u8) -> bool {
        self.date == date && hour >= self.start_hour && hour < self.end_hour
    }

    pub fn slot_keys(&self) -> impl Iterator<Item = SlotKey> + '_ {
        (self.start_hour..self.end_hour).map(|hour| SlotKey::new(self.date, hour))
    }
}

pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

pub fn weekday_name(index: u8) -> Option<&'static str> {
    WEEKDAY_NAMES.get(usize::from(index)).copied()
}

pub fn validate_weekday(weekday: u8) -> Result<(), SlotError> {
    if weekday > 6 {
        return Err(SlotError::InvalidInput(format!(
            "weekday must be 0..=6, got {weekday}"
        )));
    }
    Ok(())
}

/// Parses a strict `yyyy-mm-dd` calendar date. Timestamps and locale formats
/// are rejected.
pub fn parse_iso_date(value: &str, field_name: &str) -> Result<NaiveDate, SlotError> {
    let value = value.trim();
    let well_formed = value.len() == 10
        && value
            .char_indices()
            .all(|(index, ch)| if index == 4 || index == 7 { ch == '-' } else { ch.is_ascii_digit() });
    if !well_formed {
        return Err(SlotError::InvalidInput(format!(
            "{field_name} must be YYYY-MM-DD"
        )));
    }
    NaiveDate::parse_from_str(value, ISO_DATE_FORMAT)
        .map_err(|_| SlotError::InvalidInput(format!("{field_name} must be YYYY-MM-DD")))
}

pub fn format_iso_date(date: NaiveDate) -> String {
    date.format(ISO_DATE_FORMAT).to_string()
}
