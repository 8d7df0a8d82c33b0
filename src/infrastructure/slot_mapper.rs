use crate::domain::availability::WeeklyHours;
use crate::domain::models::{
    AvailabilityConfig, BlockedSlot, SlotOrigin, format_iso_date, parse_iso_date, weekday_index,
};
use crate::infrastructure::error::InfraError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Blocked slot as the remote service returns it. Dates may come back as
/// full timestamps; only the calendar date prefix is meaningful.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteBlockedSlot {
    #[serde(default, alias = "_id")]
    pub id: Option<String>,
    pub date: String,
    pub hour: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday: Option<u8>,
    #[serde(default)]
    pub recurring: bool,
}

/// Remote availability payload: weekday index (as a string key) to hours.
pub type RemoteWeeklyHours = HashMap<String, Vec<u32>>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BlockSlotRequest {
    pub date: String,
    pub hour: u8,
    pub recurring: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UnblockSlotRequest {
    pub date: String,
    pub hour: u8,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AvailabilityRequest {
    General { weekday: u8, hours: Vec<u8> },
    Specific { date: String, hours: Vec<u8> },
}

pub fn encode_block_request(date: NaiveDate, hour: u8, recurring: bool) -> BlockSlotRequest {
    BlockSlotRequest {
        date: format_iso_date(date),
        hour,
        recurring,
    }
}

pub fn encode_unblock_request(date: NaiveDate, hour: u8) -> UnblockSlotRequest {
    UnblockSlotRequest {
        date: format_iso_date(date),
        hour,
    }
}

pub fn encode_availability_request(config: &AvailabilityConfig) -> AvailabilityRequest {
    match config {
        AvailabilityConfig::General { weekday, hours } => AvailabilityRequest::General {
            weekday: *weekday,
            hours: hours.iter().copied().collect(),
        },
        AvailabilityConfig::Specific { date, hours, .. } => AvailabilityRequest::Specific {
            date: format_iso_date(*date),
            hours: hours.iter().copied().collect(),
        },
    }
}

/// Extracts the calendar date from `yyyy-mm-dd` or an RFC 3339 timestamp
/// without converting through any time zone.
pub fn normalize_remote_date(raw: &str) -> Result<NaiveDate, InfraError> {
    let raw = raw.trim();
    let prefix = raw.get(..10).unwrap_or(raw);
    let rest = raw.get(10..).unwrap_or_default();
    if !(rest.is_empty() || rest.starts_with('T') || rest.starts_with(' ')) {
        return Err(InfraError::invalid_input(format!(
            "remote date '{raw}' is not an ISO date"
        )));
    }
    parse_iso_date(prefix, "remote date").map_err(InfraError::from)
}

pub fn decode_blocked_slot(remote: &RemoteBlockedSlot) -> Result<BlockedSlot, InfraError> {
    let id = remote
        .id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| InfraError::invalid_input("remote blocked slot is missing an id"))?;
    let date = normalize_remote_date(&remote.date)?;
    let hour = u8::try_from(remote.hour)
        .ok()
        .filter(|hour| *hour < 24)
        .ok_or_else(|| {
            InfraError::invalid_input(format!("remote blocked slot hour {} out of range", remote.hour))
        })?;

    Ok(BlockedSlot::new(id, date, hour, remote.recurring, SlotOrigin::ServerConfirmed))
}

/// Decodes every well-formed record and reports the rest as skipped.
pub fn decode_blocked_slots(remote: &[RemoteBlockedSlot]) -> (Vec<BlockedSlot>, usize) {
    let mut skipped = 0;
    let slots = remote
        .iter()
        .filter_map(|entry| match decode_blocked_slot(entry) {
            Ok(slot) => Some(slot),
            Err(error) => {
                skipped += 1;
                tracing::warn!(date = %entry.date, hour = entry.hour, %error, "skipping malformed blocked slot");
                None
            }
        })
        .collect();
    (slots, skipped)
}

pub fn decode_weekly_hours(remote: &RemoteWeeklyHours) -> WeeklyHours {
    remote
        .iter()
        .filter_map(|(weekday, hours)| {
            let weekday = weekday.trim().parse::<u8>().ok().filter(|value| *value <= 6)?;
            Some((weekday, decode_hours(hours)))
        })
        .collect()
}

/// Picks the override for `date` out of a date-scoped availability payload.
pub fn decode_date_override(remote: &RemoteWeeklyHours, date: NaiveDate) -> Option<BTreeSet<u8>> {
    decode_weekly_hours(remote).remove(&weekday_index(date))
}

fn decode_hours(hours: &[u32]) -> BTreeSet<u8> {
    hours
        .iter()
        .filter_map(|hour| u8::try_from(*hour).ok())
        .filter(|hour| *hour < 24)
        .collect()
}
