use crate::domain::models::Event;
use crate::infrastructure::error::{InfraError, poisoned};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Mutex;

/// Read-only lookup of booked events by exact date and hour.
pub trait EventIndex: Send + Sync {
    fn event_at(&self, date: NaiveDate, hour: u8) -> Result<Option<Event>, InfraError>;
    fn events_on(&self, date: NaiveDate) -> Result<Vec<Event>, InfraError>;
}

#[derive(Debug, Default)]
pub struct InMemoryEventIndex {
    events: Mutex<HashMap<String, Event>>,
}

impl InMemoryEventIndex {
    fn normalized_id(event_id: &str) -> Option<String> {
        let normalized = event_id.trim();
        if normalized.is_empty() {
            return None;
        }
        Some(normalized.to_string())
    }

    pub fn upsert(&self, event: Event) -> Result<(), InfraError> {
        event.validate()?;
        let event_id = Self::normalized_id(&event.id)
            .ok_or_else(|| InfraError::invalid_input("event id is required"))?;
        let mut events = self
            .events
            .lock()
            .map_err(|error| poisoned("event index", error))?;
        events.insert(event_id, event);
        Ok(())
    }

    pub fn remove(&self, event_id: &str) -> Result<Option<Event>, InfraError> {
        let Some(event_id) = Self::normalized_id(event_id) else {
            return Ok(None);
        };
        let mut events = self
            .events
            .lock()
            .map_err(|error| poisoned("event index", error))?;
        Ok(events.remove(&event_id))
    }

    pub fn replace_all(&self, incoming: Vec<Event>) -> Result<(), InfraError> {
        let mut next = HashMap::with_capacity(incoming.len());
        for event in incoming {
            event.validate()?;
            if let Some(event_id) = Self::normalized_id(&event.id) {
                next.insert(event_id, event);
            }
        }
        let mut events = self
            .events
            .lock()
            .map_err(|error| poisoned("event index", error))?;
        *events = next;
        Ok(())
    }
}

impl EventIndex for InMemoryEventIndex {
    fn event_at(&self, date: NaiveDate, hour: u8) -> Result<Option<Event>, InfraError> {
        let events = self
            .events
            .lock()
            .map_err(|error| poisoned("event index", error))?;
        // Overlaps are resolved by earliest start, then id, so repeated queries agree.
        Ok(events
            .values()
            .filter(|event| event.occupies(date, hour))
            .min_by(|left, right| {
                left.start_hour
                    .cmp(&right.start_hour)
                    .then_with(|| left.id.cmp(&right.id))
            })
            .cloned())
    }

    fn events_on(&self, date: NaiveDate) -> Result<Vec<Event>, InfraError> {
        let events = self
            .events
            .lock()
            .map_err(|error| poisoned("event index", error))?;
        let mut matching: Vec<Event> = events
            .values()
            .filter(|event| event.date == date)
            .cloned()
            .collect();
        matching.sort_by(|left, right| {
            left.start_hour
                .cmp(&right.start_hour)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(matching)
    }
}
