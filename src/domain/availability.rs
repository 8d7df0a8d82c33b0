use crate::domain::error::SlotError;
use crate::domain::models::{AvailabilityConfig, OperatingHours, validate_weekday, weekday_index};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type WeeklyHours = BTreeMap<u8, BTreeSet<u8>>;

/// Merges recurring per-weekday hours with per-date overrides.
///
/// Resolution order for a `(weekday, date)` query:
/// 1. a specific override for `date`, returned verbatim even when empty;
/// 2. the general set for `weekday`;
/// 3. every operating hour, but only while nothing has ever been configured.
///
/// Once configured, a missing weekday resolves to the empty set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvailabilityResolver {
    operating_hours: OperatingHours,
    general: WeeklyHours,
    specific: BTreeMap<NaiveDate, BTreeSet<u8>>,
    configured: bool,
}

impl AvailabilityResolver {
    pub fn new(operating_hours: OperatingHours) -> Self {
        Self {
            operating_hours,
            general: BTreeMap::new(),
            specific: BTreeMap::new(),
            configured: false,
        }
    }

    pub fn operating_hours(&self) -> OperatingHours {
        self.operating_hours
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn resolve_availability(&self, weekday: u8, date: NaiveDate) -> BTreeSet<u8> {
        if let Some(hours) = self.specific.get(&date) {
            return hours.clone();
        }
        if let Some(hours) = self.general.get(&weekday) {
            return hours.clone();
        }
        if self.configured {
            BTreeSet::new()
        } else {
            self.operating_hours.hours()
        }
    }

    pub fn is_available(&self, weekday: u8, date: NaiveDate, hour: u8) -> bool {
        self.resolve_availability(weekday, date).contains(&hour)
    }

    pub fn general(&self, weekday: u8) -> Option<&BTreeSet<u8>> {
        self.general.get(&weekday)
    }

    pub fn general_hours(&self) -> &WeeklyHours {
        &self.general
    }

    pub fn specific(&self, date: NaiveDate) -> Option<&BTreeSet<u8>> {
        self.specific.get(&date)
    }

    pub fn update_general(&mut self, weekday: u8, hours: BTreeSet<u8>) -> Result<(), SlotError> {
        validate_weekday(weekday)?;
        self.check_hours(&hours)?;
        self.general.insert(weekday, hours);
        self.configured = true;
        Ok(())
    }

    pub fn update_specific(
        &mut self,
        date: NaiveDate,
        weekday: u8,
        hours: BTreeSet<u8>,
    ) -> Result<(), SlotError> {
        validate_weekday(weekday)?;
        if weekday_index(date) != weekday {
            return Err(SlotError::InvalidInput(format!(
                "weekday {weekday} does not match date {date}"
            )));
        }
        self.check_hours(&hours)?;
        self.specific.insert(date, hours);
        self.configured = true;
        Ok(())
    }

    pub fn apply(&mut self, config: &AvailabilityConfig) -> Result<(), SlotError> {
        match config {
            AvailabilityConfig::General { weekday, hours } => {
                self.update_general(*weekday, hours.clone())
            }
            AvailabilityConfig::Specific {
                date,
                weekday,
                hours,
            } => self.update_specific(*date, *weekday, hours.clone()),
        }
    }

    pub fn specific_overrides(&self) -> &BTreeMap<NaiveDate, BTreeSet<u8>> {
        &self.specific
    }

    /// Puts back a previously observed general entry, `None` meaning absent.
    pub fn restore_general(&mut self, weekday: u8, hours: Option<BTreeSet<u8>>, was_configured: bool) {
        match hours {
            Some(hours) => {
                self.general.insert(weekday, hours);
            }
            None => {
                self.general.remove(&weekday);
            }
        }
        self.settle_configured(was_configured);
    }

    pub fn restore_specific(
        &mut self,
        date: NaiveDate,
        hours: Option<BTreeSet<u8>>,
        was_configured: bool,
    ) {
        match hours {
            Some(hours) => {
                self.specific.insert(date, hours);
            }
            None => {
                self.specific.remove(&date);
            }
        }
        self.settle_configured(was_configured);
    }

    /// Installs a remote general map. An empty map means the owner never
    /// configured availability; bootstrap semantics return unless a date
    /// override is still in place.
    pub fn replace_general(&mut self, general: WeeklyHours) {
        if general.is_empty() {
            self.general.clear();
            self.configured = !self.specific.is_empty();
            return;
        }
        self.general = general
            .into_iter()
            .filter(|(weekday, _)| *weekday <= 6)
            .map(|(weekday, hours)| (weekday, self.clamp_hours(hours)))
            .collect();
        self.configured = true;
    }

    pub fn replace_specific(&mut self, date: NaiveDate, hours: Option<BTreeSet<u8>>) {
        match hours {
            Some(hours) => {
                let hours = self.clamp_hours(hours);
                self.specific.insert(date, hours);
                self.configured = true;
            }
            None => {
                self.specific.remove(&date);
            }
        }
    }

    fn check_hours(&self, hours: &BTreeSet<u8>) -> Result<(), SlotError> {
        for hour in hours {
            self.operating_hours.check_hour(*hour)?;
        }
        Ok(())
    }

    fn settle_configured(&mut self, was_configured: bool) {
        self.configured = was_configured || !self.general.is_empty() || !self.specific.is_empty();
    }

    fn clamp_hours(&self, hours: BTreeSet<u8>) -> BTreeSet<u8> {
        hours
            .into_iter()
            .filter(|hour| self.operating_hours.contains(*hour))
            .collect()
    }
}
