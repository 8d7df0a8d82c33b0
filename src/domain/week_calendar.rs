use crate::domain::models::{OperatingHours, TimeSlot, WeekDay, weekday_index, weekday_name};
use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use chrono_tz::Tz;

/// Builds Monday-first weeks of exact calendar dates.
///
/// All arithmetic runs on `NaiveDate`, so there is no UTC shift and DST
/// transitions cannot move a date. The time zone is only consulted to decide
/// which local date is "today".
#[derive(Debug, Clone)]
pub struct WeekCalendarBuilder {
    time_zone: Tz,
}

impl Default for WeekCalendarBuilder {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl WeekCalendarBuilder {
    pub fn new(time_zone: Tz) -> Self {
        Self { time_zone }
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.time_zone).date_naive()
    }

    pub fn week_start(anchor: NaiveDate) -> NaiveDate {
        let offset = u64::from(anchor.weekday().num_days_from_monday());
        anchor
            .checked_sub_days(Days::new(offset))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Returns the seven dates of the week containing `anchor`, flagging the
    /// entry equal to `today`.
    pub fn build_week(&self, anchor: NaiveDate, today: NaiveDate) -> [WeekDay; 7] {
        let monday = Self::week_start(anchor);
        std::array::from_fn(|offset| {
            let date = monday
                .checked_add_days(Days::new(offset as u64))
                .unwrap_or(NaiveDate::MAX);
            let weekday = weekday_index(date);
            WeekDay {
                weekday,
                date,
                name: weekday_name(weekday).unwrap_or_default().to_string(),
                is_today: date == today,
            }
        })
    }

    pub fn current_week(&self, now: DateTime<Utc>) -> [WeekDay; 7] {
        let today = self.today(now);
        self.build_week(today, today)
    }

    pub fn time_slots(operating_hours: &OperatingHours) -> Vec<TimeSlot> {
        (operating_hours.start_hour..operating_hours.end_hour)
            .map(TimeSlot::new)
            .collect()
    }
}
