use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Timelike, Weekday};
use thiserror::Error;

use crate::domain::reservation::Slot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceWindow {
    pub opens: NaiveTime,
    /// Last bookable slot start, inclusive.
    pub last_seating: NaiveTime,
}

impl ServiceWindow {
    pub fn new(opens: (u32, u32), last_seating: (u32, u32)) -> Self {
        Self { opens: hm(opens.0, opens.1), last_seating: hm(last_seating.0, last_seating.1) }
    }

    fn contains(&self, time: NaiveTime) -> bool {
        time >= self.opens && time <= self.last_seating
    }
}

impl fmt::Display for ServiceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.opens.format("%H:%M"), self.last_seating.format("%H:%M"))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ScheduleViolation {
    #[error("reservations are taken in {slot_minutes}-minute blocks")]
    OffGrid { slot_minutes: u32 },
    #[error("the restaurant is closed on {weekday}")]
    Closed { weekday: Weekday },
    #[error("{time} is outside service hours on {weekday} ({windows})")]
    OutsideHours { weekday: Weekday, time: String, windows: String },
}

/// Opening hours keyed by weekday. Weekdays with no windows are closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceHours {
    pub slot_minutes: u32,
    windows: BTreeMap<u32, Vec<ServiceWindow>>,
}

impl Default for ServiceHours {
    fn default() -> Self {
        let lunch = ServiceWindow::new((13, 0), (16, 0));
        let dinner = ServiceWindow::new((20, 0), (23, 30));

        let mut hours = Self::closed(30);
        for weekday in [Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri] {
            hours = hours.with_windows(weekday, vec![lunch, dinner]);
        }
        hours
            .with_windows(Weekday::Sat, vec![ServiceWindow::new((13, 0), (23, 30))])
            .with_windows(Weekday::Sun, vec![ServiceWindow::new((13, 0), (17, 30))])
    }
}

impl ServiceHours {
    pub fn closed(slot_minutes: u32) -> Self {
        Self { slot_minutes: slot_minutes.max(1), windows: BTreeMap::new() }
    }

    pub fn with_windows(mut self, weekday: Weekday, windows: Vec<ServiceWindow>) -> Self {
        self.windows.insert(weekday.num_days_from_monday(), windows);
        self
    }

    pub fn windows(&self, weekday: Weekday) -> &[ServiceWindow] {
        self.windows.get(&weekday.num_days_from_monday()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every bookable slot start on `date`, in order.
    pub fn seatings(&self, date: NaiveDate) -> Vec<NaiveTime> {
        let step = Duration::minutes(i64::from(self.slot_minutes));
        let mut seatings = Vec::new();
        for window in self.windows(date.weekday()) {
            let mut time = window.opens;
            while time <= window.last_seating {
                seatings.push(time);
                let (next, wrapped) = time.overflowing_add_signed(step);
                if wrapped != 0 {
                    break;
                }
                time = next;
            }
        }
        seatings
    }

    pub fn check(&self, slot: &Slot) -> Result<(), ScheduleViolation> {
        let minutes = slot.time.hour() * 60 + slot.time.minute();
        if slot.time.second() != 0 || minutes % self.slot_minutes != 0 {
            return Err(ScheduleViolation::OffGrid { slot_minutes: self.slot_minutes });
        }

        let weekday = slot.date.weekday();
        let windows = self.windows(weekday);
        if windows.is_empty() {
            return Err(ScheduleViolation::Closed { weekday });
        }

        if windows.iter().any(|window| window.contains(slot.time)) {
            return Ok(());
        }

        Err(ScheduleViolation::OutsideHours {
            weekday,
            time: slot.time_key(),
            windows: windows.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
        })
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::{ScheduleViolation, ServiceHours};
    use crate::domain::reservation::Slot;

    fn slot(date: &str, time: &str) -> Slot {
        Slot::parse(date, time).expect("valid slot")
    }

    #[test]
    fn default_hours_follow_weekly_service() {
        let hours = ServiceHours::default();

        // 2025-06-03 is a Tuesday.
        assert!(hours.check(&slot("2025-06-03", "13:00")).is_ok());
        assert!(hours.check(&slot("2025-06-03", "16:00")).is_ok());
        assert!(hours.check(&slot("2025-06-03", "23:30")).is_ok());
        assert!(hours.check(&slot("2025-06-07", "22:00")).is_ok());
        assert!(hours.check(&slot("2025-06-08", "17:30")).is_ok());
    }

    #[test]
    fn mondays_are_closed() {
        let error = ServiceHours::default().check(&slot("2025-06-02", "20:00")).unwrap_err();
        assert_eq!(error, ScheduleViolation::Closed { weekday: Weekday::Mon });
    }

    #[test]
    fn rejects_off_grid_and_out_of_hours_slots() {
        let hours = ServiceHours::default();

        assert_eq!(
            hours.check(&slot("2025-06-03", "20:15")).unwrap_err(),
            ScheduleViolation::OffGrid { slot_minutes: 30 }
        );
        assert!(matches!(
            hours.check(&slot("2025-06-03", "17:00")).unwrap_err(),
            ScheduleViolation::OutsideHours { weekday: Weekday::Tue, .. }
        ));
        assert!(matches!(
            hours.check(&slot("2025-06-08", "18:00")).unwrap_err(),
            ScheduleViolation::OutsideHours { weekday: Weekday::Sun, .. }
        ));
    }

    #[test]
    fn seatings_enumerate_each_window_on_the_grid() {
        let hours = ServiceHours::default();
        let tuesday = chrono::NaiveDate::from_ymd_opt(2025, 6, 3).expect("date");
        let seatings: Vec<_> =
            hours.seatings(tuesday).iter().map(|time| time.format("%H:%M").to_string()).collect();

        assert_eq!(seatings.len(), 7 + 8);
        assert_eq!(seatings.first().map(String::as_str), Some("13:00"));
        assert_eq!(seatings.last().map(String::as_str), Some("23:30"));
        assert!(!seatings.contains(&"17:00".to_string()));

        let monday = chrono::NaiveDate::from_ymd_opt(2025, 6, 2).expect("date");
        assert!(hours.seatings(monday).is_empty());
    }
}
