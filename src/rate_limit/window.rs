//! Processing window.
//!
//! Downloads only run during off-peak hours: a nightly window on weekdays
//! and one continuous block over the weekend, from Friday evening until
//! Monday morning. A full-day weekend setting covers Saturday and Sunday
//! only. All times are local wall-clock times.

use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};

/// A `[start, end)` time-of-day range. When `end` is not after `start` the
/// range wraps past midnight, `start == end` covers the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl DailyWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parses `HH:MM` bounds.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s, "%H:%M")
                .with_context(|| format!("Invalid time of day {:?}, expected HH:MM", s))
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }

    pub fn full_day() -> Self {
        Self::new(NaiveTime::MIN, NaiveTime::MIN)
    }

    pub fn is_full_day(&self) -> bool {
        self.start == self.end
    }

    /// Absolute bounds of the window opening on `date`.
    fn bounds_on(&self, date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
        let start = date.and_time(self.start);
        let mut end = date.and_time(self.end);
        if end <= start {
            end += Duration::days(1);
        }
        (start, end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingWindow {
    /// Window opening on each of Monday to Friday.
    pub weekday: DailyWindow,
    /// `start` is the time on Friday the weekend opens, `end` the time on
    /// Monday it closes. When both are equal the block runs from Saturday
    /// 00:00 to Monday 00:00.
    pub weekend: DailyWindow,
}

impl ProcessingWindow {
    pub fn new(weekday: DailyWindow, weekend: DailyWindow) -> Self {
        Self { weekday, weekend }
    }

    /// A window that never closes.
    pub fn always_open() -> Self {
        Self::new(DailyWindow::full_day(), DailyWindow::full_day())
    }

    /// Returns `(true, start of the containing window)` when `now` is inside a
    /// window, otherwise `(false, start of the next window)`.
    ///
    /// Windows opened on previous days are checked as well, so a process
    /// waking at 00:01 still sees the window that opened the evening before.
    pub fn in_window(&self, now: NaiveDateTime) -> (bool, NaiveDateTime) {
        if self.weekday.is_full_day() && self.weekend.is_full_day() {
            return (true, now.date().and_time(self.weekday.start));
        }

        let windows = self.windows_around(now.date());

        if let Some((start, _)) = windows
            .iter()
            .filter(|(start, end)| *start <= now && now < *end)
            .min_by_key(|(start, _)| *start)
        {
            return (true, *start);
        }

        let next_start = windows
            .iter()
            .map(|(start, _)| *start)
            .filter(|start| *start > now)
            .min()
            .unwrap_or_else(|| now + Duration::days(1));
        (false, next_start)
    }

    /// The weekend block opening on `friday`.
    fn weekend_bounds(&self, friday: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
        let monday = friday + Duration::days(3);
        if self.weekend.is_full_day() {
            return (
                (friday + Duration::days(1)).and_time(NaiveTime::MIN),
                monday.and_time(NaiveTime::MIN),
            );
        }
        (
            friday.and_time(self.weekend.start),
            monday.and_time(self.weekend.end),
        )
    }

    /// Every window opening between three days before and a week after `date`.
    fn windows_around(&self, date: NaiveDate) -> Vec<(NaiveDateTime, NaiveDateTime)> {
        let mut windows = Vec::new();
        for offset in -3..=7 {
            let day = date + Duration::days(offset);
            let weekday = day.weekday();
            if weekday.num_days_from_monday() < 5 {
                windows.push(self.weekday.bounds_on(day));
            }
            if weekday == Weekday::Fri {
                windows.push(self.weekend_bounds(day));
            }
        }
        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M").unwrap()
    }

    // 2024-03-01 is a Friday
    const FRI: &str = "2024-03-01";
    const SAT: &str = "2024-03-02";
    const SUN: &str = "2024-03-03";
    const MON: &str = "2024-03-04";
    const TUE: &str = "2024-03-05";
    const WED: &str = "2024-03-06";

    fn overnight_weekend() -> ProcessingWindow {
        ProcessingWindow::new(
            DailyWindow::parse("01:00", "05:00").unwrap(),
            DailyWindow::parse("22:00", "06:00").unwrap(),
        )
    }

    #[test]
    fn test_weekend_block_boundaries() {
        let window = overnight_weekend();

        assert_eq!(window.in_window(at(FRI, "21:59")), (false, at(FRI, "22:00")));
        assert_eq!(window.in_window(at(FRI, "22:00")), (true, at(FRI, "22:00")));
        assert!(window.in_window(at(SAT, "12:00")).0);
        assert!(window.in_window(at(SUN, "23:59")).0);
        assert_eq!(window.in_window(at(MON, "05:59")), (true, at(FRI, "22:00")));
        assert_eq!(window.in_window(at(MON, "06:00")), (false, at(TUE, "01:00")));
        assert_eq!(window.in_window(at(TUE, "23:30")), (false, at(WED, "01:00")));
    }

    #[test]
    fn test_weekday_window_wraps_past_midnight() {
        let window = ProcessingWindow::new(
            DailyWindow::parse("22:00", "02:00").unwrap(),
            DailyWindow::parse("22:00", "06:00").unwrap(),
        );

        // opened yesterday evening
        assert_eq!(window.in_window(at(WED, "00:30")), (true, at(TUE, "22:00")));
        assert_eq!(window.in_window(at(WED, "02:00")), (false, at(WED, "22:00")));
        assert_eq!(window.in_window(at(TUE, "22:00")), (true, at(TUE, "22:00")));
        assert_eq!(window.in_window(at(TUE, "21:59")), (false, at(TUE, "22:00")));
    }

    #[test]
    fn test_monday_early_hours_use_sunday_block() {
        let window = ProcessingWindow::new(
            DailyWindow::parse("23:00", "03:00").unwrap(),
            DailyWindow::parse("20:00", "04:00").unwrap(),
        );
        // Sunday night belongs to the weekend block, not a weekday window
        assert_eq!(window.in_window(at(SUN, "23:30")), (true, at(FRI, "20:00")));
        assert_eq!(window.in_window(at(MON, "04:00")), (false, at(MON, "23:00")));
    }

    #[test]
    fn test_full_day_windows() {
        let window = ProcessingWindow::always_open();
        assert!(window.in_window(at(TUE, "13:37")).0);
        assert!(window.in_window(at(SAT, "00:00")).0);

        let weekdays_all_day = ProcessingWindow::new(
            DailyWindow::full_day(),
            DailyWindow::parse("18:00", "08:00").unwrap(),
        );
        assert!(weekdays_all_day.in_window(at(WED, "12:00")).0);
        // no weekday window opens on Saturday, the weekend block covers it
        assert!(weekdays_all_day.in_window(at(SAT, "12:00")).0);
        assert_eq!(
            weekdays_all_day.in_window(at(WED, "12:00")),
            (true, at(WED, "00:00"))
        );
    }

    #[test]
    fn test_full_day_weekend_is_saturday_and_sunday() {
        let window = ProcessingWindow::new(
            DailyWindow::parse("01:00", "05:00").unwrap(),
            DailyWindow::full_day(),
        );

        // Friday daytime is a weekday like any other
        assert_eq!(window.in_window(at(FRI, "12:00")), (false, at(SAT, "00:00")));
        assert_eq!(window.in_window(at(FRI, "02:00")), (true, at(FRI, "01:00")));
        assert_eq!(window.in_window(at(SAT, "00:00")), (true, at(SAT, "00:00")));
        assert_eq!(window.in_window(at(SUN, "23:59")), (true, at(SAT, "00:00")));
        assert_eq!(window.in_window(at(MON, "00:00")), (false, at(MON, "01:00")));

        // any equal bounds count as a full day
        let noon = ProcessingWindow::new(
            DailyWindow::parse("01:00", "05:00").unwrap(),
            DailyWindow::parse("12:00", "12:00").unwrap(),
        );
        assert_eq!(noon.in_window(at(FRI, "13:00")), (false, at(SAT, "00:00")));
    }

    #[test]
    fn test_parse_rejects_bad_times() {
        assert!(DailyWindow::parse("25:00", "06:00").is_err());
        assert!(DailyWindow::parse("22:00", "six").is_err());
    }
}
