//! Calendar dimension generated independently of any fact data.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, Weekday};
use medwh_core::{DateKey, DateRow};

use crate::rules::HolidayCalendar;
use crate::TransformError;

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Inclusive date range covered by the dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateHorizon {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateHorizon {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, TransformError> {
        if start > end {
            return Err(TransformError::InvalidDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateDimension {
    horizon: DateHorizon,
    rows: Vec<DateRow>,
    by_date: BTreeMap<NaiveDate, usize>,
}

impl DateDimension {
    /// Build exactly one row per day of `horizon`. Pure: same horizon and calendar produce the
    /// same rows in the same order.
    pub fn build(horizon: DateHorizon, holidays: &HolidayCalendar) -> Self {
        let rows: Vec<DateRow> = horizon
            .start
            .iter_days()
            .take_while(|d| *d <= horizon.end)
            .map(|d| date_row(d, holidays))
            .collect();
        let by_date = rows
            .iter()
            .enumerate()
            .map(|(i, row)| (row.full_date, i))
            .collect();
        Self {
            horizon,
            rows,
            by_date,
        }
    }

    pub fn horizon(&self) -> DateHorizon {
        self.horizon
    }

    pub fn rows(&self) -> &[DateRow] {
        &self.rows
    }

    pub fn resolve(&self, date: NaiveDate) -> Option<DateKey> {
        self.by_date.get(&date).map(|&i| self.rows[i].date_key)
    }

    pub fn contains_key(&self, key: DateKey) -> bool {
        self.rows
            .binary_search_by_key(&key, |row| row.date_key)
            .is_ok()
    }
}

fn date_row(date: NaiveDate, holidays: &HolidayCalendar) -> DateRow {
    let weekday = date.weekday();
    DateRow {
        date_key: DateKey::from_date(date),
        full_date: date,
        year: date.year(),
        quarter: (date.month0() / 3) + 1,
        month: date.month(),
        month_name: MONTH_NAMES[date.month0() as usize].to_string(),
        week_of_year: date.iso_week().week(),
        day_of_month: date.day(),
        day_of_week: weekday.number_from_monday(),
        day_name: day_name(weekday).to_string(),
        day_of_year: date.ordinal(),
        is_weekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
        holiday_label: holidays.label_for(date.month(), date.day()).to_string(),
    }
}

fn day_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleBook;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn one_row_per_day_inclusive() {
        let book = RuleBook::builtin().unwrap();
        let horizon = DateHorizon::new(ymd(2024, 1, 1), ymd(2024, 12, 31)).unwrap();
        let dim = DateDimension::build(horizon, &book.holidays);
        assert_eq!(dim.rows().len(), 366);
        assert_eq!(dim.rows()[0].date_key, DateKey::from_date(ymd(2024, 1, 1)));
        assert_eq!(dim.rows()[365].full_date, ymd(2024, 12, 31));

        let single = DateDimension::build(
            DateHorizon::new(ymd(2025, 3, 2), ymd(2025, 3, 2)).unwrap(),
            &book.holidays,
        );
        assert_eq!(single.rows().len(), 1);
    }

    #[test]
    fn calendar_decomposition() {
        let book = RuleBook::builtin().unwrap();
        let dim = DateDimension::build(
            DateHorizon::new(ymd(2024, 12, 28), ymd(2025, 1, 7)).unwrap(),
            &book.holidays,
        );
        let dec29 = &dim.rows()[1];
        assert_eq!(dec29.day_name, "Sunday");
        assert_eq!(dec29.day_of_week, 7);
        assert!(dec29.is_weekend);
        assert_eq!(dec29.quarter, 4);
        assert_eq!(dec29.month_name, "December");
        assert_eq!(dec29.day_of_year, 364);

        let dec30 = &dim.rows()[2];
        // ISO week 1 of 2025 starts on Monday 2024-12-30.
        assert_eq!(dec30.week_of_year, 1);
        assert!(!dec30.is_weekend);

        let jan7 = dim.rows().last().unwrap();
        assert_eq!(jan7.holiday_label, "Ethiopian Christmas");
        assert_eq!(jan7.quarter, 1);
        assert_eq!(dim.rows()[2].holiday_label, "Normal Day");
    }

    #[test]
    fn regeneration_is_byte_identical() {
        let book = RuleBook::builtin().unwrap();
        let horizon = DateHorizon::new(ymd(2020, 1, 1), ymd(2030, 12, 31)).unwrap();
        let a = serde_json::to_vec(DateDimension::build(horizon, &book.holidays).rows()).unwrap();
        let b = serde_json::to_vec(DateDimension::build(horizon, &book.holidays).rows()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn resolves_only_dates_inside_horizon() {
        let book = RuleBook::builtin().unwrap();
        let dim = DateDimension::build(
            DateHorizon::new(ymd(2025, 1, 1), ymd(2025, 1, 31)).unwrap(),
            &book.holidays,
        );
        assert_eq!(dim.resolve(ymd(2025, 1, 15)), Some(DateKey::from_date(ymd(2025, 1, 15))));
        assert_eq!(dim.resolve(ymd(2025, 2, 1)), None);
        assert!(dim.contains_key(DateKey::from_date(ymd(2025, 1, 31))));
        assert!(!dim.contains_key(DateKey::from_date(ymd(2024, 12, 31))));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(matches!(
            DateHorizon::new(ymd(2025, 2, 1), ymd(2025, 1, 1)),
            Err(TransformError::InvalidDateRange { .. })
        ));
    }
}
