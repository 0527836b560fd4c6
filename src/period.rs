//! Reporting periods.
//!
//! A [`Period`] is a calendar month, quarter or year. Its start date is
//! inclusive and its end date exclusive, so consecutive periods tile the
//! timeline without overlap.

use crate::error::{EpiError, Result};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Width of a reporting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Month,
    Quarter,
    Year,
}

impl Granularity {
    fn months(&self) -> i32 {
        match self {
            Granularity::Month => 1,
            Granularity::Quarter => 3,
            Granularity::Year => 12,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Month => write!(f, "month"),
            Granularity::Quarter => write!(f, "quarter"),
            Granularity::Year => write!(f, "year"),
        }
    }
}

/// A calendar month, quarter or year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "PeriodRepr", try_from = "PeriodRepr")]
pub struct Period {
    granularity: Granularity,
    year: i32,
    /// Month (1-12), quarter (1-4) or 1 for a year.
    index: u32,
}

const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 9999;

impl Period {
    pub fn month(year: i32, month: u32) -> Result<Self> {
        Self::new(Granularity::Month, year, month)
    }

    pub fn quarter(year: i32, quarter: u32) -> Result<Self> {
        Self::new(Granularity::Quarter, year, quarter)
    }

    pub fn year(year: i32) -> Result<Self> {
        Self::new(Granularity::Year, year, 1)
    }

    fn new(granularity: Granularity, year: i32, index: u32) -> Result<Self> {
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(EpiError::InvalidPeriod(format!(
                "year {} outside {}-{}",
                year, MIN_YEAR, MAX_YEAR
            )));
        }

        let max_index = match granularity {
            Granularity::Month => 12,
            Granularity::Quarter => 4,
            Granularity::Year => 1,
        };
        if index == 0 || index > max_index {
            return Err(EpiError::InvalidPeriod(format!(
                "{} index {} out of range",
                granularity, index
            )));
        }

        Ok(Self {
            granularity,
            year,
            index,
        })
    }

    /// The period of the given granularity that contains `date`.
    pub fn containing(granularity: Granularity, date: NaiveDate) -> Result<Self> {
        let index = match granularity {
            Granularity::Month => date.month(),
            Granularity::Quarter => (date.month() - 1) / 3 + 1,
            Granularity::Year => 1,
        };
        Self::new(granularity, date.year(), index)
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// First day of the period (inclusive).
    pub fn start(&self) -> NaiveDate {
        let month = match self.granularity {
            Granularity::Month => self.index,
            Granularity::Quarter => (self.index - 1) * 3 + 1,
            Granularity::Year => 1,
        };
        NaiveDate::from_ymd_opt(self.year, month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// First day after the period (exclusive).
    pub fn end(&self) -> NaiveDate {
        self.shifted(1).start()
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.start().and_time(chrono::NaiveTime::MIN))
    }

    pub fn end_utc(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.end().and_time(chrono::NaiveTime::MIN))
    }

    pub fn contains(&self, timestamp: &DateTime<Utc>) -> bool {
        *timestamp >= self.start_utc() && *timestamp < self.end_utc()
    }

    pub fn next(&self) -> Period {
        self.shifted(1)
    }

    pub fn previous(&self) -> Period {
        self.shifted(-1)
    }

    /// The `n` periods immediately before this one, oldest first.
    pub fn preceding(&self, n: usize) -> Vec<Period> {
        let mut periods: Vec<Period> = Vec::with_capacity(n);
        let mut cursor = *self;
        for _ in 0..n {
            cursor = cursor.previous();
            periods.push(cursor);
        }
        periods.reverse();
        periods
    }

    fn shifted(&self, steps: i32) -> Period {
        let width = self.granularity.months();
        let start = self.start();
        let total = start.year() * 12 + (start.month() as i32 - 1) + steps * width;
        let year = total.div_euclid(12);
        let month = total.rem_euclid(12) as u32 + 1;
        let index = match self.granularity {
            Granularity::Month => month,
            Granularity::Quarter => (month - 1) / 3 + 1,
            Granularity::Year => 1,
        };
        Period {
            granularity: self.granularity,
            year,
            index,
        }
    }

    /// Short label: `2024-03`, `2024-Q1` or `2024`.
    pub fn label(&self) -> String {
        match self.granularity {
            Granularity::Month => format!("{:04}-{:02}", self.year, self.index),
            Granularity::Quarter => format!("{:04}-Q{}", self.year, self.index),
            Granularity::Year => format!("{:04}", self.year),
        }
    }
}

impl Ord for Period {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start()
            .cmp(&other.start())
            .then_with(|| self.granularity.cmp(&other.granularity))
    }
}

impl PartialOrd for Period {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Period {
    type Err = EpiError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || EpiError::InvalidPeriod(format!("cannot parse '{}'", s));

        match s.split_once('-') {
            None => {
                let year: i32 = s.parse().map_err(|_| invalid())?;
                Period::year(year)
            }
            Some((year, rest)) => {
                let year: i32 = year.parse().map_err(|_| invalid())?;
                if let Some(quarter) = rest.strip_prefix('Q').or_else(|| rest.strip_prefix('q')) {
                    let quarter: u32 = quarter.parse().map_err(|_| invalid())?;
                    Period::quarter(year, quarter)
                } else {
                    let month: u32 = rest.parse().map_err(|_| invalid())?;
                    Period::month(year, month)
                }
            }
        }
    }
}

/// Wire form of a period: the label is authoritative, the dates are for readers.
#[derive(Serialize, Deserialize)]
struct PeriodRepr {
    label: String,
    granularity: Granularity,
    start: NaiveDate,
    end: NaiveDate,
}

impl From<Period> for PeriodRepr {
    fn from(period: Period) -> Self {
        Self {
            label: period.label(),
            granularity: period.granularity,
            start: period.start(),
            end: period.end(),
        }
    }
}

impl TryFrom<PeriodRepr> for Period {
    type Error = EpiError;

    fn try_from(repr: PeriodRepr) -> Result<Self> {
        let period: Period = repr.label.parse()?;
        if period.granularity != repr.granularity {
            return Err(EpiError::InvalidPeriod(format!(
                "label {} does not match granularity {}",
                repr.label, repr.granularity
            )));
        }
        Ok(period)
    }
}

/// An inclusive run of consecutive periods of one granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodRange {
    pub first: Period,
    pub last: Period,
}

impl PeriodRange {
    pub fn new(first: Period, last: Period) -> Result<Self> {
        if first.granularity() != last.granularity() {
            return Err(EpiError::InvalidPeriod(format!(
                "range mixes {} and {}",
                first.granularity(),
                last.granularity()
            )));
        }
        if last < first {
            return Err(EpiError::InvalidPeriod(format!(
                "range ends ({}) before it starts ({})",
                last, first
            )));
        }
        Ok(Self { first, last })
    }

    pub fn single(period: Period) -> Self {
        Self {
            first: period,
            last: period,
        }
    }

    /// All periods in the range, chronological.
    pub fn periods(&self) -> Vec<Period> {
        let mut periods = vec![self.first];
        let mut cursor = self.first;
        while cursor < self.last {
            cursor = cursor.next();
            periods.push(cursor);
        }
        periods
    }

    pub fn label(&self) -> String {
        if self.first == self.last {
            self.first.label()
        } else {
            format!("{}_{}", self.first.label(), self.last.label())
        }
    }
}

impl fmt::Display for PeriodRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{} to {}", self.first, self.last)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!("2024-03".parse::<Period>().unwrap(), Period::month(2024, 3).unwrap());
        assert_eq!("2024-Q2".parse::<Period>().unwrap(), Period::quarter(2024, 2).unwrap());
        assert_eq!("2024".parse::<Period>().unwrap(), Period::year(2024).unwrap());
        assert!("2024-13".parse::<Period>().is_err());
        assert!("2024-Q5".parse::<Period>().is_err());
        assert!("march".parse::<Period>().is_err());
    }

    #[test]
    fn test_bounds_and_contains() {
        let march = Period::month(2024, 3).unwrap();
        assert_eq!(march.start(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(march.end(), NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        assert!(march.contains(&utc(2024, 3, 31)));
        assert!(!march.contains(&utc(2024, 4, 1)));

        let q4 = Period::quarter(2023, 4).unwrap();
        assert_eq!(q4.end(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn test_next_previous_wrap_years() {
        let jan = Period::month(2024, 1).unwrap();
        assert_eq!(jan.previous(), Period::month(2023, 12).unwrap());
        assert_eq!(jan.previous().next(), jan);

        let q1 = Period::quarter(2024, 1).unwrap();
        assert_eq!(q1.previous(), Period::quarter(2023, 4).unwrap());
    }

    #[test]
    fn test_preceding_is_oldest_first() {
        let march = Period::month(2024, 3).unwrap();
        let labels: Vec<String> = march.preceding(3).iter().map(|p| p.label()).collect();
        assert_eq!(labels, vec!["2023-12", "2024-01", "2024-02"]);
    }

    #[test]
    fn test_range_periods() {
        let range = PeriodRange::new(
            Period::month(2023, 11).unwrap(),
            Period::month(2024, 2).unwrap(),
        )
        .unwrap();
        assert_eq!(range.periods().len(), 4);
        assert_eq!(range.label(), "2023-11_2024-02");

        assert!(PeriodRange::new(
            Period::month(2024, 2).unwrap(),
            Period::month(2024, 1).unwrap()
        )
        .is_err());
        assert!(PeriodRange::new(Period::month(2024, 1).unwrap(), Period::year(2024).unwrap())
            .is_err());
    }

    #[test]
    fn test_serde_uses_label() {
        let period = Period::quarter(2024, 3).unwrap();
        let json = serde_json::to_string(&period).unwrap();
        assert!(json.contains("\"label\":\"2024-Q3\""));
        assert!(json.contains("\"start\":\"2024-07-01\""));
        let back: Period = serde_json::from_str(&json).unwrap();
        assert_eq!(back, period);
    }
}
