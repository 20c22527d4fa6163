use chrono::{Datelike, NaiveDate};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Whether a fixture scheduled on `candidate` belongs to the calendar day of
/// `target`. Only month and day are compared: fixtures recur season after
/// season on the same day. February 29 matches February 29 only.
pub fn matches(candidate: NaiveDate, target: NaiveDate) -> bool {
    candidate.month() == target.month() && candidate.day() == target.day()
}

/// A calendar day without a year, the unit a live view is selected by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonthDay {
    month: u32,
    day: u32,
}

impl MonthDay {
    /// `None` for days that exist in no year, e.g. 04-31 or 02-30.
    pub fn new(month: u32, day: u32) -> Option<Self> {
        // 2000 is a leap year, so 02-29 is accepted.
        NaiveDate::from_ymd_opt(2000, month, day)?;
        Some(MonthDay { month, day })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        MonthDay {
            month: date.month(),
            day: date.day(),
        }
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn day(&self) -> u32 {
        self.day
    }

    pub fn matches(&self, candidate: NaiveDate) -> bool {
        candidate.month() == self.month && candidate.day() == self.day
    }
}

impl fmt::Display for MonthDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

impl Serialize for MonthDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for MonthDay {
    type Err = String;

    /// Accepts "MM-DD" or a full "YYYY-MM-DD" date whose year is dropped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(MonthDay::from_date(date));
        }
        let (m, d) = s
            .split_once('-')
            .ok_or_else(|| format!("expected MM-DD or YYYY-MM-DD, got '{}'", s))?;
        let month: u32 = m.parse().map_err(|_| format!("invalid month in '{}'", s))?;
        let day: u32 = d.parse().map_err(|_| format!("invalid day in '{}'", s))?;
        MonthDay::new(month, day).ok_or_else(|| format!("no such calendar day '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_year_is_ignored() {
        assert!(matches(ymd(2019, 5, 15), ymd(2024, 5, 15)));
        assert!(matches(ymd(2024, 12, 31), ymd(1999, 12, 31)));
        assert!(!matches(ymd(2024, 5, 15), ymd(2024, 5, 16)));
        assert!(!matches(ymd(2024, 5, 15), ymd(2024, 6, 15)));
    }

    #[test]
    fn test_leap_day_only_matches_leap_day() {
        assert!(matches(ymd(2020, 2, 29), ymd(2024, 2, 29)));
        assert!(!matches(ymd(2020, 2, 29), ymd(2023, 2, 28)));
        assert!(!matches(ymd(2023, 2, 28), ymd(2024, 2, 29)));
        assert!(!matches(ymd(2023, 3, 1), ymd(2024, 2, 29)));
    }

    #[test]
    fn test_every_day_of_a_leap_year_matches_other_years() {
        let mut day = ymd(2024, 1, 1);
        while day.year() == 2024 {
            let other = ymd(2021, day.month(), day.day().min(28));
            if day.month() == 2 && day.day() == 29 {
                assert!(!matches(other, day));
            } else if day.day() <= 28 {
                assert!(matches(other, day));
            }
            day = day.succ_opt().unwrap();
        }
    }

    #[test]
    fn test_month_day_parse() {
        assert_eq!("05-15".parse::<MonthDay>(), Ok(MonthDay::new(5, 15).unwrap()));
        assert_eq!("2019-05-15".parse::<MonthDay>(), Ok(MonthDay::new(5, 15).unwrap()));
        assert_eq!("02-29".parse::<MonthDay>().unwrap().to_string(), "02-29");
        assert!("02-30".parse::<MonthDay>().is_err());
        assert!("13-01".parse::<MonthDay>().is_err());
        assert!("tomorrow".parse::<MonthDay>().is_err());
    }

    #[test]
    fn test_month_day_matches_candidate() {
        let target = MonthDay::new(5, 15).unwrap();
        assert!(target.matches(ymd(2024, 5, 15)));
        assert!(target.matches(ymd(1987, 5, 15)));
        assert!(!target.matches(ymd(2024, 5, 14)));
    }
}
