//! INTERNALDATE parsing and formatting.
//!
//! `date-time = DQUOTE date-day-fixed "-" date-month "-" date-year SP time SP zone DQUOTE`
//!
//! Parsing is strict: a malformed date-time is an error, never silently
//! replaced by the current time.

use chrono::{DateTime, FixedOffset, NaiveDate};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed date-time: {0}")]
pub struct DateTimeError(pub String);

/// Parse the content of a `date-time`, e.g. `17-Jul-1996 02:44:25 -0700`.
///
/// The day may be space-padded (`" 1-Jul-1996 ..."`).
pub fn parse_date_time(input: &str) -> Result<DateTime<FixedOffset>, DateTimeError> {
    let trimmed = input.trim_start();

    DateTime::parse_from_str(trimmed, "%d-%b-%Y %H:%M:%S %z")
        .map_err(|_| DateTimeError(input.to_owned()))
}

/// Parse a SEARCH `date`, e.g. `1-Feb-1994`.
pub fn parse_date(input: &str) -> Result<NaiveDate, DateTimeError> {
    let trimmed = input.trim_start();

    NaiveDate::parse_from_str(trimmed, "%d-%b-%Y").map_err(|_| DateTimeError(input.to_owned()))
}

/// Render a date-time the way FETCH reports INTERNALDATE.
pub fn format_date_time(value: &DateTime<FixedOffset>) -> String {
    value.format("%d-%b-%Y %H:%M:%S %z").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_date_time() {
        let parsed = parse_date_time("17-Jul-1996 02:44:25 -0700").unwrap();
        assert_eq!(parsed.day(), 17);
        assert_eq!(parsed.month(), 7);
        assert_eq!(parsed.year(), 1996);
        assert_eq!(parsed.hour(), 2);
        assert_eq!(parsed.offset().local_minus_utc(), -7 * 3600);
    }

    #[test]
    fn test_space_padded_day() {
        let parsed = parse_date_time(" 1-Jul-1996 02:44:25 +0000").unwrap();
        assert_eq!(parsed.day(), 1);
    }

    #[test]
    fn test_malformed_is_an_error() {
        assert!(parse_date_time("not a date").is_err());
        assert!(parse_date_time("32-Jul-1996 02:44:25 +0000").is_err());
        assert!(parse_date_time("17-Jul-1996 02:44:25").is_err());
    }

    #[test]
    fn test_round_trip() {
        let text = "17-Jul-1996 02:44:25 -0700";
        let parsed = parse_date_time(text).unwrap();
        assert_eq!(format_date_time(&parsed), text);
    }

    #[test]
    fn test_parse_search_date() {
        let parsed = parse_date("1-Feb-1994").unwrap();
        assert_eq!((parsed.year(), parsed.month(), parsed.day()), (1994, 2, 1));
        assert!(parse_date("1994-02-01").is_err());
    }
}
