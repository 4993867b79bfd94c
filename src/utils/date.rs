//! Utilities for formatting timestamps.

use std::fmt;
use chrono::{DateTime, Local, Utc};
use chrono::format::{Item, Numeric, Pad};


//------------ Constructing ISO Dates ----------------------------------------

/// Formats a UTC timestamp as an ISO 8601 date-time with a `Z` suffix.
pub fn format_iso_date(date: DateTime<Utc>) -> impl fmt::Display {
    const UTC_ISO_DATE: &[Item<'static>] = &[
        Item::Numeric(Numeric::Year, Pad::Zero),
        Item::Literal("-"),
        Item::Numeric(Numeric::Month, Pad::Zero),
        Item::Literal("-"),
        Item::Numeric(Numeric::Day, Pad::Zero),
        Item::Literal("T"),
        Item::Numeric(Numeric::Hour, Pad::Zero),
        Item::Literal(":"),
        Item::Numeric(Numeric::Minute, Pad::Zero),
        Item::Literal(":"),
        Item::Numeric(Numeric::Second, Pad::Zero),
        Item::Literal("Z"),
    ];

    date.format_with_items(UTC_ISO_DATE.iter())
}

/// Formats a local timestamp as an ISO 8601 date-time without a zone.
pub fn format_local_iso_date(date: DateTime<Local>) -> impl fmt::Display {
    const LOCAL_ISO_DATE: &[Item<'static>] = &[
        Item::Numeric(Numeric::Year, Pad::Zero),
        Item::Literal("-"),
        Item::Numeric(Numeric::Month, Pad::Zero),
        Item::Literal("-"),
        Item::Numeric(Numeric::Day, Pad::Zero),
        Item::Literal("T"),
        Item::Numeric(Numeric::Hour, Pad::Zero),
        Item::Literal(":"),
        Item::Numeric(Numeric::Minute, Pad::Zero),
        Item::Literal(":"),
        Item::Numeric(Numeric::Second, Pad::Zero),
    ];

    date.format_with_items(LOCAL_ISO_DATE.iter())
}

/// Formats a UTC timestamp for use in file names.
///
/// The result contains only characters safe in path components.
pub fn format_file_stamp(date: DateTime<Utc>) -> impl fmt::Display {
    const FILE_STAMP: &[Item<'static>] = &[
        Item::Numeric(Numeric::Year, Pad::Zero),
        Item::Numeric(Numeric::Month, Pad::Zero),
        Item::Numeric(Numeric::Day, Pad::Zero),
        Item::Literal("-"),
        Item::Numeric(Numeric::Hour, Pad::Zero),
        Item::Numeric(Numeric::Minute, Pad::Zero),
        Item::Numeric(Numeric::Second, Pad::Zero),
    ];

    date.format_with_items(FILE_STAMP.iter())
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_iso_date() {
        let date = Utc.from_utc_datetime(
            &chrono::naive::NaiveDate::from_ymd_opt(
                2024, 3, 9
            ).unwrap().and_hms_opt(8, 49, 37).unwrap()
        );
        assert_eq!(
            format_iso_date(date).to_string(),
            "2024-03-09T08:49:37Z"
        );
        assert_eq!(
            format_file_stamp(date).to_string(),
            "20240309-084937"
        );
    }
}
