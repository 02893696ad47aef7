//! Time range parameters
//!
//! Ranges are written `from/to` with both ends inclusive. Each end may be an
//! RFC 3339 timestamp, a local `YYYY-MM-DDTHH:MM:SS[.fff]` timestamp, or a
//! local date. Internally the end becomes exclusive: one millisecond is added
//! to a timestamp end, and a date end covers that whole day. An empty range or
//! `today` selects the current local day.

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::{invalid_input, Result};

/// Half-open interval `[from, to)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

enum Bound {
    Instant(DateTime<Utc>),
    Day(NaiveDate),
}

fn local_midnight(date: NaiveDate) -> Result<DateTime<Utc>> {
    let naive = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| invalid_input(format!("invalid date: {}", date)))?;
    local_to_utc(naive)
}

fn local_to_utc(naive: NaiveDateTime) -> Result<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| invalid_input(format!("time does not exist locally: {}", naive)))
}

fn parse_bound(text: &str) -> Result<Bound> {
    let text = text.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(Bound::Instant(t.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Bound::Instant(local_to_utc(naive)?));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Ok(Bound::Day(date));
    }
    Err(invalid_input(format!("invalid timestamp: {}", text)))
}

impl TimeRange {
    /// The current local day
    pub fn today() -> Result<Self> {
        let today = Local::now().date_naive();
        Self::day(today)
    }

    pub fn day(date: NaiveDate) -> Result<Self> {
        let next = date
            .succ_opt()
            .ok_or_else(|| invalid_input(format!("invalid date: {}", date)))?;
        Ok(Self {
            from: local_midnight(date)?,
            to: local_midnight(next)?,
        })
    }

    /// Parse a `from/to` parameter
    pub fn parse(text: Option<&str>) -> Result<Self> {
        let text = text.map(str::trim).unwrap_or_default();
        if text.is_empty() || text.eq_ignore_ascii_case("today") {
            return Self::today();
        }
        let (from, to) = text
            .split_once('/')
            .ok_or_else(|| invalid_input(format!("time range needs from/to: {}", text)))?;

        let from = match parse_bound(from)? {
            Bound::Instant(t) => t,
            Bound::Day(date) => local_midnight(date)?,
        };
        let to = match parse_bound(to)? {
            Bound::Instant(t) => t + Duration::milliseconds(1),
            Bound::Day(date) => Self::day(date)?.to,
        };
        if to <= from {
            return Err(invalid_input(format!("time range end precedes start: {}", text)));
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.from <= t && t < self.to
    }
}
