//! Query filters and sort order for alarm record queries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StoreError};
use crate::record::{AlarmRecord, AlarmState, Handle};

fn unknown(kind: &str, value: &str) -> StoreError {
    StoreError::InvalidInput(format!("Unknown {}: {}", kind, value))
}

/// Acknowledgement-state filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckFilter {
    #[default]
    Any,
    Acked,
    Unacked,
}

impl AckFilter {
    pub const NAMES: &'static [&'static str] = &["Any", "Acked", "Unacked"];

    pub fn matches(self, record: &AlarmRecord) -> bool {
        match self {
            AckFilter::Any => true,
            AckFilter::Acked => record.is_acknowledged(),
            AckFilter::Unacked => !record.is_acknowledged(),
        }
    }
}

impl FromStr for AckFilter {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(AckFilter::Any),
            "acked" => Ok(AckFilter::Acked),
            "unacked" => Ok(AckFilter::Unacked),
            _ => Err(unknown("ack state", s)),
        }
    }
}

/// Alarm-state filter, evaluated against the record's current state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmFilter {
    #[default]
    Any,
    Normal,
    /// Any non-normal state
    Alarm,
    /// One specific non-normal state
    Only(AlarmState),
}

impl AlarmFilter {
    pub const NAMES: &'static [&'static str] =
        &["Any", "Normal", "Alarm", "Alert", "Fault", "Offnormal"];

    pub fn matches(self, record: &AlarmRecord) -> bool {
        match self {
            AlarmFilter::Any => true,
            AlarmFilter::Normal => record.is_normal(),
            AlarmFilter::Alarm => !record.is_normal(),
            AlarmFilter::Only(state) => !record.is_normal() && record.alarm_type() == state,
        }
    }
}

impl FromStr for AlarmFilter {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(AlarmFilter::Any),
            "normal" => Ok(AlarmFilter::Normal),
            "alarm" => Ok(AlarmFilter::Alarm),
            other => match other.parse::<AlarmState>() {
                Ok(state) if !state.is_normal() => Ok(AlarmFilter::Only(state)),
                _ => Err(unknown("alarm state", s)),
            },
        }
    }
}

/// Open-state filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenFilter {
    #[default]
    Any,
    Open,
    Closed,
}

impl OpenFilter {
    pub const NAMES: &'static [&'static str] = &["Any", "Open", "Closed"];

    pub fn matches(self, record: &AlarmRecord) -> bool {
        match self {
            OpenFilter::Any => true,
            OpenFilter::Open => record.is_open(),
            OpenFilter::Closed => !record.is_open(),
        }
    }
}

impl FromStr for OpenFilter {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(OpenFilter::Any),
            "open" => Ok(OpenFilter::Open),
            "closed" => Ok(OpenFilter::Closed),
            _ => Err(unknown("open state", s)),
        }
    }
}

/// Record field a query can be sorted by
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    #[default]
    CreatedTime,
    AckTime,
    NormalTime,
    SourcePath,
    AlarmType,
    AckUser,
    Message,
}

impl SortField {
    pub const NAMES: &'static [&'static str] = &[
        "Created Time",
        "Ack Time",
        "Normal Time",
        "Source",
        "Type",
        "Ack User",
        "Message",
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SortField::CreatedTime => "Created Time",
            SortField::AckTime => "Ack Time",
            SortField::NormalTime => "Normal Time",
            SortField::SourcePath => "Source",
            SortField::AlarmType => "Type",
            SortField::AckUser => "Ack User",
            SortField::Message => "Message",
        }
    }

    /// Column name in the SQLite schema
    pub(crate) fn column(self) -> &'static str {
        match self {
            SortField::CreatedTime => "created_time",
            SortField::AckTime => "ack_time",
            SortField::NormalTime => "normal_time",
            SortField::SourcePath => "source_path",
            SortField::AlarmType => "alarm_type",
            SortField::AckUser => "ack_user",
            SortField::Message => "message",
        }
    }

    fn compare(self, a: &AlarmRecord, b: &AlarmRecord) -> Ordering {
        match self {
            SortField::CreatedTime => a.created_time().cmp(&b.created_time()),
            SortField::AckTime => a.ack_time().cmp(&b.ack_time()),
            SortField::NormalTime => a.normal_time().cmp(&b.normal_time()),
            SortField::SourcePath => a.source_path().cmp(b.source_path()),
            SortField::AlarmType => a.alarm_type().as_str().cmp(b.alarm_type().as_str()),
            SortField::AckUser => a.ack_user().cmp(&b.ack_user()),
            SortField::Message => a.message().cmp(b.message()),
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortField {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "createdtime" | "created" => Ok(SortField::CreatedTime),
            "acktime" => Ok(SortField::AckTime),
            "normaltime" => Ok(SortField::NormalTime),
            "source" | "sourcepath" => Ok(SortField::SourcePath),
            "type" | "alarmtype" => Ok(SortField::AlarmType),
            "ackuser" => Ok(SortField::AckUser),
            "message" => Ok(SortField::Message),
            _ => Err(unknown("sort field", s)),
        }
    }
}

/// Query over the record store
///
/// `from` is inclusive and `to` exclusive, both applied to the created time.
/// Paging is applied by the returned cursor, after filtering and sorting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmQuery {
    pub alarm_class: Option<Handle>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub ack: AckFilter,
    pub alarm: AlarmFilter,
    pub open: OpenFilter,
    pub sort_by: SortField,
    pub ascending: bool,
}

impl Default for AlarmQuery {
    fn default() -> Self {
        Self {
            alarm_class: None,
            from: None,
            to: None,
            ack: AckFilter::Any,
            alarm: AlarmFilter::Any,
            open: OpenFilter::Any,
            sort_by: SortField::CreatedTime,
            ascending: true,
        }
    }
}

impl AlarmQuery {
    /// All records, oldest first
    pub fn all() -> Self {
        Self::default()
    }

    /// Open records of one class (or all classes), oldest first
    pub fn open_alarms(alarm_class: Option<Handle>) -> Self {
        Self {
            alarm_class,
            open: OpenFilter::Open,
            ..Self::default()
        }
    }

    pub fn with_class(mut self, alarm_class: Option<Handle>) -> Self {
        self.alarm_class = alarm_class;
        self
    }

    pub fn with_range(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn with_sort(mut self, sort_by: SortField, ascending: bool) -> Self {
        self.sort_by = sort_by;
        self.ascending = ascending;
        self
    }

    pub fn matches(&self, record: &AlarmRecord) -> bool {
        if let Some(class) = self.alarm_class {
            if record.alarm_class() != Some(class) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.created_time() < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.created_time() >= to {
                return false;
            }
        }
        self.ack.matches(record) && self.alarm.matches(record) && self.open.matches(record)
    }

    /// Sort order; equal keys fall back to created time then identifier so
    /// every backend produces the same total order.
    pub fn compare(&self, a: &AlarmRecord, b: &AlarmRecord) -> Ordering {
        let ord = self
            .sort_by
            .compare(a, b)
            .then_with(|| a.created_time().cmp(&b.created_time()))
            .then_with(|| a.uuid().cmp(&b.uuid()));
        if self.ascending {
            ord
        } else {
            ord.reverse()
        }
    }
}
