//! Alarm record model
//!
//! A record is one alarm occurrence. Its identifier is assigned once when the
//! record is built and never changes; lifecycle fields (acknowledgement,
//! return to normal) only move forward and are changed by the store.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Stable integer handle of a registered alarm class or watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Alarm state of a record or watch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmState {
    /// Resting state
    #[default]
    Normal,
    /// Condition that needs attention
    Alert,
    /// Source or device failure
    Fault,
    /// Source outside its expected value
    Offnormal,
}

impl AlarmState {
    pub fn is_normal(self) -> bool {
        self == AlarmState::Normal
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlarmState::Normal => "NORMAL",
            AlarmState::Alert => "ALERT",
            AlarmState::Fault => "FAULT",
            AlarmState::Offnormal => "OFFNORMAL",
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(AlarmState::Normal),
            "ALERT" => Ok(AlarmState::Alert),
            "FAULT" => Ok(AlarmState::Fault),
            "OFFNORMAL" => Ok(AlarmState::Offnormal),
            other => Err(StoreError::InvalidInput(format!(
                "Unknown alarm state: {}",
                other
            ))),
        }
    }
}

/// Free-text note attached to a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub text: String,
}

/// Current time truncated to the millisecond precision every backend stores
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// One alarm occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRecord {
    uuid: Uuid,
    source_path: String,
    alarm_class: Option<Handle>,
    alarm_watch: Option<Handle>,
    created_time: DateTime<Utc>,
    alarm_type: AlarmState,
    normal_time: Option<DateTime<Utc>>,
    ack_time: Option<DateTime<Utc>>,
    ack_user: Option<String>,
    message: String,
    ack_required: bool,
}

impl AlarmRecord {
    pub fn builder() -> AlarmRecordBuilder {
        AlarmRecordBuilder::default()
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn alarm_class(&self) -> Option<Handle> {
        self.alarm_class
    }

    pub fn alarm_watch(&self) -> Option<Handle> {
        self.alarm_watch
    }

    pub fn created_time(&self) -> DateTime<Utc> {
        self.created_time
    }

    /// The non-normal state the record was raised with
    pub fn alarm_type(&self) -> AlarmState {
        self.alarm_type
    }

    pub fn normal_time(&self) -> Option<DateTime<Utc>> {
        self.normal_time
    }

    pub fn ack_time(&self) -> Option<DateTime<Utc>> {
        self.ack_time
    }

    pub fn ack_user(&self) -> Option<&str> {
        self.ack_user.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ack_required(&self) -> bool {
        self.ack_required
    }

    pub fn is_acknowledged(&self) -> bool {
        self.ack_time.is_some()
    }

    pub fn is_normal(&self) -> bool {
        self.normal_time.is_some()
    }

    /// Open until the record is normal and, when acknowledgement is
    /// required, acknowledged.
    pub fn is_open(&self) -> bool {
        if !self.is_normal() {
            return true;
        }
        self.ack_required && !self.is_acknowledged()
    }

    /// Current state: the raised type until the record returns to normal
    pub fn alarm_state(&self) -> AlarmState {
        if self.is_normal() {
            AlarmState::Normal
        } else {
            self.alarm_type
        }
    }

    /// Returns false when the record was already acknowledged.
    pub(crate) fn apply_acknowledge(&mut self, user: &str, at: DateTime<Utc>) -> bool {
        if self.ack_time.is_some() {
            return false;
        }
        self.ack_time = Some(at);
        self.ack_user = Some(user.to_string());
        true
    }

    /// Returns false when the record was already normal.
    pub(crate) fn apply_return_to_normal(&mut self, at: DateTime<Utc>) -> bool {
        if self.normal_time.is_some() {
            return false;
        }
        self.normal_time = Some(at);
        true
    }
}

/// Builder returned by `AlarmStore::new_record`
#[derive(Debug, Clone, Default)]
pub struct AlarmRecordBuilder {
    uuid: Option<Uuid>,
    source_path: String,
    alarm_class: Option<Handle>,
    alarm_watch: Option<Handle>,
    created_time: Option<DateTime<Utc>>,
    alarm_type: AlarmState,
    normal_time: Option<DateTime<Utc>>,
    ack_time: Option<DateTime<Utc>>,
    ack_user: Option<String>,
    message: String,
    ack_required: bool,
}

impl AlarmRecordBuilder {
    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = path.into();
        self
    }

    pub fn alarm_class(mut self, handle: Option<Handle>) -> Self {
        self.alarm_class = handle;
        self
    }

    pub fn alarm_watch(mut self, handle: Option<Handle>) -> Self {
        self.alarm_watch = handle;
        self
    }

    pub fn created_time(mut self, time: DateTime<Utc>) -> Self {
        self.created_time = Some(time);
        self
    }

    pub fn alarm_type(mut self, state: AlarmState) -> Self {
        self.alarm_type = state;
        self
    }

    pub fn normal_time(mut self, time: Option<DateTime<Utc>>) -> Self {
        self.normal_time = time;
        self
    }

    pub fn acknowledged(mut self, user: impl Into<String>, time: DateTime<Utc>) -> Self {
        self.ack_time = Some(time);
        self.ack_user = Some(user.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn ack_required(mut self, required: bool) -> Self {
        self.ack_required = required;
        self
    }

    /// Build the record. The identifier and a non-normal alarm type are required.
    pub fn build(self) -> Result<AlarmRecord> {
        let uuid = self
            .uuid
            .ok_or_else(|| StoreError::InvalidInput("record identifier required".to_string()))?;
        if self.alarm_type.is_normal() {
            return Err(StoreError::InvalidInput(format!(
                "record {} must be raised with a non-normal state",
                uuid
            )));
        }
        Ok(AlarmRecord {
            uuid,
            source_path: self.source_path,
            alarm_class: self.alarm_class,
            alarm_watch: self.alarm_watch,
            created_time: self
                .created_time
                .map(|t| t.trunc_subsecs(3))
                .unwrap_or_else(now_millis),
            alarm_type: self.alarm_type,
            normal_time: self.normal_time.map(|t| t.trunc_subsecs(3)),
            ack_time: self.ack_time.map(|t| t.trunc_subsecs(3)),
            ack_user: self.ack_user,
            message: self.message,
            ack_required: self.ack_required,
        })
    }
}
