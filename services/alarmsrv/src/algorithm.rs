//! Alarm detection algorithms
//!
//! A watch hands every new input for its source to its algorithm and gets
//! back the alarm state the source should be in. Algorithms are built from
//! [`AlgorithmConfig`], whose `type` tag selects the variant.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use voltage_alarm_store::AlarmState;

use crate::error::{invalid_input, Result};

/// Latest value observed for a watched source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl InputValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            InputValue::Bool(b) => Some(*b),
            InputValue::Number(n) => Some(*n != 0.0),
            InputValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Some(true),
                "false" | "off" | "0" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            InputValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            InputValue::Number(n) => Some(*n),
            InputValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for InputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputValue::Bool(b) => write!(f, "{}", b),
            InputValue::Number(n) => write!(f, "{}", n),
            InputValue::Text(s) => f.write_str(s),
        }
    }
}

/// One observation of a watched source
#[derive(Debug, Clone, PartialEq)]
pub struct WatchInput {
    pub value: InputValue,
    pub timestamp: DateTime<Utc>,
}

impl WatchInput {
    pub fn new(value: InputValue) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }

    pub fn at(value: InputValue, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// Maps the latest input of a source to an alarm state
pub trait Algorithm: Send + fmt::Debug {
    /// Evaluate a new input and return the target state
    fn evaluate(&mut self, input: &WatchInput) -> AlarmState;

    /// Re-evaluate without new input, for time-based conditions.
    /// Returns `None` when the state cannot change without input.
    fn poll(&mut self, _now: DateTime<Utc>) -> Option<AlarmState> {
        None
    }

    /// Output of the most recent evaluation, if any
    fn last_state(&self) -> Option<AlarmState>;

    /// Text for a record raised from the most recent evaluation
    fn message(&self) -> String;

    /// Configuration this algorithm was built from
    fn config(&self) -> AlgorithmConfig;
}

fn default_alarm_type() -> AlarmState {
    AlarmState::Alert
}

/// Algorithm configuration; the `type` tag selects the algorithm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    /// Alarm while the value equals `alarm_value`
    Boolean {
        alarm_value: bool,
        #[serde(default = "default_alarm_type")]
        alarm_type: AlarmState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Alarm while the value is outside `[min, max]`
    OutOfRange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(default = "default_alarm_type")]
        alarm_type: AlarmState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Alarm when the value has not changed for `stale_secs`
    Stale {
        stale_secs: u64,
        #[serde(default = "default_alarm_type")]
        alarm_type: AlarmState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

fn stale_window(stale_secs: u64) -> Result<Duration> {
    i64::try_from(stale_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| invalid_input(format!("stale_secs {} is out of range", stale_secs)))
}

impl AlgorithmConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            AlgorithmConfig::Boolean { .. } => "boolean",
            AlgorithmConfig::OutOfRange { .. } => "out_of_range",
            AlgorithmConfig::Stale { .. } => "stale",
        }
    }

    pub fn alarm_type(&self) -> AlarmState {
        match self {
            AlgorithmConfig::Boolean { alarm_type, .. }
            | AlgorithmConfig::OutOfRange { alarm_type, .. }
            | AlgorithmConfig::Stale { alarm_type, .. } => *alarm_type,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.alarm_type().is_normal() {
            return Err(invalid_input(format!(
                "{} algorithm must raise a non-normal state",
                self.kind()
            )));
        }
        match self {
            AlgorithmConfig::OutOfRange { min, max, .. } => match (min, max) {
                (None, None) => Err(invalid_input("out_of_range needs min or max")),
                (Some(lo), Some(hi)) if lo > hi => Err(invalid_input(format!(
                    "out_of_range min {} is above max {}",
                    lo, hi
                ))),
                _ => Ok(()),
            },
            AlgorithmConfig::Stale { stale_secs: 0, .. } => {
                Err(invalid_input("stale_secs must be positive"))
            }
            AlgorithmConfig::Stale { stale_secs, .. } => stale_window(*stale_secs).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Construct the algorithm this configuration describes
    pub fn build(&self) -> Result<Box<dyn Algorithm>> {
        self.validate()?;
        let algorithm: Box<dyn Algorithm> = match self.clone() {
            AlgorithmConfig::Boolean {
                alarm_value,
                alarm_type,
                message,
            } => Box::new(BooleanAlgorithm {
                alarm_value,
                alarm_type,
                message,
                last: None,
                last_value: None,
            }),
            AlgorithmConfig::OutOfRange {
                min,
                max,
                alarm_type,
                message,
            } => Box::new(OutOfRangeAlgorithm {
                min,
                max,
                alarm_type,
                message,
                last: None,
                last_value: None,
            }),
            AlgorithmConfig::Stale {
                stale_secs,
                alarm_type,
                message,
            } => Box::new(StaleAlgorithm {
                stale_after: stale_window(stale_secs)?,
                stale_secs,
                alarm_type,
                message,
                last: None,
                last_value: None,
                last_change: None,
            }),
        };
        Ok(algorithm)
    }
}

#[derive(Debug)]
struct BooleanAlgorithm {
    alarm_value: bool,
    alarm_type: AlarmState,
    message: Option<String>,
    last: Option<AlarmState>,
    last_value: Option<InputValue>,
}

impl Algorithm for BooleanAlgorithm {
    fn evaluate(&mut self, input: &WatchInput) -> AlarmState {
        let state = match input.value.as_bool() {
            Some(v) if v == self.alarm_value => self.alarm_type,
            Some(_) => AlarmState::Normal,
            None => AlarmState::Fault,
        };
        self.last = Some(state);
        self.last_value = Some(input.value.clone());
        state
    }

    fn last_state(&self) -> Option<AlarmState> {
        self.last
    }

    fn message(&self) -> String {
        if let Some(msg) = &self.message {
            return msg.clone();
        }
        match (&self.last_value, self.last) {
            (Some(value), Some(AlarmState::Fault)) if value.as_bool().is_none() => {
                format!("Unreadable value: {}", value)
            }
            (Some(value), _) => format!("Value is {}", value),
            (None, _) => String::new(),
        }
    }

    fn config(&self) -> AlgorithmConfig {
        AlgorithmConfig::Boolean {
            alarm_value: self.alarm_value,
            alarm_type: self.alarm_type,
            message: self.message.clone(),
        }
    }
}

#[derive(Debug)]
struct OutOfRangeAlgorithm {
    min: Option<f64>,
    max: Option<f64>,
    alarm_type: AlarmState,
    message: Option<String>,
    last: Option<AlarmState>,
    last_value: Option<f64>,
}

impl Algorithm for OutOfRangeAlgorithm {
    fn evaluate(&mut self, input: &WatchInput) -> AlarmState {
        let value = input.value.as_f64();
        let state = match value {
            Some(v) if v.is_nan() => AlarmState::Fault,
            Some(v) => {
                let below = self.min.is_some_and(|min| v < min);
                let above = self.max.is_some_and(|max| v > max);
                if below || above {
                    self.alarm_type
                } else {
                    AlarmState::Normal
                }
            }
            None => AlarmState::Fault,
        };
        self.last = Some(state);
        self.last_value = value;
        state
    }

    fn last_state(&self) -> Option<AlarmState> {
        self.last
    }

    fn message(&self) -> String {
        if let Some(msg) = &self.message {
            return msg.clone();
        }
        match self.last_value {
            Some(v) if self.min.is_some_and(|min| v < min) => {
                format!("Value {} below minimum {}", v, self.min.unwrap_or_default())
            }
            Some(v) if self.max.is_some_and(|max| v > max) => {
                format!("Value {} above maximum {}", v, self.max.unwrap_or_default())
            }
            Some(v) => format!("Value {}", v),
            None => "Unreadable value".to_string(),
        }
    }

    fn config(&self) -> AlgorithmConfig {
        AlgorithmConfig::OutOfRange {
            min: self.min,
            max: self.max,
            alarm_type: self.alarm_type,
            message: self.message.clone(),
        }
    }
}

#[derive(Debug)]
struct StaleAlgorithm {
    stale_after: Duration,
    stale_secs: u64,
    alarm_type: AlarmState,
    message: Option<String>,
    last: Option<AlarmState>,
    last_value: Option<InputValue>,
    last_change: Option<DateTime<Utc>>,
}

impl StaleAlgorithm {
    fn state_at(&self, now: DateTime<Utc>) -> AlarmState {
        match self.last_change {
            Some(changed) if now - changed >= self.stale_after => self.alarm_type,
            _ => AlarmState::Normal,
        }
    }
}

impl Algorithm for StaleAlgorithm {
    fn evaluate(&mut self, input: &WatchInput) -> AlarmState {
        if self.last_value.as_ref() != Some(&input.value) {
            self.last_value = Some(input.value.clone());
            self.last_change = Some(input.timestamp);
        }
        let state = self.state_at(input.timestamp);
        self.last = Some(state);
        state
    }

    fn poll(&mut self, now: DateTime<Utc>) -> Option<AlarmState> {
        self.last_change?;
        let state = self.state_at(now);
        self.last = Some(state);
        Some(state)
    }

    fn last_state(&self) -> Option<AlarmState> {
        self.last
    }

    fn message(&self) -> String {
        if let Some(msg) = &self.message {
            return msg.clone();
        }
        format!("Value unchanged for {}s", self.stale_secs)
    }

    fn config(&self) -> AlgorithmConfig {
        AlgorithmConfig::Stale {
            stale_secs: self.stale_secs,
            alarm_type: self.alarm_type,
            message: self.message.clone(),
        }
    }
}
