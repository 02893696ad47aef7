//! Alarm watches
//!
//! A watch binds one source path to an algorithm and remembers the record of
//! its current non-normal episode. Each contiguous non-normal episode has
//! exactly one open record.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;
use voltage_alarm_store::{AlarmState, Handle};

use crate::algorithm::{Algorithm, AlgorithmConfig, WatchInput};
use crate::config::WatchConfig;
use crate::error::Result;

/// Cached state of a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchState {
    pub alarm_state: AlarmState,
    pub last_alarm_uuid: Option<Uuid>,
}

/// What a new target state means for the watch's records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to persist
    None,
    /// Start a new episode
    Raise(AlarmState),
    /// Close the current episode
    ReturnToNormal(Uuid),
    /// Close the current episode and start one in a different state
    Escalate { previous: Uuid, state: AlarmState },
}

impl WatchState {
    pub fn transition(&self, target: AlarmState) -> Transition {
        match (target.is_normal(), self.last_alarm_uuid) {
            (true, None) => Transition::None,
            (true, Some(uuid)) => Transition::ReturnToNormal(uuid),
            (false, None) => Transition::Raise(target),
            (false, Some(_)) if target == self.alarm_state => Transition::None,
            (false, Some(previous)) => Transition::Escalate {
                previous,
                state: target,
            },
        }
    }
}

pub struct AlarmWatch {
    handle: Handle,
    class: Handle,
    source_path: String,
    algorithm: Mutex<Box<dyn Algorithm>>,
    state: Mutex<WatchState>,
    // Serializes evaluate/persist so one target state yields at most one record
    transition_lock: tokio::sync::Mutex<()>,
}

impl AlarmWatch {
    pub fn new(handle: Handle, class: Handle, config: &WatchConfig) -> Result<Self> {
        let algorithm = config.algorithm.build()?;
        Ok(Self {
            handle,
            class,
            source_path: config.source_path.clone(),
            algorithm: Mutex::new(algorithm),
            state: Mutex::new(WatchState {
                alarm_state: config.alarm_state,
                last_alarm_uuid: config.last_alarm_uuid,
            }),
            transition_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn class_handle(&self) -> Handle {
        self.class
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn state(&self) -> WatchState {
        *self.state.lock()
    }

    pub fn alarm_state(&self) -> AlarmState {
        self.state.lock().alarm_state
    }

    pub fn last_alarm_uuid(&self) -> Option<Uuid> {
        self.state.lock().last_alarm_uuid
    }

    pub(crate) fn set_state(&self, alarm_state: AlarmState, last_alarm_uuid: Option<Uuid>) {
        *self.state.lock() = WatchState {
            alarm_state,
            last_alarm_uuid,
        };
    }

    /// Clear the record reference if it points at `uuid`. Returns true if cleared.
    pub(crate) fn release_record(&self, uuid: Uuid) -> bool {
        let mut state = self.state.lock();
        if state.last_alarm_uuid == Some(uuid) {
            *state = WatchState::default();
            true
        } else {
            false
        }
    }

    pub(crate) fn transition_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.transition_lock
    }

    /// Feed an input to the algorithm; returns the target state and message
    pub fn evaluate(&self, input: &WatchInput) -> (AlarmState, String) {
        let mut algorithm = self.algorithm.lock();
        let state = algorithm.evaluate(input);
        (state, algorithm.message())
    }

    /// Time-based re-evaluation; `None` when the algorithm has nothing new
    pub fn poll(&self, now: DateTime<Utc>) -> Option<(AlarmState, String)> {
        let mut algorithm = self.algorithm.lock();
        algorithm.poll(now).map(|state| (state, algorithm.message()))
    }

    /// The algorithm's most recent output
    pub fn algorithm_state(&self) -> Option<AlarmState> {
        self.algorithm.lock().last_state()
    }

    pub fn algorithm_config(&self) -> AlgorithmConfig {
        self.algorithm.lock().config()
    }

    /// Configuration reproducing this watch, including its cached state
    pub fn to_config(&self) -> WatchConfig {
        let state = self.state();
        WatchConfig {
            source_path: self.source_path.clone(),
            handle: Some(self.handle),
            algorithm: self.algorithm_config(),
            alarm_state: state.alarm_state,
            last_alarm_uuid: state.last_alarm_uuid,
        }
    }
}

impl std::fmt::Debug for AlarmWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmWatch")
            .field("handle", &self.handle)
            .field("class", &self.class)
            .field("source_path", &self.source_path)
            .field("state", &self.state())
            .finish()
    }
}
