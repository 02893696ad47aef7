//! Alarm Service Library
//!
//! Alarm classes and watches over a pluggable record store, with startup
//! reconciliation, lazily maintained counts, periodic housekeeping and live
//! open-alarm streams. [`ActionRegistry`] exposes the operations by name.

pub mod actions;
pub mod algorithm;
pub mod class;
pub mod config;
pub mod counts;
pub mod error;
pub mod logging;
pub mod registry;
pub mod service;
pub mod stream;
pub mod time_range;
pub mod watch;

pub use actions::{ActionOutput, ActionParams, ActionRegistry, ResultShape, ALARM_COLUMNS};
pub use algorithm::{Algorithm, AlgorithmConfig, InputValue, WatchInput};
pub use class::AlarmClass;
pub use config::{AlarmConfig, ClassConfig, ClassSettings, StoreBackend, StoreConfig, WatchConfig};
pub use counts::AlarmCounts;
pub use error::{AlarmError, Result};
pub use registry::{HandleRegistry, RegisteredObject};
pub use service::{open_store, AlarmService, PageRequest, ReconcileReport};
pub use stream::{AlarmSubscription, StreamEvent, StreamRegistry, StreamSink};
pub use time_range::TimeRange;
pub use watch::{AlarmWatch, Transition, WatchState};
