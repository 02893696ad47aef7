//! Shared fixtures for alarm service tests
#![allow(dead_code)]
#![allow(clippy::disallowed_methods)]

use alarmsrv::{AlarmConfig, AlarmService, AlgorithmConfig, ClassConfig, WatchConfig};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;
use voltage_alarm_store::{AlarmRecord, AlarmState, AlarmStore, Handle, MemoryAlarmStore};

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

/// Boolean watch raising `alarm_type` while the input is true
pub fn bool_watch(path: &str, alarm_type: AlarmState) -> WatchConfig {
    WatchConfig {
        source_path: path.to_string(),
        handle: None,
        algorithm: AlgorithmConfig::Boolean {
            alarm_value: true,
            alarm_type,
            message: None,
        },
        alarm_state: AlarmState::Normal,
        last_alarm_uuid: None,
    }
}

/// Watch with a persisted handle and cached state
pub fn persisted_watch(
    path: &str,
    handle: u32,
    alarm_state: AlarmState,
    last_alarm_uuid: Option<Uuid>,
) -> WatchConfig {
    WatchConfig {
        handle: Some(Handle(handle)),
        alarm_state,
        last_alarm_uuid,
        ..bool_watch(path, AlarmState::Alert)
    }
}

pub fn class(name: &str, handle: u32, watches: Vec<WatchConfig>) -> ClassConfig {
    ClassConfig {
        handle: Some(Handle(handle)),
        watches,
        ..ClassConfig::new(name)
    }
}

pub fn config(classes: Vec<ClassConfig>) -> AlarmConfig {
    AlarmConfig {
        classes,
        ..AlarmConfig::default()
    }
}

/// Record owned by `class`/`watch`, created `offset_secs` after [`base_time`]
pub fn record(class: u32, watch: u32, state: AlarmState, offset_secs: i64) -> AlarmRecord {
    AlarmRecord::builder()
        .uuid(Uuid::new_v4())
        .source_path(format!("/watch/{}", watch))
        .alarm_class(Some(Handle(class)))
        .alarm_watch(Some(Handle(watch)))
        .alarm_type(state)
        .created_time(base_time() + Duration::seconds(offset_secs))
        .build()
        .unwrap()
}

pub async fn seed(store: &MemoryAlarmStore, records: &[AlarmRecord]) {
    for record in records {
        store.add_record(record).await.unwrap();
    }
}

/// Build and start a service over a fresh memory store
pub async fn started(config: AlarmConfig) -> (Arc<AlarmService>, Arc<MemoryAlarmStore>) {
    let store = Arc::new(MemoryAlarmStore::new());
    let service = AlarmService::new(config, store.clone()).unwrap();
    service.start().await.unwrap();
    (service, store)
}
