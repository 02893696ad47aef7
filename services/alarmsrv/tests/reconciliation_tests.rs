//! Startup reconciliation between cached watch state and open records
#![allow(clippy::disallowed_methods)]

mod common;

use alarmsrv::{AlarmService, ReconcileReport};
use common::*;
use std::sync::Arc;
use uuid::Uuid;
use voltage_alarm_store::{AlarmState, AlarmStore, Handle, MemoryAlarmStore};

fn one_watch(state: AlarmState, last: Option<Uuid>) -> alarmsrv::AlarmConfig {
    config(vec![class(
        "bms",
        1,
        vec![persisted_watch("/bms/soc", 10, state, last)],
    )])
}

async fn reconcile(
    config: alarmsrv::AlarmConfig,
    store: &Arc<MemoryAlarmStore>,
) -> (Arc<AlarmService>, ReconcileReport) {
    let service = AlarmService::new(config, store.clone()).unwrap();
    let report = service.sync_watches_to_database().await.unwrap();
    (service, report)
}

async fn open_uuids(store: &MemoryAlarmStore) -> Vec<Uuid> {
    store
        .query_open_alarms(None)
        .await
        .unwrap()
        .map(|r| r.uuid())
        .collect()
}

#[tokio::test]
async fn test_cached_alarm_without_record_is_reset() {
    let store = Arc::new(MemoryAlarmStore::new());
    let (service, report) =
        reconcile(one_watch(AlarmState::Alert, Some(Uuid::new_v4())), &store).await;

    let watch = service.watch(Handle(10)).unwrap();
    assert_eq!(watch.alarm_state(), AlarmState::Normal);
    assert_eq!(watch.last_alarm_uuid(), None);
    assert_eq!(report.forced_normal, 1);
    assert!(report.changed());
}

#[tokio::test]
async fn test_normal_watch_without_record_is_untouched() {
    let store = Arc::new(MemoryAlarmStore::new());
    let (_service, report) = reconcile(one_watch(AlarmState::Normal, None), &store).await;
    assert_eq!(report, ReconcileReport::default());
}

#[tokio::test]
async fn test_unreferenced_record_is_adopted() {
    let store = Arc::new(MemoryAlarmStore::new());
    let open = record(1, 10, AlarmState::Fault, 0);
    seed(&store, &[open.clone()]).await;

    let (service, report) = reconcile(one_watch(AlarmState::Normal, None), &store).await;
    let watch = service.watch(Handle(10)).unwrap();
    assert_eq!(watch.last_alarm_uuid(), Some(open.uuid()));
    // No algorithm output yet, so the record's type is taken
    assert_eq!(watch.alarm_state(), AlarmState::Fault);
    assert_eq!(report.adopted, 1);
    assert_eq!(report.deleted, 0);
}

#[tokio::test]
async fn test_two_open_records_keep_the_newer() {
    let store = Arc::new(MemoryAlarmStore::new());
    let older = record(1, 10, AlarmState::Alert, 0);
    let newer = record(1, 10, AlarmState::Alert, 60);
    seed(&store, &[older.clone(), newer.clone()]).await;

    // The watch still remembers the older episode
    let (service, report) =
        reconcile(one_watch(AlarmState::Alert, Some(older.uuid())), &store).await;

    assert_eq!(open_uuids(&store).await, vec![newer.uuid()]);
    assert!(store.get_record(older.uuid()).await.is_err());
    let watch = service.watch(Handle(10)).unwrap();
    assert_eq!(watch.last_alarm_uuid(), Some(newer.uuid()));
    assert_eq!(report.deleted, 1);
}

#[tokio::test]
async fn test_record_older_than_remembered_is_deleted() {
    let store = Arc::new(MemoryAlarmStore::new());
    let stale = record(1, 10, AlarmState::Alert, 0);
    let remembered = record(1, 10, AlarmState::Alert, 60);
    seed(&store, &[stale.clone(), remembered.clone()]).await;

    let (service, report) =
        reconcile(one_watch(AlarmState::Alert, Some(remembered.uuid())), &store).await;

    assert_eq!(open_uuids(&store).await, vec![remembered.uuid()]);
    assert_eq!(
        service.watch(Handle(10)).unwrap().last_alarm_uuid(),
        Some(remembered.uuid())
    );
    assert_eq!(report.deleted, 1);
}

#[tokio::test]
async fn test_equal_created_time_keeps_remembered() {
    let store = Arc::new(MemoryAlarmStore::new());
    let remembered = record(1, 10, AlarmState::Alert, 0);
    let twin = record(1, 10, AlarmState::Alert, 0);
    seed(&store, &[remembered.clone(), twin.clone()]).await;

    let (service, _report) =
        reconcile(one_watch(AlarmState::Alert, Some(remembered.uuid())), &store).await;

    assert_eq!(open_uuids(&store).await, vec![remembered.uuid()]);
    assert_eq!(
        service.watch(Handle(10)).unwrap().last_alarm_uuid(),
        Some(remembered.uuid())
    );
}

#[tokio::test]
async fn test_missing_remembered_record_adopts_queried() {
    let store = Arc::new(MemoryAlarmStore::new());
    let open = record(1, 10, AlarmState::Alert, 0);
    seed(&store, &[open.clone()]).await;

    let (service, report) =
        reconcile(one_watch(AlarmState::Alert, Some(Uuid::new_v4())), &store).await;

    assert_eq!(
        service.watch(Handle(10)).unwrap().last_alarm_uuid(),
        Some(open.uuid())
    );
    assert_eq!(report.adopted, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(open_uuids(&store).await, vec![open.uuid()]);
}

#[tokio::test]
async fn test_orphaned_records() {
    let store = Arc::new(MemoryAlarmStore::new());
    // Neither watch 99 nor class 99 exists
    let orphan = record(99, 99, AlarmState::Alert, 0);
    // Its watch is gone but class 1 still exists
    let classed = record(1, 98, AlarmState::Alert, 10);
    seed(&store, &[orphan.clone(), classed.clone()]).await;

    let (_service, report) = reconcile(one_watch(AlarmState::Normal, None), &store).await;

    assert!(store.get_record(orphan.uuid()).await.is_err());
    assert!(store.get_record(classed.uuid()).await.is_ok());
    assert_eq!(report.deleted, 1);
}

#[tokio::test]
async fn test_reconciliation_converges() {
    let store = Arc::new(MemoryAlarmStore::new());
    let a_old = record(1, 10, AlarmState::Alert, 0);
    let a_new = record(1, 10, AlarmState::Alert, 30);
    let b = record(1, 11, AlarmState::Fault, 5);
    seed(&store, &[a_old.clone(), a_new.clone(), b.clone()]).await;

    let config = config(vec![class(
        "bms",
        1,
        vec![
            persisted_watch("/bms/a", 10, AlarmState::Alert, Some(a_old.uuid())),
            persisted_watch("/bms/b", 11, AlarmState::Normal, None),
            persisted_watch("/bms/c", 12, AlarmState::Fault, Some(Uuid::new_v4())),
        ],
    )]);
    let (service, first) = reconcile(config, &store).await;
    assert!(first.changed());

    // Every watch claiming an episode points at an open record it agrees with
    for watch in service.class(Handle(1)).unwrap().watches() {
        match watch.last_alarm_uuid() {
            Some(uuid) => {
                let record = store.get_record(uuid).await.unwrap();
                assert!(record.is_open());
                assert_eq!(record.alarm_watch(), Some(watch.handle()));
                assert!(!watch.alarm_state().is_normal());
            }
            None => assert_eq!(watch.alarm_state(), AlarmState::Normal),
        }
    }
    assert_eq!(open_uuids(&store).await.len(), 2);

    let second = service.sync_watches_to_database().await.unwrap();
    assert_eq!(second, ReconcileReport::default());
}

#[tokio::test]
async fn test_start_reconciles_before_steady() {
    let store = Arc::new(MemoryAlarmStore::new());
    let service = AlarmService::new(
        one_watch(AlarmState::Fault, Some(Uuid::new_v4())),
        store.clone(),
    )
    .unwrap();
    assert!(!service.is_steady());

    service.start().await.unwrap();
    assert!(service.is_steady());
    assert_eq!(
        service.watch(Handle(10)).unwrap().alarm_state(),
        AlarmState::Normal
    );
    service.stop().await.unwrap();
}
