//! Consistency tests for alarm store implementations
//!
//! Every scenario runs against MemoryAlarmStore and SqliteAlarmStore
//! (`sqlite::memory:`), and the parity tests compare their query output
//! directly.

// Allow unwrap() in tests for cleaner test code
#![allow(clippy::disallowed_methods)]

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;
use voltage_alarm_store::{
    AckFilter, AlarmFilter, AlarmQuery, AlarmRecord, AlarmState, AlarmStore, Handle,
    MemoryAlarmStore, OpenFilter, SortField, SqliteAlarmStore, StoreError,
};

async fn sqlite_store() -> SqliteAlarmStore {
    let store = SqliteAlarmStore::connect("sqlite::memory:").await.unwrap();
    store.start().await.unwrap();
    store
}

async fn memory_store() -> MemoryAlarmStore {
    let store = MemoryAlarmStore::new();
    store.start().await.unwrap();
    store
}

fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Fixed data set covering every filter combination
///
/// Two records share a created time and message so tie-breaking is exercised.
fn fixture() -> Vec<AlarmRecord> {
    let t = base_time();
    let mut records = Vec::new();
    let rows: [(u32, i64, AlarmState, Option<i64>, Option<(&str, i64)>, &str, bool); 8] = [
        (1, 0, AlarmState::Alert, None, None, "battery low", true),
        (1, 10, AlarmState::Fault, Some(20), None, "inverter trip", true),
        (1, 30, AlarmState::Alert, Some(40), Some(("alice", 45)), "battery low", true),
        (2, 30, AlarmState::Offnormal, None, Some(("bob", 35)), "grid frequency", false),
        (2, 50, AlarmState::Fault, Some(55), None, "fan failure", false),
        (2, 60, AlarmState::Alert, None, None, "door open", true),
        (3, 70, AlarmState::Offnormal, Some(80), Some(("carol", 75)), "pcs overtemp", true),
        (3, 90, AlarmState::Fault, None, Some(("alice", 95)), "bms comms lost", true),
    ];
    for (class, created, state, normal, ack, message, ack_required) in rows {
        let mut builder = AlarmRecord::builder()
            .uuid(Uuid::new_v4())
            .source_path(format!("/site/class{}/{}", class, message.replace(' ', "_")))
            .alarm_class(Some(Handle(class)))
            .alarm_watch(Some(Handle(100 + class)))
            .created_time(t + Duration::seconds(created))
            .alarm_type(state)
            .normal_time(normal.map(|s| t + Duration::seconds(s)))
            .message(message)
            .ack_required(ack_required);
        if let Some((user, at)) = ack {
            builder = builder.acknowledged(user, t + Duration::seconds(at));
        }
        records.push(builder.build().unwrap());
    }
    records
}

async fn load(store: &dyn AlarmStore, records: &[AlarmRecord]) {
    for record in records {
        store.add_record(record).await.unwrap();
    }
}

async fn uuids(store: &dyn AlarmStore, query: &AlarmQuery) -> Vec<Uuid> {
    store
        .query_alarms(query)
        .await
        .unwrap()
        .map(|r| r.uuid())
        .collect()
}

fn queries() -> Vec<AlarmQuery> {
    let t = base_time();
    let mut out = vec![
        AlarmQuery::all(),
        AlarmQuery::open_alarms(None),
        AlarmQuery::open_alarms(Some(Handle(2))),
        AlarmQuery::all().with_range(Some(t + Duration::seconds(30)), Some(t + Duration::seconds(70))),
        AlarmQuery {
            ack: AckFilter::Unacked,
            alarm: AlarmFilter::Alarm,
            ..AlarmQuery::default()
        },
        AlarmQuery {
            ack: AckFilter::Acked,
            open: OpenFilter::Closed,
            ..AlarmQuery::default()
        },
        AlarmQuery {
            alarm: AlarmFilter::Normal,
            ..AlarmQuery::default()
        },
        AlarmQuery {
            alarm: AlarmFilter::Only(AlarmState::Fault),
            ..AlarmQuery::default()
        },
    ];
    let fields = [
        SortField::CreatedTime,
        SortField::AckTime,
        SortField::NormalTime,
        SortField::SourcePath,
        SortField::AlarmType,
        SortField::AckUser,
        SortField::Message,
    ];
    for field in fields {
        out.push(AlarmQuery::all().with_sort(field, true));
        out.push(AlarmQuery::all().with_sort(field, false));
    }
    out
}

// ============================================================================
// Parity
// ============================================================================

#[tokio::test]
async fn test_query_parity_across_backends() {
    let records = fixture();
    let memory = memory_store().await;
    let sqlite = sqlite_store().await;
    load(&memory, &records).await;
    load(&sqlite, &records).await;

    for query in queries() {
        let from_memory = uuids(&memory, &query).await;
        let from_sqlite = uuids(&sqlite, &query).await;
        assert_eq!(from_memory, from_sqlite, "query {:?}", query);
        assert_eq!(
            memory.count_alarms(&query).await.unwrap(),
            sqlite.count_alarms(&query).await.unwrap(),
            "count {:?}",
            query
        );
    }
}

#[tokio::test]
async fn test_filter_results_on_fixture() {
    let records = fixture();
    let sqlite = sqlite_store().await;
    load(&sqlite, &records).await;

    // Open: not normal, or normal with ack required and unacked
    let open = uuids(&sqlite, &AlarmQuery::open_alarms(None)).await;
    let expected: Vec<Uuid> = [0, 1, 3, 5, 7].iter().map(|i| records[*i].uuid()).collect();
    assert_eq!(open, expected);

    let class_two_open = uuids(&sqlite, &AlarmQuery::open_alarms(Some(Handle(2)))).await;
    assert_eq!(class_two_open, vec![records[3].uuid(), records[5].uuid()]);

    let t = base_time();
    let ranged = AlarmQuery::all().with_range(
        Some(t + Duration::seconds(30)),
        Some(t + Duration::seconds(60)),
    );
    assert_eq!(sqlite.count_alarms(&ranged).await.unwrap(), 3);

    let faults = AlarmQuery {
        alarm: AlarmFilter::Only(AlarmState::Fault),
        ..AlarmQuery::default()
    };
    assert_eq!(uuids(&sqlite, &faults).await, vec![records[7].uuid()]);
}

#[tokio::test]
async fn test_sort_by_message_breaks_ties_by_created_time() {
    let records = fixture();
    let memory = memory_store().await;
    load(&memory, &records).await;

    let sorted = uuids(&memory, &AlarmQuery::all().with_sort(SortField::Message, true)).await;
    // "battery low" appears twice; the older record comes first
    let first = sorted.iter().position(|u| *u == records[0].uuid()).unwrap();
    let second = sorted.iter().position(|u| *u == records[2].uuid()).unwrap();
    assert_eq!(second, first + 1);
}

// ============================================================================
// Record lifecycle
// ============================================================================

async fn scenario_round_trip(store: &dyn AlarmStore) {
    let record = store
        .new_record()
        .source_path("/bms/rack1/cell_temp")
        .alarm_class(Some(Handle(1)))
        .alarm_watch(Some(Handle(2)))
        .alarm_type(AlarmState::Alert)
        .message("cell temperature high")
        .ack_required(true)
        .build()
        .unwrap();
    store.add_record(&record).await.unwrap();

    let loaded = store.get_record(record.uuid()).await.unwrap();
    assert_eq!(loaded, record);
    assert!(loaded.is_open());
    assert!(!loaded.is_acknowledged());
}

#[tokio::test]
async fn test_memory_round_trip() {
    scenario_round_trip(&memory_store().await).await;
}

#[tokio::test]
async fn test_sqlite_round_trip() {
    scenario_round_trip(&sqlite_store().await).await;
}

async fn scenario_acknowledge_idempotent(store: &dyn AlarmStore) {
    let record = store
        .new_record()
        .alarm_type(AlarmState::Fault)
        .ack_required(true)
        .build()
        .unwrap();
    store.add_record(&record).await.unwrap();

    let first = store.acknowledge(record.uuid(), "alice").await.unwrap();
    assert!(first.is_acknowledged());
    assert_eq!(first.ack_user(), Some("alice"));

    let second = store.acknowledge(record.uuid(), "bob").await.unwrap();
    assert_eq!(second, first);
    assert_eq!(store.get_record(record.uuid()).await.unwrap(), first);
}

#[tokio::test]
async fn test_memory_acknowledge_idempotent() {
    scenario_acknowledge_idempotent(&memory_store().await).await;
}

#[tokio::test]
async fn test_sqlite_acknowledge_idempotent() {
    scenario_acknowledge_idempotent(&sqlite_store().await).await;
}

async fn scenario_return_to_normal(store: &dyn AlarmStore) {
    let record = store
        .new_record()
        .alarm_type(AlarmState::Offnormal)
        .build()
        .unwrap();
    store.add_record(&record).await.unwrap();

    let normal = store.return_to_normal(record.uuid()).await.unwrap();
    assert!(normal.is_normal());
    assert!(!normal.is_open());
    assert_eq!(normal.alarm_state(), AlarmState::Normal);

    let again = store.return_to_normal(record.uuid()).await.unwrap();
    assert_eq!(again.normal_time(), normal.normal_time());

    let open = store.query_open_alarms(None).await.unwrap();
    assert_eq!(open.total(), 0);
}

#[tokio::test]
async fn test_memory_return_to_normal() {
    scenario_return_to_normal(&memory_store().await).await;
}

#[tokio::test]
async fn test_sqlite_return_to_normal() {
    scenario_return_to_normal(&sqlite_store().await).await;
}

async fn scenario_notes(store: &dyn AlarmStore) {
    let record = store
        .new_record()
        .alarm_type(AlarmState::Alert)
        .build()
        .unwrap();
    store.add_record(&record).await.unwrap();

    store.add_note(record.uuid(), "alice", "on site").await.unwrap();
    store.add_note(record.uuid(), "bob", "replaced fuse").await.unwrap();

    let notes: Vec<_> = store.get_notes(record.uuid()).await.unwrap().collect();
    assert_eq!(notes.len(), 2);
    assert_eq!(notes[0].user, "alice");
    assert_eq!(notes[1].text, "replaced fuse");

    let missing = Uuid::new_v4();
    assert!(matches!(
        store.add_note(missing, "alice", "nothing").await,
        Err(StoreError::NotFound(id)) if id == missing
    ));
    assert!(matches!(
        store.get_notes(missing).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_memory_notes() {
    scenario_notes(&memory_store().await).await;
}

#[tokio::test]
async fn test_sqlite_notes() {
    scenario_notes(&sqlite_store().await).await;
}

async fn scenario_delete(store: &dyn AlarmStore) {
    let records = fixture();
    load(store, &records).await;

    let target = records[4].uuid();
    store.add_note(target, "op", "closing").await.unwrap();
    store.delete_record(target).await.unwrap();
    assert!(matches!(
        store.get_record(target).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.delete_record(target).await,
        Err(StoreError::NotFound(_))
    ));
    assert_eq!(store.count_alarms(&AlarmQuery::all()).await.unwrap(), 7);

    let removed = store.delete_all_records().await.unwrap();
    assert_eq!(removed, 7);
    assert_eq!(store.count_alarms(&AlarmQuery::all()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_memory_delete() {
    scenario_delete(&memory_store().await).await;
}

#[tokio::test]
async fn test_sqlite_delete() {
    scenario_delete(&sqlite_store().await).await;
}

async fn scenario_duplicate(store: &dyn AlarmStore) {
    let record = store
        .new_record()
        .alarm_type(AlarmState::Fault)
        .build()
        .unwrap();
    store.add_record(&record).await.unwrap();
    assert!(matches!(
        store.add_record(&record).await,
        Err(StoreError::Duplicate(_))
    ));
    assert_eq!(store.count_alarms(&AlarmQuery::all()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_memory_duplicate() {
    scenario_duplicate(&memory_store().await).await;
}

#[tokio::test]
async fn test_sqlite_duplicate() {
    scenario_duplicate(&sqlite_store().await).await;
}

// ============================================================================
// Paging
// ============================================================================

async fn scenario_paging(store: &dyn AlarmStore) {
    load(store, &fixture()).await;
    let query = AlarmQuery::all().with_sort(SortField::SourcePath, false);
    let unpaged = uuids(store, &query).await;

    let mut joined = Vec::new();
    for page in 0..3 {
        let mut cursor = store.query_alarms(&query).await.unwrap();
        cursor.set_paging(page, 3);
        assert_eq!(cursor.total(), 8);
        joined.extend(cursor.map(|r| r.uuid()));
    }
    assert_eq!(joined, unpaged);
}

#[tokio::test]
async fn test_memory_paging() {
    scenario_paging(&memory_store().await).await;
}

#[tokio::test]
async fn test_sqlite_paging() {
    scenario_paging(&sqlite_store().await).await;
}

// ============================================================================
// Durability
// ============================================================================

#[tokio::test]
async fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("alarms.db").display());

    let records = fixture();
    {
        let store = SqliteAlarmStore::connect(&url).await.unwrap();
        store.start().await.unwrap();
        load(&store, &records).await;
        store.acknowledge(records[0].uuid(), "alice").await.unwrap();
        store.add_note(records[0].uuid(), "alice", "seen").await.unwrap();
        store.stop().await.unwrap();
    }

    let store = SqliteAlarmStore::connect(&url).await.unwrap();
    store.start().await.unwrap();
    assert_eq!(store.count_alarms(&AlarmQuery::all()).await.unwrap(), 8);
    let reloaded = store.get_record(records[0].uuid()).await.unwrap();
    assert_eq!(reloaded.ack_user(), Some("alice"));
    assert_eq!(store.get_notes(records[0].uuid()).await.unwrap().total(), 1);
    assert_eq!(store.get_record(records[5].uuid()).await.unwrap(), records[5]);
}
