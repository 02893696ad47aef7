//! Storage contract for alarm records

use async_trait::async_trait;
use uuid::Uuid;

use crate::cursor::{AlarmCursor, NoteCursor};
use crate::error::Result;
use crate::query::AlarmQuery;
use crate::record::{AlarmRecord, AlarmRecordBuilder, Handle};

/// Alarm record store
///
/// The store is the source of truth for record existence and field values.
/// Every mutation either applies completely before the call returns or fails
/// with the record left as it was.
///
/// Implementations:
/// - `MemoryAlarmStore`: in-memory reference backend
/// - `SqliteAlarmStore`: durable SQLite backend
#[async_trait]
pub trait AlarmStore: Send + Sync + 'static {
    // ========== Lifecycle ==========

    /// Prepare the backend (open the database, create tables)
    async fn start(&self) -> Result<()>;

    /// Release backend resources
    async fn stop(&self) -> Result<()>;

    /// Allow or forbid access to the store from outside this process.
    /// The in-process view stays authoritative either way.
    async fn set_external_access(&self, enabled: bool) -> Result<()>;

    fn external_access_enabled(&self) -> bool;

    // ========== Records ==========

    /// Builder with a fresh identifier and the current time
    fn new_record(&self) -> AlarmRecordBuilder {
        AlarmRecord::builder()
            .uuid(Uuid::new_v4())
            .created_time(crate::record::now_millis())
    }

    /// Persist a new record. Fails with `Duplicate` if the identifier exists.
    async fn add_record(&self, record: &AlarmRecord) -> Result<()>;

    async fn get_record(&self, uuid: Uuid) -> Result<AlarmRecord>;

    /// Acknowledge a record. Acknowledging twice keeps the first user and time.
    async fn acknowledge(&self, uuid: Uuid, user: &str) -> Result<AlarmRecord>;

    /// Attach a note. Fails with `NotFound` if the record is absent.
    async fn add_note(&self, uuid: Uuid, user: &str, text: &str) -> Result<()>;

    /// Mark a record normal. A record already normal is left unchanged.
    async fn return_to_normal(&self, uuid: Uuid) -> Result<AlarmRecord>;

    /// Delete a record and its notes
    async fn delete_record(&self, uuid: Uuid) -> Result<()>;

    /// Delete every record and note, returning the number of records removed
    async fn delete_all_records(&self) -> Result<u64>;

    // ========== Queries ==========

    async fn query_alarms(&self, query: &AlarmQuery) -> Result<AlarmCursor>;

    /// Open records of one class, or of all classes, oldest first
    async fn query_open_alarms(&self, alarm_class: Option<Handle>) -> Result<AlarmCursor> {
        self.query_alarms(&AlarmQuery::open_alarms(alarm_class)).await
    }

    /// Notes of a record, oldest first. Fails with `NotFound` if the record is absent.
    async fn get_notes(&self, uuid: Uuid) -> Result<NoteCursor>;

    /// Number of records matching the query
    async fn count_alarms(&self, query: &AlarmQuery) -> Result<usize> {
        let cursor = self.query_alarms(query).await?;
        let total = cursor.total();
        cursor.close();
        Ok(total)
    }
}
