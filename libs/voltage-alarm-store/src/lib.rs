//! VoltageEMS Alarm Record Store
//!
//! Persistence contract for alarm records and their notes, with an in-memory
//! reference backend and a durable SQLite backend.
//!
//! # Key Components
//!
//! - **AlarmStore trait**: create, acknowledge, annotate, delete, query
//! - **AlarmQuery**: class, time range, ack/alarm/open filters and sort order
//! - **Cursor**: forward-only snapshot of query results with paging

pub mod cursor;
pub mod error;
pub mod memory_impl;
pub mod query;
pub mod record;
pub mod sqlite_impl;
pub mod traits;

// Re-exports
pub use cursor::{AlarmCursor, Cursor, NoteCursor};
pub use error::{Result, StoreError};
pub use memory_impl::MemoryAlarmStore;
pub use query::{AckFilter, AlarmFilter, AlarmQuery, OpenFilter, SortField};
pub use record::{now_millis, AlarmRecord, AlarmRecordBuilder, AlarmState, Handle, Note};
pub use sqlite_impl::SqliteAlarmStore;
pub use traits::AlarmStore;
