//! In-memory alarm store
//!
//! Reference backend for tests and embedded use. All state lives behind one
//! lock so each mutation is atomic for the record it touches.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use uuid::Uuid;

use crate::cursor::{AlarmCursor, Cursor, NoteCursor};
use crate::error::{Result, StoreError};
use crate::query::AlarmQuery;
use crate::record::{now_millis, AlarmRecord, Note};
use crate::traits::AlarmStore;

#[derive(Default)]
struct StoreState {
    records: HashMap<Uuid, AlarmRecord>,
    notes: HashMap<Uuid, Vec<Note>>,
}

/// In-memory alarm store
#[derive(Default)]
pub struct MemoryAlarmStore {
    state: RwLock<StoreState>,
    external_access: AtomicBool,
}

impl MemoryAlarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AlarmStore for MemoryAlarmStore {
    async fn start(&self) -> Result<()> {
        debug!("Memory alarm store started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        debug!("Memory alarm store stopped");
        Ok(())
    }

    async fn set_external_access(&self, enabled: bool) -> Result<()> {
        self.external_access.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn external_access_enabled(&self) -> bool {
        self.external_access.load(Ordering::SeqCst)
    }

    async fn add_record(&self, record: &AlarmRecord) -> Result<()> {
        let mut state = self.state.write();
        if state.records.contains_key(&record.uuid()) {
            return Err(StoreError::Duplicate(record.uuid()));
        }
        state.records.insert(record.uuid(), record.clone());
        Ok(())
    }

    async fn get_record(&self, uuid: Uuid) -> Result<AlarmRecord> {
        self.state
            .read()
            .records
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::NotFound(uuid))
    }

    async fn acknowledge(&self, uuid: Uuid, user: &str) -> Result<AlarmRecord> {
        let mut state = self.state.write();
        let record = state
            .records
            .get_mut(&uuid)
            .ok_or(StoreError::NotFound(uuid))?;
        record.apply_acknowledge(user, now_millis());
        Ok(record.clone())
    }

    async fn add_note(&self, uuid: Uuid, user: &str, text: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.records.contains_key(&uuid) {
            return Err(StoreError::NotFound(uuid));
        }
        state.notes.entry(uuid).or_default().push(Note {
            timestamp: now_millis(),
            user: user.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn return_to_normal(&self, uuid: Uuid) -> Result<AlarmRecord> {
        let mut state = self.state.write();
        let record = state
            .records
            .get_mut(&uuid)
            .ok_or(StoreError::NotFound(uuid))?;
        record.apply_return_to_normal(now_millis());
        Ok(record.clone())
    }

    async fn delete_record(&self, uuid: Uuid) -> Result<()> {
        let mut state = self.state.write();
        if state.records.remove(&uuid).is_none() {
            return Err(StoreError::NotFound(uuid));
        }
        state.notes.remove(&uuid);
        Ok(())
    }

    async fn delete_all_records(&self) -> Result<u64> {
        let mut state = self.state.write();
        let removed = state.records.len() as u64;
        state.records.clear();
        state.notes.clear();
        Ok(removed)
    }

    async fn query_alarms(&self, query: &AlarmQuery) -> Result<AlarmCursor> {
        let mut rows: Vec<AlarmRecord> = self
            .state
            .read()
            .records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| query.compare(a, b));
        Ok(Cursor::new(rows))
    }

    async fn get_notes(&self, uuid: Uuid) -> Result<NoteCursor> {
        let state = self.state.read();
        if !state.records.contains_key(&uuid) {
            return Err(StoreError::NotFound(uuid));
        }
        let notes = state.notes.get(&uuid).cloned().unwrap_or_default();
        Ok(Cursor::new(notes))
    }
}
