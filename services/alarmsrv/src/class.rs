//! Alarm classes
//!
//! A class groups watches under one retention policy and keeps cached counts
//! over its records. Counts are pushed in by the service's recompute pass.

use chrono::Duration;
use parking_lot::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info, warn};
use voltage_alarm_store::{now_millis, AlarmQuery, AlarmRecord, AlarmStore, Handle, OpenFilter};

use crate::config::{ClassConfig, ClassSettings};
use crate::counts::{AlarmCounts, PassGuard};
use crate::error::Result;
use crate::stream::StreamRegistry;
use crate::watch::AlarmWatch;

pub struct AlarmClass {
    handle: Handle,
    name: String,
    settings: RwLock<ClassSettings>,
    watches: RwLock<Vec<Arc<AlarmWatch>>>,
    counts: RwLock<AlarmCounts>,
    streams: Arc<StreamRegistry>,
    open_streams: Arc<StreamRegistry>,
    executing: AtomicBool,
}

impl AlarmClass {
    pub fn new(
        handle: Handle,
        name: impl Into<String>,
        settings: ClassSettings,
        open_streams: Arc<StreamRegistry>,
    ) -> Self {
        let name = name.into();
        Self {
            handle,
            streams: Arc::new(StreamRegistry::new(format!("class:{}", name))),
            name,
            settings: RwLock::new(settings),
            watches: RwLock::new(Vec::new()),
            counts: RwLock::new(AlarmCounts::default()),
            open_streams,
            executing: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> ClassSettings {
        *self.settings.read()
    }

    pub fn set_settings(&self, settings: ClassSettings) {
        *self.settings.write() = settings;
    }

    pub fn watches(&self) -> Vec<Arc<AlarmWatch>> {
        self.watches.read().clone()
    }

    pub fn watch(&self, handle: Handle) -> Option<Arc<AlarmWatch>> {
        self.watches
            .read()
            .iter()
            .find(|w| w.handle() == handle)
            .cloned()
    }

    pub(crate) fn attach_watch(&self, watch: Arc<AlarmWatch>) {
        self.watches.write().push(watch);
    }

    pub(crate) fn detach_watch(&self, handle: Handle) -> Option<Arc<AlarmWatch>> {
        let mut watches = self.watches.write();
        let index = watches.iter().position(|w| w.handle() == handle)?;
        Some(watches.remove(index))
    }

    pub fn counts(&self) -> AlarmCounts {
        *self.counts.read()
    }

    /// Replace the cached counts; `None` resets them to zero
    pub fn update_counts(&self, counts: Option<AlarmCounts>) {
        *self.counts.write() = counts.unwrap_or_default();
    }

    /// Subscribers to this class's open alarms
    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    /// Push a changed record to class subscribers and the global open-alarm
    /// stream. Call only after the change is durable.
    pub fn notify_all_updates(&self, record: &AlarmRecord) {
        self.streams.notify(record);
        self.open_streams.notify(record);
    }

    /// Enforce retention. Only closed records are removed: first those older
    /// than `max_age_days`, then the oldest beyond `max_records`.
    ///
    /// Returns the number of records deleted, or 0 if another pass is running.
    pub async fn execute(&self, store: &dyn AlarmStore) -> Result<usize> {
        let Some(_guard) = PassGuard::try_acquire(&self.executing) else {
            debug!("Class {} retention already running", self.name);
            return Ok(0);
        };
        let settings = self.settings();
        let mut deleted = 0;

        let cutoff = match settings.max_age_days {
            0 => None,
            days => {
                let cutoff = Duration::try_days(i64::from(days))
                    .and_then(|age| now_millis().checked_sub_signed(age));
                if cutoff.is_none() {
                    warn!("Class {} max age of {} days is out of range", self.name, days);
                }
                cutoff
            }
        };
        if let Some(cutoff) = cutoff {
            let expired = AlarmQuery {
                open: OpenFilter::Closed,
                ..AlarmQuery::default()
            }
            .with_class(Some(self.handle))
            .with_range(None, Some(cutoff));
            deleted += self.delete_matching(store, &expired, usize::MAX).await?;
        }

        if settings.max_records > 0 {
            let all = AlarmQuery::all().with_class(Some(self.handle));
            let total = store.count_alarms(&all).await?;
            if total > settings.max_records {
                let oldest_closed = AlarmQuery {
                    open: OpenFilter::Closed,
                    ..AlarmQuery::default()
                }
                .with_class(Some(self.handle));
                deleted += self
                    .delete_matching(store, &oldest_closed, total - settings.max_records)
                    .await?;
            }
        }

        if deleted > 0 {
            info!("Class {} retention removed {} records", self.name, deleted);
        }
        Ok(deleted)
    }

    async fn delete_matching(
        &self,
        store: &dyn AlarmStore,
        query: &AlarmQuery,
        limit: usize,
    ) -> Result<usize> {
        let victims: Vec<_> = store
            .query_alarms(query)
            .await?
            .take(limit)
            .map(|r| r.uuid())
            .collect();
        let mut deleted = 0;
        for uuid in victims {
            match store.delete_record(uuid).await {
                Ok(()) => deleted += 1,
                // Removed concurrently
                Err(voltage_alarm_store::StoreError::NotFound(_)) => {}
                Err(e) => {
                    warn!("Class {} retention failed on {}: {}", self.name, uuid, e);
                    return Err(e.into());
                }
            }
        }
        Ok(deleted)
    }

    /// Configuration reproducing this class and its watches
    pub fn to_config(&self) -> ClassConfig {
        let settings = self.settings();
        ClassConfig {
            name: self.name.clone(),
            handle: Some(self.handle),
            max_records: settings.max_records,
            max_age_days: settings.max_age_days,
            ack_required: settings.ack_required,
            watches: self.watches().iter().map(|w| w.to_config()).collect(),
        }
    }
}

impl std::fmt::Debug for AlarmClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmClass")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("settings", &self.settings())
            .field("counts", &self.counts())
            .finish()
    }
}
