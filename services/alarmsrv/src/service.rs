//! Alarm service
//!
//! Owns the record store, the handle registry and the global open-alarm
//! stream. Every mutation goes through the store first; streams are notified
//! only after the change is durable, and cached counts are marked dirty for
//! the next recompute pass.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use voltage_alarm_store::{
    now_millis, AckFilter, AlarmCursor, AlarmFilter, AlarmQuery, AlarmRecord, AlarmState,
    AlarmStore, Handle, MemoryAlarmStore, NoteCursor, OpenFilter, SortField, SqliteAlarmStore,
    StoreError,
};

use crate::algorithm::WatchInput;
use crate::class::AlarmClass;
use crate::config::{
    AlarmConfig, ClassConfig, ClassSettings, StoreBackend, StoreConfig, WatchConfig,
};
use crate::counts::{AlarmCounts, PassGuard};
use crate::error::{invalid_input, not_found, AlarmError, Result};
use crate::logging;
use crate::registry::HandleRegistry;
use crate::stream::{AlarmSubscription, StreamRegistry};
use crate::time_range::TimeRange;
use crate::watch::{AlarmWatch, Transition};

/// Default rows per page for paged queries
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Parameters of a paged alarm query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub range: TimeRange,
    pub page: usize,
    /// 0 disables paging
    pub page_size: usize,
    pub ack: AckFilter,
    pub alarm: AlarmFilter,
    pub open: OpenFilter,
    pub sort_by: SortField,
    pub ascending: bool,
}

impl PageRequest {
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
            ack: AckFilter::Any,
            alarm: AlarmFilter::Any,
            open: OpenFilter::Any,
            sort_by: SortField::CreatedTime,
            ascending: true,
        }
    }

    fn query(&self) -> AlarmQuery {
        AlarmQuery {
            ack: self.ack,
            alarm: self.alarm,
            open: self.open,
            ..AlarmQuery::default()
        }
        .with_range(Some(self.range.from), Some(self.range.to))
        .with_sort(self.sort_by, self.ascending)
    }
}

/// Outcome of startup reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Open records adopted as a watch's current record
    pub adopted: usize,
    pub deleted: usize,
    /// Watches reset to normal for lack of an open record
    pub forced_normal: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.deleted > 0 || self.forced_normal > 0
    }
}

/// Build the store selected by `config`
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn AlarmStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryAlarmStore::new())),
        StoreBackend::Sqlite => {
            if let Some(path) = sqlite_file_path(&config.url) {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        AlarmError::Config(format!(
                            "Failed to create database directory {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
            }
            let store = SqliteAlarmStore::connect(&config.url).await?;
            Ok(Arc::new(store))
        }
    }
}

fn sqlite_file_path(url: &str) -> Option<&Path> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        None
    } else {
        Some(Path::new(path))
    }
}

pub struct AlarmService {
    store: Arc<dyn AlarmStore>,
    store_config: StoreConfig,
    registry: HandleRegistry,
    open_streams: Arc<StreamRegistry>,
    counts: RwLock<AlarmCounts>,
    dirty: AtomicBool,
    updating: AtomicBool,
    executing: AtomicBool,
    steady: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
    /// Held across the name check and registration of a class
    class_names: Mutex<()>,
    housekeeping_interval: Duration,
    count_yield_every: usize,
    log_level: String,
}

impl AlarmService {
    /// Build the service and register the configured classes and watches
    /// under their persisted handles. Nothing runs until [`start`](Self::start).
    pub fn new(config: AlarmConfig, store: Arc<dyn AlarmStore>) -> Result<Arc<Self>> {
        config.validate()?;
        let service = Arc::new(Self {
            store,
            store_config: config.store.clone(),
            registry: HandleRegistry::new(config.next_handle),
            open_streams: Arc::new(StreamRegistry::new("open alarms")),
            counts: RwLock::new(AlarmCounts::default()),
            dirty: AtomicBool::new(true),
            updating: AtomicBool::new(false),
            executing: AtomicBool::new(false),
            steady: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            class_names: Mutex::new(()),
            housekeeping_interval: Duration::from_secs(config.housekeeping_interval_secs),
            count_yield_every: config.count_yield_every,
            log_level: config.log_level.clone(),
        });
        for class in config.classes {
            service.add_class(class)?;
        }
        Ok(service)
    }

    /// Open the configured store and build the service on it
    pub async fn from_config(config: AlarmConfig) -> Result<Arc<Self>> {
        let store = open_store(&config.store).await?;
        Self::new(config, store)
    }

    pub fn store(&self) -> &Arc<dyn AlarmStore> {
        &self.store
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    /// Subscribers to open alarms across all classes
    pub fn open_streams(&self) -> &Arc<StreamRegistry> {
        &self.open_streams
    }

    // ========== Lifecycle ==========

    /// Start the store, reconcile watches against it, publish fresh counts and
    /// begin housekeeping. Alarms can be created once this returns.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.store.start().await?;
        self.store
            .set_external_access(self.store_config.external_access)
            .await?;

        match self.sync_watches_to_database().await {
            Ok(report) => info!(
                "Watches reconciled: {} adopted, {} deleted, {} reset",
                report.adopted, report.deleted, report.forced_normal
            ),
            Err(e) => error!("Watch reconciliation failed: {}", e),
        }

        self.steady.store(true, Ordering::SeqCst);
        if let Err(e) = self.update_counts(true).await {
            error!("Initial count update failed: {}", e);
        }

        let token = CancellationToken::new();
        if let Some(previous) = self.shutdown.lock().replace(token.clone()) {
            previous.cancel();
        }
        self.spawn_housekeeping(token);
        info!("AlarmService started");
        Ok(())
    }

    fn spawn_housekeeping(self: &Arc<Self>, token: CancellationToken) {
        let service: Weak<Self> = Arc::downgrade(self);
        let period = self.housekeeping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            debug!("Housekeeping every {:?}", period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(service) = service.upgrade() else { break };
                        service.execute().await;
                    }
                }
            }
            debug!("Housekeeping stopped");
        });
    }

    /// Stop housekeeping without waiting for an in-flight pass, then stop the
    /// store and drop every class, watch and subscription.
    pub async fn stop(&self) -> Result<()> {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        self.steady.store(false, Ordering::SeqCst);
        let result = self.store.stop().await;
        for class in self.registry.classes() {
            class.streams().clear();
        }
        self.registry.clear();
        self.open_streams.clear();
        result?;
        info!("AlarmService stopped");
        Ok(())
    }

    /// True once startup reconciliation has finished
    pub fn is_steady(&self) -> bool {
        self.steady.load(Ordering::SeqCst)
    }

    // ========== Classes and watches ==========

    pub fn class(&self, handle: Handle) -> Result<Arc<AlarmClass>> {
        self.registry
            .class(handle)
            .ok_or_else(|| not_found(format!("alarm class {}", handle)))
    }

    pub fn class_by_name(&self, name: &str) -> Option<Arc<AlarmClass>> {
        self.registry
            .classes()
            .into_iter()
            .find(|c| c.name() == name)
    }

    pub fn classes(&self) -> Vec<Arc<AlarmClass>> {
        self.registry.classes()
    }

    pub fn watch(&self, handle: Handle) -> Result<Arc<AlarmWatch>> {
        self.registry
            .watch(handle)
            .ok_or_else(|| not_found(format!("alarm watch {}", handle)))
    }

    /// Register a class and its watches. Names are unique.
    pub fn add_class(&self, config: ClassConfig) -> Result<Arc<AlarmClass>> {
        let name = config.name.trim();
        if name.is_empty() {
            return Err(invalid_input("class name must not be empty"));
        }
        let settings = config.settings();
        settings.validate()?;
        for watch in &config.watches {
            watch.algorithm.validate()?;
        }

        let class = {
            let _names = self.class_names.lock();
            if self.class_by_name(name).is_some() {
                return Err(AlarmError::AlreadyExists(format!("alarm class {}", name)));
            }
            let open_streams = self.open_streams.clone();
            self.registry.register_class(config.handle, |handle| {
                Ok(AlarmClass::new(handle, name, settings, open_streams))
            })?
        };

        for watch in &config.watches {
            if let Err(e) = self.add_watch(class.handle(), watch.clone()) {
                let _ = self.remove_class(class.handle());
                return Err(e);
            }
        }
        info!("Added alarm class {} ({})", class.name(), class.handle());
        Ok(class)
    }

    /// Replace the retention and acknowledgement policy of a class. The new
    /// retention applies from the next housekeeping pass.
    pub fn set_class_settings(&self, handle: Handle, settings: ClassSettings) -> Result<()> {
        settings.validate()?;
        let class = self.class(handle)?;
        class.set_settings(settings);
        info!("Updated alarm class {} settings: {:?}", class.name(), settings);
        Ok(())
    }

    /// Unregister a class and its watches. Records it owned stay in the store.
    pub fn remove_class(&self, handle: Handle) -> Result<()> {
        let class = self.class(handle)?;
        for watch in class.watches() {
            class.detach_watch(watch.handle());
            let _ = self.registry.unregister(watch.handle());
        }
        self.registry.unregister(handle)?;
        class.streams().clear();
        self.mark_dirty();
        info!("Removed alarm class {} ({})", class.name(), handle);
        Ok(())
    }

    pub fn add_watch(&self, class: Handle, config: WatchConfig) -> Result<Arc<AlarmWatch>> {
        let owner = self.class(class)?;
        let watch = self
            .registry
            .register_watch(config.handle, |handle| AlarmWatch::new(handle, class, &config))?;
        owner.attach_watch(watch.clone());
        debug!(
            "Added watch {} on {} to class {}",
            watch.handle(),
            watch.source_path(),
            owner.name()
        );
        Ok(watch)
    }

    pub fn remove_watch(&self, handle: Handle) -> Result<()> {
        let watch = self.watch(handle)?;
        if let Some(class) = self.registry.class(watch.class_handle()) {
            class.detach_watch(handle);
        }
        self.registry.unregister(handle)?;
        debug!("Removed watch {} on {}", handle, watch.source_path());
        Ok(())
    }

    /// Feed an input to a watch and persist the resulting transition.
    /// Returns the record raised, if any.
    pub async fn evaluate_watch(
        &self,
        handle: Handle,
        input: &WatchInput,
    ) -> Result<Option<AlarmRecord>> {
        let watch = self.watch(handle)?;
        let _transition = watch.transition_lock().lock().await;
        let (target, message) = watch.evaluate(input);
        self.apply_target(&watch, target, &message).await
    }

    async fn apply_target(
        &self,
        watch: &AlarmWatch,
        target: AlarmState,
        message: &str,
    ) -> Result<Option<AlarmRecord>> {
        let class = self.class(watch.class_handle())?;
        match watch.state().transition(target) {
            Transition::None => Ok(None),
            Transition::Raise(state) => {
                let record = self.raise(&class, watch, state, message).await?;
                Ok(Some(record))
            }
            Transition::ReturnToNormal(uuid) => {
                self.close_episode(&class, uuid).await?;
                watch.set_state(AlarmState::Normal, None);
                Ok(None)
            }
            Transition::Escalate { previous, state } => {
                self.close_episode(&class, previous).await?;
                watch.set_state(AlarmState::Normal, None);
                let record = self.raise(&class, watch, state, message).await?;
                Ok(Some(record))
            }
        }
    }

    async fn raise(
        &self,
        class: &AlarmClass,
        watch: &AlarmWatch,
        state: AlarmState,
        message: &str,
    ) -> Result<AlarmRecord> {
        let record = self
            .create_alarm(class, Some(watch), watch.source_path(), state, message)
            .await?;
        watch.set_state(state, Some(record.uuid()));
        class.notify_all_updates(&record);
        Ok(record)
    }

    async fn close_episode(&self, class: &AlarmClass, uuid: Uuid) -> Result<()> {
        match self.store.return_to_normal(uuid).await {
            Ok(record) => {
                class.notify_all_updates(&record);
                self.mark_dirty();
                Ok(())
            }
            // Deleted while open
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ========== Records ==========

    /// Persist a new record. Rejected until the service is steady.
    ///
    /// Streams are not notified; the caller does that once it has updated
    /// any watch state that refers to the record.
    pub async fn create_alarm(
        &self,
        class: &AlarmClass,
        watch: Option<&AlarmWatch>,
        source_path: &str,
        state: AlarmState,
        message: &str,
    ) -> Result<AlarmRecord> {
        if !self.is_steady() {
            return Err(AlarmError::NotSteady(format!(
                "cannot raise {} on {}",
                state, source_path
            )));
        }
        if state.is_normal() {
            return Err(invalid_input("alarms are raised with a non-normal state"));
        }
        let record = self
            .store
            .new_record()
            .source_path(source_path)
            .alarm_class(Some(class.handle()))
            .alarm_watch(watch.map(|w| w.handle()))
            .alarm_type(state)
            .message(message)
            .ack_required(class.settings().ack_required)
            .build()?;
        self.store.add_record(&record).await?;
        self.mark_dirty();
        info!("New alarm: {} {} {}", class.name(), record.uuid(), state);
        Ok(record)
    }

    /// Acknowledge a comma separated list of record identifiers. Every
    /// identifier is parsed before any record is touched.
    pub async fn acknowledge(&self, uuids: &str, user: &str) -> Result<Vec<AlarmRecord>> {
        let uuids = parse_uuid_list(uuids)?;
        if uuids.is_empty() {
            return Err(invalid_input("no alarm identifiers given"));
        }
        for uuid in &uuids {
            self.store.get_record(*uuid).await?;
        }
        let mut acknowledged = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            match self.store.acknowledge(uuid, user).await {
                Ok(record) => {
                    self.notify(&record);
                    acknowledged.push(record);
                }
                Err(e) => {
                    // Deleted after the check; earlier records are already acknowledged
                    if !acknowledged.is_empty() {
                        self.mark_dirty();
                    }
                    return Err(e.into());
                }
            }
        }
        self.mark_dirty();
        Ok(acknowledged)
    }

    /// Acknowledge every open record that has no acknowledgement yet
    pub async fn acknowledge_all_open(&self, user: &str) -> Result<usize> {
        let pending: Vec<Uuid> = self
            .store
            .query_open_alarms(None)
            .await?
            .filter(|r| !r.is_acknowledged())
            .map(|r| r.uuid())
            .collect();
        let mut acknowledged = 0;
        for uuid in pending {
            match self.store.acknowledge(uuid, user).await {
                Ok(record) => {
                    self.notify(&record);
                    acknowledged += 1;
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if acknowledged > 0 {
            self.mark_dirty();
        }
        info!("{} acknowledged {} open alarms", user, acknowledged);
        Ok(acknowledged)
    }

    pub async fn add_note(&self, uuid: Uuid, user: &str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(invalid_input("note text must not be empty"));
        }
        self.store.add_note(uuid, user, text).await?;
        let record = self.store.get_record(uuid).await?;
        self.notify(&record);
        Ok(())
    }

    pub async fn delete_record(&self, uuid: Uuid) -> Result<()> {
        let record = self.store.get_record(uuid).await?;
        let watch = record.alarm_watch().and_then(|h| self.registry.watch(h));
        let _transition = match &watch {
            Some(watch) => Some(watch.transition_lock().lock().await),
            None => None,
        };
        self.store.delete_record(uuid).await?;
        if let Some(watch) = &watch {
            watch.release_record(uuid);
        }
        self.mark_dirty();
        info!("Deleted alarm {}", uuid);
        Ok(())
    }

    pub async fn delete_all_records(&self) -> Result<u64> {
        let watches: Vec<Arc<AlarmWatch>> = self
            .registry
            .classes()
            .iter()
            .flat_map(|c| c.watches())
            .collect();
        let mut transitions = Vec::with_capacity(watches.len());
        for watch in &watches {
            transitions.push(watch.transition_lock().lock().await);
        }
        let deleted = self.store.delete_all_records().await?;
        for watch in &watches {
            watch.set_state(AlarmState::Normal, None);
        }
        drop(transitions);
        self.mark_dirty();
        info!("Deleted all {} alarm records", deleted);
        Ok(deleted)
    }

    /// Close a record by hand. The owning watch drops its reference so its
    /// next non-normal evaluation starts a new episode.
    /// Holds the owning watch's transition lock.
    pub async fn return_to_normal(&self, uuid: Uuid) -> Result<AlarmRecord> {
        let current = self.store.get_record(uuid).await?;
        let watch = current.alarm_watch().and_then(|h| self.registry.watch(h));
        let _transition = match &watch {
            Some(watch) => Some(watch.transition_lock().lock().await),
            None => None,
        };
        let record = self.store.return_to_normal(uuid).await?;
        if let Some(watch) = &watch {
            watch.release_record(uuid);
        }
        self.notify(&record);
        self.mark_dirty();
        Ok(record)
    }

    // ========== Queries ==========

    pub async fn get_alarm(&self, uuid: Uuid) -> Result<AlarmRecord> {
        Ok(self.store.get_record(uuid).await?)
    }

    /// Records of every class created within `range`, oldest first
    pub async fn get_alarms(&self, range: TimeRange) -> Result<AlarmCursor> {
        let query = AlarmQuery::all().with_range(Some(range.from), Some(range.to));
        Ok(self.store.query_alarms(&query).await?)
    }

    pub async fn get_alarm_page(&self, request: &PageRequest) -> Result<AlarmCursor> {
        let mut cursor = self.store.query_alarms(&request.query()).await?;
        if request.page_size > 0 {
            cursor.set_paging(request.page, request.page_size);
        }
        Ok(cursor)
    }

    /// Number of pages the request's filters produce at its page size
    pub async fn get_alarm_page_count(&self, request: &PageRequest) -> Result<usize> {
        if request.page_size == 0 {
            return Ok(0);
        }
        let matching = self.store.count_alarms(&request.query()).await?;
        Ok(matching.div_ceil(request.page_size))
    }

    pub async fn get_notes(&self, uuid: Uuid) -> Result<NoteCursor> {
        Ok(self.store.get_notes(uuid).await?)
    }

    /// Open records of one class or of all classes. With `stream_updates` the
    /// subscription stays registered after the snapshot and receives every
    /// later update.
    pub async fn get_open_alarms(
        &self,
        class: Option<Handle>,
        stream_updates: bool,
    ) -> Result<AlarmSubscription> {
        let registry = match class {
            Some(handle) => self.class(handle)?.streams().clone(),
            None => self.open_streams.clone(),
        };
        if !stream_updates {
            let rows = self.store.query_open_alarms(class).await?.collect_remaining();
            return Ok(AlarmSubscription::snapshot(rows));
        }
        // Register before querying so no update falls between the two
        let (subscription, start) = AlarmSubscription::live(registry);
        let rows = self.store.query_open_alarms(class).await?.collect_remaining();
        start.send_snapshot(rows);
        Ok(subscription)
    }

    // ========== Counts ==========

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// System-wide counts from the last recompute
    pub fn counts(&self) -> AlarmCounts {
        *self.counts.read()
    }

    /// Recompute cached counts with one scan of the store. Without `force`
    /// nothing happens unless a mutation marked them dirty. A call made while
    /// another pass runs returns at once.
    ///
    /// Returns true if a pass ran.
    pub async fn update_counts(&self, force: bool) -> Result<bool> {
        if !force && !self.dirty.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let Some(_guard) = PassGuard::try_acquire(&self.updating) else {
            debug!("Count update already running");
            return Ok(false);
        };
        self.dirty.store(false, Ordering::SeqCst);
        match self.recount().await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.mark_dirty();
                Err(e)
            }
        }
    }

    async fn recount(&self) -> Result<()> {
        let mut cursor = self.store.query_alarms(&AlarmQuery::all()).await?;
        let mut system = AlarmCounts::default();
        let mut per_class: HashMap<Handle, AlarmCounts> = HashMap::new();
        let mut scanned = 0usize;
        while cursor.advance() {
            if let Some(record) = cursor.record() {
                system.tally(record);
                if let Some(class) = record.alarm_class() {
                    per_class.entry(class).or_default().tally(record);
                }
            }
            scanned += 1;
            if scanned % self.count_yield_every == 0 {
                tokio::task::yield_now().await;
            }
        }
        cursor.close();

        *self.counts.write() = system;
        for class in self.registry.classes() {
            class.update_counts(per_class.get(&class.handle()).copied());
        }
        debug!(
            "Counts updated over {} records: {} open, {} unacked",
            scanned, system.open, system.unacked
        );
        Ok(())
    }

    // ========== Housekeeping ==========

    /// One housekeeping pass: time-based watch evaluation, per-class
    /// retention, then a count refresh if anything changed. Failures are
    /// logged. A pass requested while another runs is skipped.
    pub async fn execute(&self) {
        if !self.is_steady() {
            return;
        }
        let Some(_guard) = PassGuard::try_acquire(&self.executing) else {
            debug!("Housekeeping already running");
            return;
        };

        let now = now_millis();
        for class in self.registry.classes() {
            for watch in class.watches() {
                let _transition = watch.transition_lock().lock().await;
                if let Some((target, message)) = watch.poll(now) {
                    if let Err(e) = self.apply_target(&watch, target, &message).await {
                        warn!("Watch {} poll failed: {}", watch.source_path(), e);
                    }
                }
            }

            match class.execute(self.store.as_ref()).await {
                Ok(0) => {}
                Ok(_) => self.mark_dirty(),
                Err(e) => warn!("Class {} housekeeping failed: {}", class.name(), e),
            }
        }

        if let Err(e) = self.update_counts(false).await {
            warn!("Count update failed: {}", e);
        }
    }

    // ========== Reconciliation ==========

    /// Repair drift between cached watch state and the open records in the
    /// store. Afterwards every watch has at most one open record, agrees with
    /// it, and a watch without one is normal.
    pub async fn sync_watches_to_database(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut unmatched: HashMap<Handle, Arc<AlarmWatch>> = self
            .registry
            .classes()
            .iter()
            .flat_map(|c| c.watches())
            .map(|w| (w.handle(), w))
            .collect();
        let mut doomed: Vec<Uuid> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut condemn = |uuid: Uuid, doomed: &mut Vec<Uuid>| {
            if seen.insert(uuid) {
                doomed.push(uuid);
            }
        };

        let open = self.store.query_open_alarms(None).await?;
        for record in open {
            let Some(watch) = record.alarm_watch().and_then(|h| self.registry.watch(h)) else {
                let has_class = record
                    .alarm_class()
                    .and_then(|h| self.registry.class(h))
                    .is_some();
                if !has_class {
                    debug!("Orphaned alarm {}", record.uuid());
                    condemn(record.uuid(), &mut doomed);
                }
                continue;
            };
            if record.is_normal() {
                continue;
            }

            match watch.last_alarm_uuid() {
                None => {
                    adopt(&watch, &record);
                    report.adopted += 1;
                }
                Some(last) if last == record.uuid() => {}
                Some(last) => match self.store.get_record(last).await {
                    Err(StoreError::NotFound(_)) => {
                        adopt(&watch, &record);
                        report.adopted += 1;
                    }
                    Err(e) => return Err(e.into()),
                    Ok(remembered) => {
                        let keep_remembered = remembered.created_time() > record.created_time()
                            || (remembered.created_time() == record.created_time()
                                && !remembered.is_normal());
                        if keep_remembered {
                            debug!("Stale alarm {} for {}", record.uuid(), watch.source_path());
                            condemn(record.uuid(), &mut doomed);
                            if remembered.is_normal() {
                                // The remembered episode is over; nothing supports the watch
                                continue;
                            }
                        } else {
                            if !remembered.is_normal() {
                                condemn(remembered.uuid(), &mut doomed);
                            }
                            adopt(&watch, &record);
                            report.adopted += 1;
                        }
                    }
                },
            }
            unmatched.remove(&watch.handle());
        }

        for uuid in doomed {
            match self.store.delete_record(uuid).await {
                Ok(()) => report.deleted += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!("Failed to delete alarm {}: {}", uuid, e),
            }
        }

        for watch in unmatched.values() {
            let state = watch.state();
            if !state.alarm_state.is_normal() || state.last_alarm_uuid.is_some() {
                watch.set_state(AlarmState::Normal, None);
                report.forced_normal += 1;
            }
        }

        if report.changed() {
            self.mark_dirty();
        }
        Ok(report)
    }

    // ========== Misc ==========

    pub async fn set_external_access(&self, enabled: bool) -> Result<()> {
        self.store.set_external_access(enabled).await?;
        info!("External store access {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Configuration reproducing the live classes, watch state and handle counter
    pub fn config_snapshot(&self) -> AlarmConfig {
        let mut store = self.store_config.clone();
        store.external_access = self.store.external_access_enabled();
        let log_level = match logging::get_log_level() {
            level if level == "unknown" => self.log_level.clone(),
            level => level,
        };
        AlarmConfig {
            store,
            housekeeping_interval_secs: self.housekeeping_interval.as_secs(),
            count_yield_every: self.count_yield_every,
            log_level,
            next_handle: self.registry.next_handle(),
            classes: self.registry.classes().iter().map(|c| c.to_config()).collect(),
        }
    }

    /// Push a changed record to its class streams, or to the global stream
    /// when its class is gone
    fn notify(&self, record: &AlarmRecord) {
        match record.alarm_class().and_then(|h| self.registry.class(h)) {
            Some(class) => class.notify_all_updates(record),
            None => {
                self.open_streams.notify(record);
            }
        }
    }
}

fn adopt(watch: &AlarmWatch, record: &AlarmRecord) {
    let state = watch
        .algorithm_state()
        .filter(|s| !s.is_normal())
        .unwrap_or_else(|| record.alarm_type());
    watch.set_state(state, Some(record.uuid()));
}

/// Parse `a, b,c` into identifiers, skipping empty items
pub fn parse_uuid_list(text: &str) -> Result<Vec<Uuid>> {
    text.split(',')
        .map(|item| item.replace(' ', ""))
        .filter(|item| !item.is_empty())
        .map(|item| {
            Uuid::parse_str(&item).map_err(|_| invalid_input(format!("invalid alarm id: {}", item)))
        })
        .collect()
}
