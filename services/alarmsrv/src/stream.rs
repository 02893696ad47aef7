//! Live alarm streams
//!
//! Subscribers register a [`StreamSink`] with a [`StreamRegistry`]. The sink
//! list is an immutable `Vec` swapped atomically on every change, so delivery
//! iterates a stable snapshot while subscribe and unsubscribe run concurrently.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use voltage_alarm_store::AlarmRecord;

/// Receiver of record updates
pub trait StreamSink: Send + Sync {
    /// Deliver one update. Returning false marks the sink closed and it is
    /// dropped from the registry.
    fn deliver(&self, record: &AlarmRecord) -> bool;
}

/// Identifier of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SinkList = Vec<(SubscriptionId, Arc<dyn StreamSink>)>;

/// Copy-on-write set of sinks
pub struct StreamRegistry {
    name: String,
    sinks: ArcSwap<SinkList>,
    next_id: AtomicU64,
}

impl StreamRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sinks: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, sink: Arc<dyn StreamSink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks.rcu(|current| {
            let mut next = SinkList::clone(current);
            next.push((id, Arc::clone(&sink)));
            next
        });
        debug!("Stream {} subscriber {} added", self.name, id.0);
        id
    }

    /// Returns false if the id was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let previous = self.sinks.rcu(|current| {
            current
                .iter()
                .filter(|(sid, _)| *sid != id)
                .cloned()
                .collect::<SinkList>()
        });
        let removed = previous.iter().any(|(sid, _)| *sid == id);
        if removed {
            debug!("Stream {} subscriber {} removed", self.name, id.0);
        }
        removed
    }

    /// Deliver `record` to every sink registered when the call starts.
    /// Returns the number of successful deliveries.
    pub fn notify(&self, record: &AlarmRecord) -> usize {
        let snapshot = self.sinks.load_full();
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sink) in snapshot.iter() {
            if sink.deliver(record) {
                delivered += 1;
            } else {
                closed.push(*id);
            }
        }
        for id in closed {
            self.unsubscribe(id);
        }
        trace!(
            "Stream {} delivered {} to {} subscribers",
            self.name,
            record.uuid(),
            delivered
        );
        delivered
    }

    pub fn len(&self) -> usize {
        self.sinks.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.sinks.store(Arc::new(Vec::new()));
    }
}

/// Event received by a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Row of the initial query
    Snapshot(AlarmRecord),
    /// The initial query has been fully sent
    SnapshotComplete,
    /// A record changed after subscription
    Update(AlarmRecord),
}

/// Sink backed by an unbounded channel
///
/// Updates that arrive before the snapshot is sent are held back and
/// delivered right after `SnapshotComplete`.
struct ChannelSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
    pending: Mutex<Option<Vec<AlarmRecord>>>,
}

impl ChannelSink {
    fn new(tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self {
            tx,
            pending: Mutex::new(Some(Vec::new())),
        }
    }

    fn send_snapshot(&self, rows: Vec<AlarmRecord>) {
        let mut pending = self.pending.lock();
        for row in rows {
            let _ = self.tx.send(StreamEvent::Snapshot(row));
        }
        let _ = self.tx.send(StreamEvent::SnapshotComplete);
        if let Some(held) = pending.take() {
            for row in held {
                let _ = self.tx.send(StreamEvent::Update(row));
            }
        }
    }
}

impl StreamSink for ChannelSink {
    fn deliver(&self, record: &AlarmRecord) -> bool {
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(held) => {
                held.push(record.clone());
                !self.tx.is_closed()
            }
            None => self.tx.send(StreamEvent::Update(record.clone())).is_ok(),
        }
    }
}

/// Handle held by a stream consumer
///
/// Dropping the subscription (or calling [`AlarmSubscription::cancel`])
/// unregisters it.
pub struct AlarmSubscription {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    registration: Option<(Arc<StreamRegistry>, SubscriptionId)>,
}

impl AlarmSubscription {
    /// Register a live subscription. Updates that arrive before
    /// [`LiveStart::send_snapshot`] are queued behind the snapshot.
    pub fn live(registry: Arc<StreamRegistry>) -> (Self, LiveStart) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(ChannelSink::new(tx));
        let id = registry.subscribe(sink.clone());
        (
            Self {
                rx,
                registration: Some((registry, id)),
            },
            LiveStart { sink },
        )
    }

    /// Snapshot-only subscription: the rows, `SnapshotComplete`, then end of stream
    pub fn snapshot(rows: Vec<AlarmRecord>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        sink.send_snapshot(rows);
        Self {
            rx,
            registration: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.registration.is_some()
    }

    /// Next event; `None` once a snapshot-only stream is exhausted
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }

    pub fn cancel(mut self) {
        self.unregister();
    }

    fn unregister(&mut self) {
        if let Some((registry, id)) = self.registration.take() {
            registry.unsubscribe(id);
        }
    }
}

impl Drop for AlarmSubscription {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Completes a live subscription once its snapshot has been queried
pub struct LiveStart {
    sink: Arc<ChannelSink>,
}

impl LiveStart {
    pub fn send_snapshot(self, rows: Vec<AlarmRecord>) {
        self.sink.send_snapshot(rows);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;
    use voltage_alarm_store::AlarmState;

    fn record() -> AlarmRecord {
        AlarmRecord::builder()
            .uuid(Uuid::new_v4())
            .alarm_type(AlarmState::Alert)
            .build()
            .unwrap()
    }

    #[derive(Default)]
    struct CountingSink {
        hits: AtomicUsize,
    }

    impl StreamSink for CountingSink {
        fn deliver(&self, _record: &AlarmRecord) -> bool {
            self.hits.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    /// Unregisters another subscriber from inside its own delivery
    struct UnsubscribingSink {
        registry: Arc<StreamRegistry>,
        victim: RwLock<Option<SubscriptionId>>,
        hits: AtomicUsize,
    }

    impl StreamSink for UnsubscribingSink {
        fn deliver(&self, _record: &AlarmRecord) -> bool {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = self.victim.write().take() {
                self.registry.unsubscribe(id);
            }
            true
        }
    }

    struct ClosedSink;

    impl StreamSink for ClosedSink {
        fn deliver(&self, _record: &AlarmRecord) -> bool {
            false
        }
    }

    #[test]
    fn test_five_subscribers_each_notified_once() {
        let registry = StreamRegistry::new("open");
        let sinks: Vec<Arc<CountingSink>> = (0..5).map(|_| Arc::default()).collect();
        for sink in &sinks {
            registry.subscribe(sink.clone());
        }
        assert_eq!(registry.notify(&record()), 5);
        for sink in &sinks {
            assert_eq!(sink.hits.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_unsubscribe_during_delivery() {
        let registry = Arc::new(StreamRegistry::new("open"));
        let unsubscriber = Arc::new(UnsubscribingSink {
            registry: registry.clone(),
            victim: RwLock::new(None),
            hits: AtomicUsize::new(0),
        });
        registry.subscribe(unsubscriber.clone());

        let others: Vec<Arc<CountingSink>> = (0..4).map(|_| Arc::default()).collect();
        let mut ids = Vec::new();
        for sink in &others {
            ids.push(registry.subscribe(sink.clone()));
        }
        // The first sink removes the last one mid-notification
        *unsubscriber.victim.write() = Some(ids[3]);

        let delivered = registry.notify(&record());

        // The snapshot taken at the start still includes the removed sink
        assert_eq!(delivered, 5);
        assert_eq!(unsubscriber.hits.load(Ordering::SeqCst), 1);
        for sink in &others {
            assert_eq!(sink.hits.load(Ordering::SeqCst), 1);
        }
        assert_eq!(registry.len(), 4);

        registry.notify(&record());
        assert_eq!(others[3].hits.load(Ordering::SeqCst), 1);
        assert_eq!(others[0].hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_closed_sink_is_pruned_without_blocking_others() {
        let registry = StreamRegistry::new("class");
        let healthy = Arc::new(CountingSink::default());
        registry.subscribe(Arc::new(ClosedSink));
        registry.subscribe(healthy.clone());

        assert_eq!(registry.notify(&record()), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(healthy.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_updates_queued_behind_snapshot() {
        let registry = Arc::new(StreamRegistry::new("open"));
        let (mut sub, start) = AlarmSubscription::live(registry.clone());

        let early = record();
        registry.notify(&early);

        let existing = record();
        start.send_snapshot(vec![existing.clone()]);

        let late = record();
        registry.notify(&late);

        assert_eq!(sub.recv().await, Some(StreamEvent::Snapshot(existing)));
        assert_eq!(sub.recv().await, Some(StreamEvent::SnapshotComplete));
        assert_eq!(sub.recv().await, Some(StreamEvent::Update(early)));
        assert_eq!(sub.recv().await, Some(StreamEvent::Update(late)));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let registry = Arc::new(StreamRegistry::new("open"));
        let (sub, start) = AlarmSubscription::live(registry.clone());
        start.send_snapshot(Vec::new());
        assert_eq!(registry.len(), 1);
        drop(sub);
        assert!(registry.is_empty());

        let (sub, _start) = AlarmSubscription::live(registry.clone());
        sub.cancel();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_only_stream_ends() {
        let rows = vec![record(), record()];
        let mut sub = AlarmSubscription::snapshot(rows.clone());
        assert!(!sub.is_live());
        assert_eq!(sub.recv().await, Some(StreamEvent::Snapshot(rows[0].clone())));
        assert_eq!(sub.recv().await, Some(StreamEvent::Snapshot(rows[1].clone())));
        assert_eq!(sub.recv().await, Some(StreamEvent::SnapshotComplete));
        assert_eq!(sub.recv().await, None);
    }
}
