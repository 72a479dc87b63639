//! The topic-addressed event bus.
//!
//! Categories are a small closed enum; within a category, topics are
//! `u16` identifiers. A `(category, topic)` pair maps to exactly one
//! worker thread (hash partition), and that worker drains its bounded
//! queue sequentially -- so events written to one pair are delivered
//! to every registered consumer of that topic in the order written.
//! Across topics or across writers nothing is promised.
//!
//! Back-pressure: the queues are bounded and overflow drops the event
//! with a log line rather than blocking -- a blocked producer would
//! propagate into the single-threaded evaluator. Writes after
//! `shutdown()` are dropped silently; consumers simply observe no
//! event. A panicking consumer is caught at the dispatch boundary,
//! logged, and never affects other consumers or future events.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use ophid::Value;
use parking_lot::{Mutex, RwLock};
use strum::{Display, FromRepr};
use tracing::{debug, error, warn};

/// Default per-worker queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;
/// Default worker-thread count.
pub const DEFAULT_WORKER_THREADS: usize = 4;
/// Default shutdown drain deadline.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Closed set of event categories. Values may be appended but never
/// renumbered.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    RuntimeExecutionRequest = 0,
    RuntimeBackchannelA = 1,
    RuntimeBackchannelB = 2,
}

/// One routed event.
#[derive(Debug, Clone)]
pub struct Event {
    pub category: EventCategory,
    pub topic: u16,
    pub payload: Value,
    pub producer_session_id: String,
}

/// A registered event sink.
///
/// `on_event` may run concurrently with other consumers; it is never
/// called reentrantly for the same event.
pub trait EventConsumer: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Sizing and drain parameters, with the default constants above.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub queue_depth: usize,
    pub workers: usize,
    pub drain_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            workers: DEFAULT_WORKER_THREADS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

type ConsumerMap = RwLock<AHashMap<(EventCategory, u16), Vec<Arc<dyn EventConsumer>>>>;

/// The bus: worker threads, bounded queues, consumer registry.
pub struct EventSystem {
    config: EventBusConfig,
    senders: Mutex<Option<Vec<Sender<Event>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    consumers: Arc<ConsumerMap>,
    closed: AtomicBool,
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl EventSystem {
    #[must_use]
    pub fn new(config: EventBusConfig) -> Arc<Self> {
        let workers = config.workers.max(1);
        let consumers: Arc<ConsumerMap> = Arc::new(RwLock::new(AHashMap::new()));
        let deadline = Arc::new(Mutex::new(None));

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = bounded(config.queue_depth.max(1));
            senders.push(tx);
            let consumers = Arc::clone(&consumers);
            let deadline = Arc::clone(&deadline);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("event-worker-{index}"))
                    .spawn(move || worker_loop(index, &rx, &consumers, &deadline))
                    .expect("spawn event worker"),
            );
        }

        Arc::new(Self {
            config,
            senders: Mutex::new(Some(senders)),
            workers: Mutex::new(handles),
            consumers,
            closed: AtomicBool::new(false),
            deadline,
        })
    }

    /// Producer handle for one category.
    #[must_use]
    pub fn get_event_producer_for_category(self: &Arc<Self>, category: EventCategory) -> EventProducer {
        EventProducer { system: Arc::clone(self), category }
    }

    /// Registers a consumer for `(category, topic)`. Registering `n`
    /// consumers delivers each event `n` times, once per consumer.
    pub fn register_consumer(&self, category: EventCategory, topic: u16, consumer: Arc<dyn EventConsumer>) {
        self.consumers.write().entry((category, topic)).or_default().push(consumer);
    }

    /// Routes an event to its topic worker. `false` means dropped:
    /// after shutdown, or on queue overflow.
    pub fn submit(&self, event: Event) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let senders = self.senders.lock();
        let Some(senders) = senders.as_ref() else {
            return false;
        };
        let slot = partition(event.category, event.topic, senders.len());
        match senders[slot].try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(topic = event.topic, category = %event.category, "event queue full; dropping");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Stops intake, drains queued events up to the drain deadline,
    /// and joins the workers. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("event system shutting down");
        *self.deadline.lock() = Some(Instant::now() + self.config.drain_timeout);
        // Dropping the senders lets each worker drain its remaining
        // queue and exit on disconnect.
        *self.senders.lock() = None;
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("event worker terminated abnormally");
            }
        }
    }
}

impl Drop for EventSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Writer-side handle for one category.
#[derive(Clone)]
pub struct EventProducer {
    system: Arc<EventSystem>,
    category: EventCategory,
}

impl EventProducer {
    #[must_use]
    pub fn category(&self) -> EventCategory {
        self.category
    }

    #[must_use]
    pub fn get_topic_writer_for_topic(&self, topic: u16) -> TopicWriter {
        TopicWriter {
            system: Arc::clone(&self.system),
            category: self.category,
            topic,
        }
    }
}

/// Writer-side handle for one `(category, topic)` pair.
#[derive(Clone)]
pub struct TopicWriter {
    system: Arc<EventSystem>,
    category: EventCategory,
    topic: u16,
}

impl TopicWriter {
    #[must_use]
    pub fn topic(&self) -> u16 {
        self.topic
    }

    /// Writes one event. The event's routing fields must match this
    /// writer.
    pub fn write_event(&self, event: Event) -> bool {
        debug_assert!(
            event.category == self.category && event.topic == self.topic,
            "event routed through the wrong writer"
        );
        self.system.submit(event)
    }
}

/// Stable `(category, topic) -> worker` assignment; the per-topic FIFO
/// guarantee rests on this being a function of the pair alone.
fn partition(category: EventCategory, topic: u16, workers: usize) -> usize {
    let key = (u64::from(category as u8) << 16) | u64::from(topic);
    (key % workers as u64) as usize
}

fn worker_loop(index: usize, receiver: &Receiver<Event>, consumers: &ConsumerMap, deadline: &Mutex<Option<Instant>>) {
    while let Ok(event) = receiver.recv() {
        if let Some(cutoff) = *deadline.lock() {
            if Instant::now() > cutoff {
                let mut dropped = 1;
                while receiver.try_recv().is_ok() {
                    dropped += 1;
                }
                warn!(worker = index, dropped, "drain deadline passed; discarding queued events");
                break;
            }
        }
        dispatch(consumers, &event);
    }
}

fn dispatch(consumers: &ConsumerMap, event: &Event) {
    let targets: Vec<Arc<dyn EventConsumer>> = consumers
        .read()
        .get(&(event.category, event.topic))
        .cloned()
        .unwrap_or_default();
    for consumer in targets {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| consumer.on_event(event))) {
            let detail = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(topic = event.topic, detail, "consumer panicked; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;
    use ophid::SymbolTable;

    use super::*;

    struct Collector {
        tx: Sender<(EventCategory, u16, i64)>,
    }

    impl EventConsumer for Collector {
        fn on_event(&self, event: &Event) {
            let value = event.payload.as_int().unwrap_or(-1);
            self.tx.send((event.category, event.topic, value)).ok();
        }
    }

    struct Panicker;

    impl EventConsumer for Panicker {
        fn on_event(&self, _: &Event) {
            panic!("consumer bug");
        }
    }

    fn int_event(category: EventCategory, topic: u16, value: i64) -> Event {
        let symbols = SymbolTable::new();
        Event {
            category,
            topic,
            payload: Value::create_int(value, &symbols),
            producer_session_id: "test-session".to_string(),
        }
    }

    fn small_bus() -> Arc<EventSystem> {
        EventSystem::new(EventBusConfig { queue_depth: 256, workers: 3, drain_timeout: Duration::from_secs(2) })
    }

    #[test]
    fn publish_and_consume_one_event() {
        let bus = small_bus();
        let (tx, rx) = unbounded();
        bus.register_consumer(EventCategory::RuntimeExecutionRequest, 5, Arc::new(Collector { tx }));

        let writer = bus
            .get_event_producer_for_category(EventCategory::RuntimeExecutionRequest)
            .get_topic_writer_for_topic(5);
        assert!(writer.write_event(int_event(EventCategory::RuntimeExecutionRequest, 5, 77)));

        let (category, topic, value) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(category, EventCategory::RuntimeExecutionRequest);
        assert_eq!(topic, 5);
        assert_eq!(value, 77);
    }

    #[test]
    fn fan_out_delivers_once_per_consumer() {
        let bus = small_bus();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = unbounded();
            bus.register_consumer(EventCategory::RuntimeBackchannelA, 9, Arc::new(Collector { tx }));
            receivers.push(rx);
        }
        assert!(bus.submit(int_event(EventCategory::RuntimeBackchannelA, 9, 1)));
        for rx in &receivers {
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().2, 1);
        }
    }

    #[test]
    fn one_topic_is_fifo() {
        let bus = small_bus();
        let (tx, rx) = unbounded();
        bus.register_consumer(EventCategory::RuntimeExecutionRequest, 3, Arc::new(Collector { tx }));

        for i in 0..200 {
            assert!(bus.submit(int_event(EventCategory::RuntimeExecutionRequest, 3, i)));
        }
        let mut seen = Vec::new();
        for _ in 0..200 {
            seen.push(rx.recv_timeout(Duration::from_secs(2)).unwrap().2);
        }
        let expected: Vec<i64> = (0..200).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn topics_route_independently() {
        let bus = small_bus();
        let (tx1, rx1) = unbounded();
        let (tx2, rx2) = unbounded();
        bus.register_consumer(EventCategory::RuntimeExecutionRequest, 1, Arc::new(Collector { tx: tx1 }));
        bus.register_consumer(EventCategory::RuntimeExecutionRequest, 2, Arc::new(Collector { tx: tx2 }));

        bus.submit(int_event(EventCategory::RuntimeExecutionRequest, 1, 10));
        bus.submit(int_event(EventCategory::RuntimeExecutionRequest, 2, 20));

        assert_eq!(rx1.recv_timeout(Duration::from_secs(2)).unwrap().2, 10);
        assert_eq!(rx2.recv_timeout(Duration::from_secs(2)).unwrap().2, 20);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn category_is_part_of_the_route() {
        let bus = small_bus();
        let (tx, rx) = unbounded();
        bus.register_consumer(EventCategory::RuntimeBackchannelB, 4, Arc::new(Collector { tx }));

        // Same topic id, different category: not delivered.
        bus.submit(int_event(EventCategory::RuntimeBackchannelA, 4, 1));
        bus.submit(int_event(EventCategory::RuntimeBackchannelB, 4, 2));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().2, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn consumer_panic_does_not_affect_others_or_later_events() {
        let bus = small_bus();
        let (tx, rx) = unbounded();
        bus.register_consumer(EventCategory::RuntimeExecutionRequest, 8, Arc::new(Panicker));
        bus.register_consumer(EventCategory::RuntimeExecutionRequest, 8, Arc::new(Collector { tx }));

        bus.submit(int_event(EventCategory::RuntimeExecutionRequest, 8, 1));
        bus.submit(int_event(EventCategory::RuntimeExecutionRequest, 8, 2));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().2, 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().2, 2);
    }

    #[test]
    fn shutdown_drains_then_rejects() {
        let bus = small_bus();
        let (tx, rx) = unbounded();
        bus.register_consumer(EventCategory::RuntimeExecutionRequest, 6, Arc::new(Collector { tx }));

        for i in 0..50 {
            assert!(bus.submit(int_event(EventCategory::RuntimeExecutionRequest, 6, i)));
        }
        bus.shutdown();

        // Everything queued before shutdown was drained.
        let mut seen = Vec::new();
        while let Ok(item) = rx.try_recv() {
            seen.push(item.2);
        }
        assert_eq!(seen, (0..50).collect::<Vec<i64>>());

        // Zero events are dispatched after shutdown returns.
        assert!(!bus.submit(int_event(EventCategory::RuntimeExecutionRequest, 6, 99)));
        assert!(rx.try_recv().is_err());

        // Idempotent.
        bus.shutdown();
    }

    #[test]
    fn overflow_drops_instead_of_blocking() {
        // One worker, tiny queue, and no consumer draining it.
        let bus = EventSystem::new(EventBusConfig { queue_depth: 1, workers: 1, drain_timeout: Duration::from_millis(100) });
        // Stall the worker so the queue genuinely fills.
        struct Sleeper;
        impl EventConsumer for Sleeper {
            fn on_event(&self, _: &Event) {
                std::thread::sleep(Duration::from_millis(300));
            }
        }
        bus.register_consumer(EventCategory::RuntimeExecutionRequest, 1, Arc::new(Sleeper));

        let mut accepted = 0;
        for i in 0..50 {
            if bus.submit(int_event(EventCategory::RuntimeExecutionRequest, 1, i)) {
                accepted += 1;
            }
        }
        // The writer was never blocked; some events were dropped.
        assert!(accepted < 50);
    }
}
