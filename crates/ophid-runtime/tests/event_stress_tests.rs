//! Event bus behavior under many writers and many topics.

use std::{sync::Arc, time::Duration};

use crossbeam_channel::unbounded;
use ophid::{SymbolTable, Value};
use ophid_runtime::{Event, EventBusConfig, EventCategory, EventConsumer, EventSystem};

struct Collector {
    tx: crossbeam_channel::Sender<i64>,
}

impl EventConsumer for Collector {
    fn on_event(&self, event: &Event) {
        self.tx.send(event.payload.as_int().unwrap_or(-1)).ok();
    }
}

fn int_event(topic: u16, value: i64, session: &str) -> Event {
    Event {
        category: EventCategory::RuntimeExecutionRequest,
        topic,
        payload: Value::create_int(value, &SymbolTable::new()),
        producer_session_id: session.to_string(),
    }
}

#[test]
fn per_writer_order_is_preserved_on_one_topic() {
    let bus = EventSystem::new(EventBusConfig { queue_depth: 8192, workers: 4, ..EventBusConfig::default() });
    let (tx, rx) = unbounded();
    bus.register_consumer(EventCategory::RuntimeExecutionRequest, 1, Arc::new(Collector { tx }));

    const WRITERS: i64 = 4;
    const PER_WRITER: i64 = 250;
    std::thread::scope(|scope| {
        for writer in 0..WRITERS {
            let writer_handle = bus
                .get_event_producer_for_category(EventCategory::RuntimeExecutionRequest)
                .get_topic_writer_for_topic(1);
            scope.spawn(move || {
                for seq in 0..PER_WRITER {
                    // Encode (writer, seq) into the payload.
                    let value = writer * 10_000 + seq;
                    while !writer_handle.write_event(int_event(1, value, "stress")) {
                        // Bounded queue: back off instead of losing the
                        // ordering sample.
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            });
        }
    });

    let mut seen = Vec::new();
    for _ in 0..WRITERS * PER_WRITER {
        seen.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    // Per writer, sequence numbers must arrive monotonically.
    for writer in 0..WRITERS {
        let sequence: Vec<i64> = seen.iter().filter(|v| *v / 10_000 == writer).map(|v| v % 10_000).collect();
        assert_eq!(sequence.len(), PER_WRITER as usize);
        assert!(sequence.windows(2).all(|w| w[0] < w[1]), "writer {writer} reordered");
    }
}

#[test]
fn topics_process_in_parallel_without_cross_talk() {
    let bus = EventSystem::new(EventBusConfig { queue_depth: 4096, workers: 4, ..EventBusConfig::default() });

    const TOPICS: u16 = 8;
    const PER_TOPIC: i64 = 100;
    let mut receivers = Vec::new();
    for topic in 0..TOPICS {
        let (tx, rx) = unbounded();
        bus.register_consumer(EventCategory::RuntimeExecutionRequest, topic, Arc::new(Collector { tx }));
        receivers.push((topic, rx));
    }

    std::thread::scope(|scope| {
        for topic in 0..TOPICS {
            let bus = Arc::clone(&bus);
            scope.spawn(move || {
                for seq in 0..PER_TOPIC {
                    while !bus.submit(int_event(topic, seq, "stress")) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            });
        }
    });

    for (topic, rx) in receivers {
        let mut seen = Vec::new();
        for _ in 0..PER_TOPIC {
            seen.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        let expected: Vec<i64> = (0..PER_TOPIC).collect();
        assert_eq!(seen, expected, "topic {topic} lost or reordered events");
    }
}

#[test]
fn consumers_registered_mid_stream_only_see_later_events() {
    let bus = EventSystem::new(EventBusConfig::default());
    let (tx, rx) = unbounded();

    bus.submit(int_event(2, 1, "early"));
    // Give the worker a moment to dispatch into the void.
    std::thread::sleep(Duration::from_millis(100));

    bus.register_consumer(EventCategory::RuntimeExecutionRequest, 2, Arc::new(Collector { tx }));
    bus.submit(int_event(2, 2, "late"));

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
    assert!(rx.try_recv().is_err());
}
