//! Runtime envelope for the ophid core: a topic-addressed event bus
//! with per-topic ordering, entity records with scoped permissions and
//! a sliding-window publish budget, and sessions that gate every
//! outbound publication.
//!
//! Storage engines, log sinks, and native kernels live outside this
//! crate; the runtime consumes storage through the [`Datastore`]
//! trait and emits structured `tracing` events.

mod datastore;
mod entity;
mod events;
mod runtime;
mod session;

pub use crate::{
    datastore::{Datastore, MemoryStore},
    entity::{Entity, EntityManager, ScopePermission, TopicPermission},
    events::{
        DEFAULT_DRAIN_TIMEOUT, DEFAULT_QUEUE_DEPTH, DEFAULT_WORKER_THREADS, Event, EventBusConfig, EventCategory,
        EventConsumer, EventProducer, EventSystem, TopicWriter,
    },
    runtime::Runtime,
    session::{PublishOutcome, Session},
};
