//! Sessions: the per-request envelope that gates all outbound
//! publications.
//!
//! A session wraps the acting entity, its scope, and access to the
//! datastore and event system. `publish_event` is the single gate:
//! topic permission, then one token from the entity's sliding window,
//! then the bus. Permission and rate failures are return values, not
//! errors -- callers routinely retry or drop.

use std::sync::Arc;

use ophid::Value;
use strum::Display;
use tracing::debug;

use crate::{
    datastore::Datastore,
    entity::Entity,
    events::{Event, EventCategory, EventConsumer, EventSystem},
};

/// Result of a gated session operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishOutcome {
    Ok,
    PermissionDenied,
    RateLimitExceeded,
}

/// A transient per-request envelope. Nothing here persists.
pub struct Session {
    id: String,
    entity: Arc<Entity>,
    scope_name: String,
    datastore: Arc<dyn Datastore>,
    events: Arc<EventSystem>,
}

impl Session {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        entity: Arc<Entity>,
        scope_name: impl Into<String>,
        datastore: Arc<dyn Datastore>,
        events: Arc<EventSystem>,
    ) -> Self {
        Self {
            id: id.into(),
            entity,
            scope_name: scope_name.into(),
            datastore,
            events,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    #[must_use]
    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    #[must_use]
    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    /// Publishes `payload` on `(category, topic)` on behalf of the
    /// entity.
    ///
    /// Checks, in order: topic permission (`PUB` or `PUBSUB`), then
    /// the entity's rate window. Only when both pass does the event
    /// reach the bus.
    #[must_use]
    pub fn publish_event(&self, category: EventCategory, topic: u16, payload: Value) -> PublishOutcome {
        if !self.entity.may_publish(topic) {
            debug!(session = self.id.as_str(), topic, "publish denied");
            return PublishOutcome::PermissionDenied;
        }
        if !self.entity.try_publish() {
            debug!(session = self.id.as_str(), topic, "publish rate limited");
            return PublishOutcome::RateLimitExceeded;
        }
        let writer = self
            .events
            .get_event_producer_for_category(category)
            .get_topic_writer_for_topic(topic);
        writer.write_event(Event {
            category,
            topic,
            payload,
            producer_session_id: self.id.clone(),
        });
        PublishOutcome::Ok
    }

    /// Subscribes a consumer on behalf of the entity; requires `SUB`
    /// or `PUBSUB` on the topic.
    #[must_use]
    pub fn subscribe(&self, category: EventCategory, topic: u16, consumer: Arc<dyn EventConsumer>) -> PublishOutcome {
        if !self.entity.may_subscribe(topic) {
            debug!(session = self.id.as_str(), topic, "subscribe denied");
            return PublishOutcome::PermissionDenied;
        }
        self.events.register_consumer(category, topic, consumer);
        PublishOutcome::Ok
    }
}
