//! The runtime envelope: one datastore, one entity registry, one
//! event system, and session construction over them.

use std::sync::Arc;

use crate::{
    datastore::Datastore,
    entity::{Entity, EntityManager},
    events::{EventBusConfig, EventSystem},
    session::Session,
};

/// Owner of the runtime's shared services.
///
/// Teardown order matters: the event bus drains before anything else
/// drops, which `shutdown` (and `Drop` on the bus) guarantees.
pub struct Runtime {
    datastore: Arc<dyn Datastore>,
    entities: EntityManager,
    events: Arc<EventSystem>,
}

impl Runtime {
    #[must_use]
    pub fn new(datastore: Arc<dyn Datastore>, config: EventBusConfig) -> Self {
        Self {
            entities: EntityManager::new(Arc::clone(&datastore)),
            events: EventSystem::new(config),
            datastore,
        }
    }

    #[must_use]
    pub fn entities(&self) -> &EntityManager {
        &self.entities
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventSystem> {
        &self.events
    }

    #[must_use]
    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    /// Opens a session for `entity_id`. Sessions of one entity share
    /// its record, and with it the rate window.
    #[must_use]
    pub fn open_session(&self, session_id: &str, entity_id: &str, scope_name: &str) -> Session {
        let entity: Arc<Entity> = self.entities.get_or_create(entity_id);
        Session::new(
            session_id,
            entity,
            scope_name,
            Arc::clone(&self.datastore),
            Arc::clone(&self.events),
        )
    }

    /// Drains and stops the event system.
    pub fn shutdown(&self) {
        self.events.shutdown();
    }
}
