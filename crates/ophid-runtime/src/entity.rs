//! Entities: per-user identity, permissions, and the sliding-window
//! publish budget.
//!
//! All concurrent sessions for one entity share one `Arc<Entity>` --
//! the [`EntityManager`] interns them by id -- so the rate window is a
//! single budget no matter how many sessions race on it. The window
//! update is atomic with respect to those sessions: check and record
//! happen under one per-entity lock. Distinct entities are fully
//! independent.
//!
//! Persisted fields (id, max rps, permissions) go through the
//! [`Datastore`] under `entity/<id>/<field-index>` keys, encoded with
//! postcard. Sessions and the rate window itself are transient.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Instant,
};

use ahash::AHashMap;
use parking_lot::Mutex;
use strum::Display;
use tracing::warn;

use crate::datastore::Datastore;

/// One second, in the monotonic nanoseconds the window is kept in.
const WINDOW_NS: u64 = 1_000_000_000;

/// Field indices under `entity/<id>/`.
const FIELD_MAX_RPS: u8 = 0;
const FIELD_SCOPE_PERMISSIONS: u8 = 1;
const FIELD_TOPIC_PERMISSIONS: u8 = 2;

/// Access level on a named scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopePermission {
    Read,
    ReadWrite,
}

/// Access level on an event topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TopicPermission {
    Sub,
    Pub,
    PubSub,
}

impl TopicPermission {
    #[must_use]
    pub fn allows_publish(self) -> bool {
        matches!(self, Self::Pub | Self::PubSub)
    }

    #[must_use]
    pub fn allows_subscribe(self) -> bool {
        matches!(self, Self::Sub | Self::PubSub)
    }
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct Permissions {
    scopes: BTreeMap<String, ScopePermission>,
    topics: BTreeMap<u16, TopicPermission>,
}

#[derive(Debug)]
struct EntityState {
    /// 0 means unlimited.
    max_rps: u32,
    permissions: Permissions,
    /// Monotonic timestamps (ns since the entity's epoch) of recent
    /// successful publishes; never longer than `max_rps`.
    window: VecDeque<u64>,
}

/// A persisted actor: identity, permissions, publish budget.
#[derive(Debug)]
pub struct Entity {
    id: String,
    epoch: Instant,
    state: Mutex<EntityState>,
}

impl Entity {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            epoch: Instant::now(),
            state: Mutex::new(EntityState {
                max_rps: 0,
                permissions: Permissions::default(),
                window: VecDeque::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn max_rps(&self) -> u32 {
        self.state.lock().max_rps
    }

    pub fn set_max_rps(&self, max_rps: u32) {
        let mut state = self.state.lock();
        state.max_rps = max_rps;
        state.window.clear();
    }

    #[must_use]
    pub fn scope_permission(&self, scope: &str) -> Option<ScopePermission> {
        self.state.lock().permissions.scopes.get(scope).copied()
    }

    pub fn set_scope_permission(&self, scope: &str, permission: ScopePermission) {
        self.state.lock().permissions.scopes.insert(scope.to_string(), permission);
    }

    #[must_use]
    pub fn topic_permission(&self, topic: u16) -> Option<TopicPermission> {
        self.state.lock().permissions.topics.get(&topic).copied()
    }

    pub fn set_topic_permission(&self, topic: u16, permission: TopicPermission) {
        self.state.lock().permissions.topics.insert(topic, permission);
    }

    /// Publication requires `PUB` or `PUBSUB` on the topic.
    #[must_use]
    pub fn may_publish(&self, topic: u16) -> bool {
        self.topic_permission(topic).is_some_and(TopicPermission::allows_publish)
    }

    /// Subscription requires `SUB` or `PUBSUB` on the topic.
    #[must_use]
    pub fn may_subscribe(&self, topic: u16) -> bool {
        self.topic_permission(topic).is_some_and(TopicPermission::allows_subscribe)
    }

    /// Tries to consume one token from the sliding one-second window.
    ///
    /// Check and record are one critical section, so concurrent
    /// sessions of this entity cannot overshoot the budget between
    /// them.
    #[must_use]
    pub fn try_publish(&self) -> bool {
        let now = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let mut state = self.state.lock();
        if state.max_rps == 0 {
            return true;
        }
        let horizon = now.saturating_sub(WINDOW_NS);
        while state.window.front().is_some_and(|&t| t <= horizon) {
            state.window.pop_front();
        }
        if state.window.len() < state.max_rps as usize {
            state.window.push_back(now);
            true
        } else {
            false
        }
    }

    /// Persists the durable fields. Returns `false` when any write was
    /// rejected.
    #[must_use]
    pub fn save(&self, store: &dyn Datastore) -> bool {
        let state = self.state.lock();
        let Ok(scopes) = postcard::to_allocvec(&state.permissions.scopes) else {
            return false;
        };
        let Ok(topics) = postcard::to_allocvec(&state.permissions.topics) else {
            return false;
        };
        let rps = state.max_rps.to_le_bytes();
        drop(state);
        store.put(&self.field_key(FIELD_MAX_RPS), &rps)
            && store.put(&self.field_key(FIELD_SCOPE_PERMISSIONS), &scopes)
            && store.put(&self.field_key(FIELD_TOPIC_PERMISSIONS), &topics)
    }

    fn hydrate(&self, store: &dyn Datastore) {
        let mut state = self.state.lock();
        if let Some(raw) = store.get(&self.field_key(FIELD_MAX_RPS)) {
            match raw.try_into() {
                Ok(bytes) => state.max_rps = u32::from_le_bytes(bytes),
                Err(_) => warn!(entity = self.id.as_str(), "discarding malformed max-rps record"),
            }
        }
        if let Some(raw) = store.get(&self.field_key(FIELD_SCOPE_PERMISSIONS)) {
            match postcard::from_bytes(&raw) {
                Ok(scopes) => state.permissions.scopes = scopes,
                Err(_) => warn!(entity = self.id.as_str(), "discarding malformed scope permissions"),
            }
        }
        if let Some(raw) = store.get(&self.field_key(FIELD_TOPIC_PERMISSIONS)) {
            match postcard::from_bytes(&raw) {
                Ok(topics) => state.permissions.topics = topics,
                Err(_) => warn!(entity = self.id.as_str(), "discarding malformed topic permissions"),
            }
        }
    }

    fn field_key(&self, field: u8) -> String {
        format!("entity/{}/{}", self.id, field)
    }
}

/// Interns entities by id so every session for one id shares one
/// record (and therefore one rate window).
pub struct EntityManager {
    store: Arc<dyn Datastore>,
    cache: Mutex<AHashMap<String, Arc<Entity>>>,
}

impl EntityManager {
    #[must_use]
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store, cache: Mutex::new(AHashMap::new()) }
    }

    /// The entity for `id`, hydrated from storage on first access.
    #[must_use]
    pub fn get_or_create(&self, id: &str) -> Arc<Entity> {
        let mut cache = self.cache.lock();
        if let Some(entity) = cache.get(id) {
            return Arc::clone(entity);
        }
        let entity = Arc::new(Entity::new(id));
        entity.hydrate(self.store.as_ref());
        cache.insert(id.to_string(), Arc::clone(&entity));
        entity
    }

    /// Persists an entity through the manager's datastore.
    #[must_use]
    pub fn save(&self, entity: &Entity) -> bool {
        entity.save(self.store.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::datastore::MemoryStore;

    fn manager() -> EntityManager {
        EntityManager::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn default_rps_is_unlimited() {
        let entity = manager().get_or_create("user1");
        assert_eq!(entity.max_rps(), 0);
        for _ in 0..1000 {
            assert!(entity.try_publish());
        }
    }

    #[test]
    fn set_and_get_max_rps() {
        let entity = manager().get_or_create("user2");
        entity.set_max_rps(100);
        assert_eq!(entity.max_rps(), 100);
        entity.set_max_rps(0);
        assert_eq!(entity.max_rps(), 0);
    }

    #[test]
    fn budget_is_enforced_within_the_window() {
        let entity = manager().get_or_create("user3");
        entity.set_max_rps(5);
        for _ in 0..5 {
            assert!(entity.try_publish());
        }
        assert!(!entity.try_publish());
        assert!(!entity.try_publish());
    }

    #[test]
    fn window_slides_after_a_second() {
        let entity = manager().get_or_create("user4");
        entity.set_max_rps(2);
        assert!(entity.try_publish());
        assert!(entity.try_publish());
        assert!(!entity.try_publish());
        std::thread::sleep(Duration::from_millis(1100));
        assert!(entity.try_publish());
    }

    #[test]
    fn fields_persist_through_the_store() {
        let store: Arc<dyn Datastore> = Arc::new(MemoryStore::new());
        {
            let manager = EntityManager::new(Arc::clone(&store));
            let entity = manager.get_or_create("persistent");
            entity.set_max_rps(200);
            entity.set_scope_permission("main", ScopePermission::ReadWrite);
            entity.set_topic_permission(7, TopicPermission::PubSub);
            assert!(manager.save(&entity));
        }
        // A fresh manager (fresh cache) hydrates from storage.
        let manager = EntityManager::new(store);
        let entity = manager.get_or_create("persistent");
        assert_eq!(entity.max_rps(), 200);
        assert_eq!(entity.scope_permission("main"), Some(ScopePermission::ReadWrite));
        assert_eq!(entity.topic_permission(7), Some(TopicPermission::PubSub));
        assert_eq!(entity.scope_permission("other"), None);
    }

    #[test]
    fn sessions_share_the_entity_record() {
        let manager = manager();
        let a = manager.get_or_create("shared");
        let b = manager.get_or_create("shared");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn topic_permissions_gate_directionally() {
        let entity = manager().get_or_create("gates");
        entity.set_topic_permission(1, TopicPermission::Sub);
        entity.set_topic_permission(2, TopicPermission::Pub);
        entity.set_topic_permission(3, TopicPermission::PubSub);

        assert!(!entity.may_publish(1));
        assert!(entity.may_subscribe(1));
        assert!(entity.may_publish(2));
        assert!(!entity.may_subscribe(2));
        assert!(entity.may_publish(3));
        assert!(entity.may_subscribe(3));
        assert!(!entity.may_publish(99));
    }

    #[test]
    fn concurrent_sessions_never_overshoot_the_budget() {
        let manager = manager();
        let entity = manager.get_or_create("racer");
        entity.set_max_rps(10);

        let successes: Vec<_> = std::thread::scope(|scope| {
            (0..4)
                .map(|_| {
                    let entity = Arc::clone(&entity);
                    scope.spawn(move || (0..8).filter(|_| entity.try_publish()).count())
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        assert_eq!(successes.iter().sum::<usize>(), 10);
    }
}
