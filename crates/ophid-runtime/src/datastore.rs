//! The key/value interface the runtime persists through.
//!
//! Storage engines live out of tree; the runtime only consumes this
//! trait. [`MemoryStore`] backs tests and embedders that do not
//! persist.

use std::collections::BTreeMap;

use parking_lot::RwLock;

/// Minimal key/value surface: `put`, `get`, `exists`, `del`, and
/// ordered prefix iteration.
pub trait Datastore: Send + Sync {
    /// Stores `value` under `key`, replacing any previous value.
    /// Returns `false` when the engine rejected the write.
    fn put(&self, key: &str, value: &[u8]) -> bool;

    fn get(&self, key: &str) -> Option<Vec<u8>>;

    fn exists(&self, key: &str) -> bool;

    /// Removes `key`; `false` when it was not present.
    fn del(&self, key: &str) -> bool;

    /// Calls `callback` for every key with the given prefix, in key
    /// order, until it returns `false`.
    fn iterate(&self, prefix: &str, callback: &mut dyn FnMut(&str, &[u8]) -> bool);
}

/// In-memory datastore.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Datastore for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> bool {
        self.inner.write().insert(key.to_string(), value.to_vec());
        true
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.read().get(key).cloned()
    }

    fn exists(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    fn del(&self, key: &str) -> bool {
        self.inner.write().remove(key).is_some()
    }

    fn iterate(&self, prefix: &str, callback: &mut dyn FnMut(&str, &[u8]) -> bool) {
        let inner = self.inner.read();
        for (key, value) in inner.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if !callback(key, value) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_exists_del() {
        let store = MemoryStore::new();
        assert!(!store.exists("k"));
        assert!(store.put("k", b"v"));
        assert!(store.exists("k"));
        assert_eq!(store.get("k").as_deref(), Some(b"v".as_slice()));
        assert!(store.del("k"));
        assert!(!store.del("k"));
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn iterate_walks_the_prefix_in_order() {
        let store = MemoryStore::new();
        store.put("entity/a/0", b"1");
        store.put("entity/a/1", b"2");
        store.put("entity/b/0", b"3");
        store.put("other", b"4");

        let mut seen = Vec::new();
        store.iterate("entity/a/", &mut |key, _| {
            seen.push(key.to_string());
            true
        });
        assert_eq!(seen, vec!["entity/a/0".to_string(), "entity/a/1".to_string()]);

        let mut count = 0;
        store.iterate("entity/", &mut |_, _| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
    }
}
