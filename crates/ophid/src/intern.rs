//! Symbol interning for the value store.
//!
//! Every symbol that appears in a program is stored once in a shared,
//! append-only table and referenced by a `SymbolId`. Values carry an
//! `Arc<SymbolTable>` next to their store buffer, so two values built
//! against the same table compare symbols by id without touching the
//! string data.
//!
//! The table is internally synchronized: event payloads cross threads,
//! and evaluator primitives may intern new symbols while older values
//! still hold the table. Ids are never reused and existing entries are
//! never mutated, so readers only ever race against appends.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

/// Index into the symbol table's storage.
///
/// Uses `u32` to keep unit payloads small; ~4 billion unique symbols is
/// far beyond anything a program can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SymbolId(u32);

impl SymbolId {
    /// Reconstructs an id from a raw store payload.
    ///
    /// The caller is responsible for the id having come out of the same
    /// table it will be resolved against.
    #[inline]
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Default)]
struct TableInner {
    names: Vec<Arc<str>>,
    lookup: AHashMap<Arc<str>, u32>,
}

/// Shared append-only symbol table.
///
/// Handed around as `Arc<SymbolTable>`; see the module docs for the
/// synchronization contract.
#[derive(Debug, Default)]
pub struct SymbolTable {
    inner: RwLock<TableInner>,
}

impl SymbolTable {
    /// Creates an empty shared table.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Interns `name`, returning the existing id if it is already present.
    pub fn intern(&self, name: &str) -> SymbolId {
        if let Some(id) = self.inner.read().lookup.get(name) {
            return SymbolId(*id);
        }
        let mut inner = self.inner.write();
        // Double-checked: another thread may have interned between locks.
        if let Some(id) = inner.lookup.get(name) {
            return SymbolId(*id);
        }
        let id = u32::try_from(inner.names.len()).expect("symbol table overflow");
        let entry: Arc<str> = Arc::from(name);
        inner.names.push(Arc::clone(&entry));
        inner.lookup.insert(entry, id);
        SymbolId(id)
    }

    /// Resolves an id to its symbol text.
    ///
    /// Returns `None` for ids that were never handed out by this table.
    #[must_use]
    pub fn resolve(&self, id: SymbolId) -> Option<Arc<str>> {
        self.inner.read().names.get(id.0 as usize).cloned()
    }

    /// Returns the id for `name` without interning it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<SymbolId> {
        self.inner.read().lookup.get(name).copied().map(SymbolId)
    }

    /// Number of interned symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    /// True when no symbols have been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let table = SymbolTable::new();
        let a = table.intern("def");
        let b = table.intern("def");
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn resolve_round_trips() {
        let table = SymbolTable::new();
        let id = table.intern("kernel/name");
        assert_eq!(table.resolve(id).as_deref(), Some("kernel/name"));
        assert_eq!(table.get("kernel/name"), Some(id));
        assert_eq!(table.get("missing"), None);
    }

    #[test]
    fn ids_are_stable_across_threads() {
        let table = SymbolTable::new();
        let id = table.intern("shared");
        let t2 = Arc::clone(&table);
        let handle = std::thread::spawn(move || t2.intern("shared"));
        assert_eq!(handle.join().unwrap(), id);
    }
}
