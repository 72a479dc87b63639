//! Import bookkeeping: cycle detection and the loaded-module cache.
//!
//! The mechanics of running an imported file live on the evaluator
//! (`run_import`); this module owns the state that must be shared by
//! every evaluator in one context -- which files are mid-load (the
//! cycle set) and which finished (their export tables).

use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    rc::Rc,
};

use ahash::AHashMap;
use indexmap::IndexMap;
use tracing::debug;

use crate::scope::Binding;

/// Bindings published by an imported module via `export`, in export
/// order.
pub(crate) type ModuleExports = IndexMap<String, Binding>;

/// Import failure. Every variant renders with the "failed to import"
/// prefix user code matches on.
#[derive(Debug, Clone)]
pub enum ImportError {
    /// No file found on the search paths.
    NotFound(String),
    /// The file is part of the import chain currently being loaded.
    Cycle(String),
    /// The file exists but could not be read.
    Unreadable(String, String),
    /// The file was read but failed to parse or evaluate.
    Load(String, String),
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "failed to import '{path}': not found"),
            Self::Cycle(path) => write!(f, "failed to import '{path}': import cycle"),
            Self::Unreadable(path, detail) => write!(f, "failed to import '{path}': {detail}"),
            Self::Load(path, detail) => write!(f, "failed to import '{path}': {detail}"),
        }
    }
}

impl std::error::Error for ImportError {}

/// Shared import state: the in-flight set and the finished cache,
/// keyed by canonical path.
#[derive(Debug, Default)]
pub(crate) struct ImportState {
    loading: HashSet<PathBuf>,
    cache: AHashMap<PathBuf, Rc<ModuleExports>>,
}

impl ImportState {
    /// Exports of an already-loaded module.
    pub fn cached(&self, path: &Path) -> Option<Rc<ModuleExports>> {
        self.cache.get(path).cloned()
    }

    /// Marks a module as mid-load. Returns `false` when it already is
    /// -- an import cycle.
    pub fn begin(&mut self, path: &Path) -> bool {
        self.loading.insert(path.to_path_buf())
    }

    pub fn finish(&mut self, path: &Path) {
        self.loading.remove(path);
    }

    pub fn store(&mut self, path: &Path, exports: Rc<ModuleExports>) {
        debug!(path = %path.display(), exports = exports.len(), "module loaded");
        self.cache.insert(path.to_path_buf(), exports);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_detects_reentry() {
        let mut state = ImportState::default();
        let path = Path::new("/tmp/a.sxs");
        assert!(state.begin(path));
        assert!(!state.begin(path));
        state.finish(path);
        assert!(state.begin(path));
    }

    #[test]
    fn cycle_message_names_the_failure() {
        let message = ImportError::Cycle("a.sxs".to_string()).to_string();
        assert!(message.contains("failed to import"));
    }
}
