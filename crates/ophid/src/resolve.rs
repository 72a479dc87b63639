//! Filesystem resolution shared by the kernel loader and the import
//! manager.
//!
//! Resolution order is the same for both: an absolute path is taken
//! as-is, then each include path is tried in order, then the working
//! directory. A kernel resolves to a directory that contains a
//! `kernel.sxs` manifest; an import resolves to a source file.

use std::path::{Path, PathBuf};

/// Name of the manifest file that validates a kernel directory.
pub const KERNEL_MANIFEST: &str = "kernel.sxs";

/// Search roots for kernels and imports.
#[derive(Debug, Clone)]
pub struct SourcePaths {
    pub include_paths: Vec<PathBuf>,
    pub working_dir: PathBuf,
}

impl Default for SourcePaths {
    fn default() -> Self {
        Self {
            include_paths: Vec::new(),
            working_dir: PathBuf::from("."),
        }
    }
}

impl SourcePaths {
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self { include_paths: Vec::new(), working_dir: working_dir.into() }
    }

    #[must_use]
    pub fn with_include_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.include_paths = paths;
        self
    }

    /// Resolves a source file: absolute path, include paths, working
    /// directory.
    #[must_use]
    pub fn resolve_file(&self, path: &str) -> Option<PathBuf> {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        for root in &self.include_paths {
            let joined = root.join(candidate);
            if joined.is_file() {
                return Some(joined);
            }
        }
        let joined = self.working_dir.join(candidate);
        joined.is_file().then_some(joined)
    }

    /// Resolves a kernel directory, validated by the presence of
    /// `kernel.sxs` inside it.
    #[must_use]
    pub fn resolve_kernel_dir(&self, name: &str) -> Option<PathBuf> {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            return candidate.join(KERNEL_MANIFEST).is_file().then(|| candidate.to_path_buf());
        }
        for root in &self.include_paths {
            let dir = root.join(candidate);
            if dir.join(KERNEL_MANIFEST).is_file() {
                return Some(dir);
            }
        }
        let dir = self.working_dir.join(candidate);
        dir.join(KERNEL_MANIFEST).is_file().then_some(dir)
    }
}
