//! Filesystem access through immutable views
//!
//! Builders never touch `std::fs` directly: they read through an `FsView`
//! obtained from a `Filesystem`, so the scheduler can overlay unsaved drafts
//! and tests can run entirely in memory.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

/// Immutable snapshot of file contents
pub trait FsView: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Arc<str>>;

    fn exists(&self, path: &Path) -> bool {
        self.read(path).is_ok()
    }
}

/// Source of filesystem views
pub trait Filesystem: Send + Sync {
    /// A view no older than `timestamp` (`None`: any reasonably fresh view).
    fn view(&self, timestamp: Option<SystemTime>) -> Arc<dyn FsView>;
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found", path.display()),
    )
}

// ============================================================================
// Disk
// ============================================================================

/// Reads straight from disk
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFilesystem;

impl FsView for RealFilesystem {
    fn read(&self, path: &Path) -> io::Result<Arc<str>> {
        Ok(Arc::from(fs::read_to_string(path)?))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

impl Filesystem for RealFilesystem {
    fn view(&self, _timestamp: Option<SystemTime>) -> Arc<dyn FsView> {
        Arc::new(RealFilesystem)
    }
}

// ============================================================================
// Memory
// ============================================================================

type FileMap = HashMap<PathBuf, Arc<str>>;

/// In-memory filesystem; views are copy-on-write snapshots
#[derive(Debug, Default)]
pub struct MemoryFilesystem {
    files: RwLock<Arc<FileMap>>,
}

#[derive(Debug)]
struct MemoryView(Arc<FileMap>);

impl FsView for MemoryView {
    fn read(&self, path: &Path) -> io::Result<Arc<str>> {
        self.0.get(path).cloned().ok_or_else(|| not_found(path))
    }

    fn exists(&self, path: &Path) -> bool {
        self.0.contains_key(path)
    }
}

impl MemoryFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: impl Into<PathBuf>, contents: &str) {
        let mut files = self.files.write();
        Arc::make_mut(&mut *files).insert(path.into(), Arc::from(contents));
    }

    pub fn remove(&self, path: &Path) -> bool {
        let mut files = self.files.write();
        Arc::make_mut(&mut *files).remove(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl Filesystem for MemoryFilesystem {
    fn view(&self, _timestamp: Option<SystemTime>) -> Arc<dyn FsView> {
        Arc::new(MemoryView(Arc::clone(&*self.files.read())))
    }
}
