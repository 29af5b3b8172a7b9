//! Open-file drafts and the filesystem overlay that exposes them
//!
//! The draft store keeps only the latest version of each open file.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::fs::{Filesystem, FsView};

/// Latest contents of an open file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub version: String,
    pub contents: Arc<str>,
}

#[derive(Debug, Default)]
struct DraftSlot {
    draft: Option<Draft>,
    /// Counter used when the editor supplies no version
    auto_version: u64,
}

/// Versioned map of open file → (version, contents)
#[derive(Debug, Default)]
pub struct DraftStore {
    drafts: Mutex<HashMap<PathBuf, DraftSlot>>,
}

impl DraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new draft, replacing any previous one.
    ///
    /// An empty `version` is replaced by the next per-file counter value.
    /// Returns the version actually stored.
    pub fn add_draft(&self, path: &Path, version: &str, contents: &str) -> String {
        let mut drafts = self.drafts.lock();
        let slot = drafts.entry(path.to_path_buf()).or_default();
        let version = if version.is_empty() {
            slot.auto_version += 1;
            slot.auto_version.to_string()
        } else {
            version.to_string()
        };
        slot.draft = Some(Draft {
            version: version.clone(),
            contents: Arc::from(contents),
        });
        version
    }

    pub fn get_draft(&self, path: &Path) -> Option<Draft> {
        self.drafts.lock().get(path).and_then(|s| s.draft.clone())
    }

    pub fn remove_draft(&self, path: &Path) -> bool {
        match self.drafts.lock().get_mut(path) {
            // Keep the counter so a reopened file keeps increasing versions
            Some(slot) => slot.draft.take().is_some(),
            None => false,
        }
    }

    /// Paths of all open files, sorted
    pub fn active_files(&self) -> Vec<PathBuf> {
        let drafts = self.drafts.lock();
        let mut files: Vec<PathBuf> = drafts
            .iter()
            .filter(|(_, s)| s.draft.is_some())
            .map(|(p, _)| p.clone())
            .collect();
        files.sort();
        files
    }

    fn snapshot(&self) -> HashMap<PathBuf, Arc<str>> {
        self.drafts
            .lock()
            .iter()
            .filter_map(|(p, s)| s.draft.as_ref().map(|d| (p.clone(), Arc::clone(&d.contents))))
            .collect()
    }
}

// ============================================================================
// Overlay filesystem
// ============================================================================

/// Filesystem where open drafts shadow the underlying files
pub struct DraftOverlayFs {
    base: Arc<dyn Filesystem>,
    drafts: Arc<DraftStore>,
}

struct OverlayView {
    drafts: HashMap<PathBuf, Arc<str>>,
    base: Arc<dyn FsView>,
}

impl FsView for OverlayView {
    fn read(&self, path: &Path) -> io::Result<Arc<str>> {
        match self.drafts.get(path) {
            Some(contents) => Ok(Arc::clone(contents)),
            None => self.base.read(path),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.drafts.contains_key(path) || self.base.exists(path)
    }
}

impl DraftOverlayFs {
    pub fn new(base: Arc<dyn Filesystem>, drafts: Arc<DraftStore>) -> Self {
        Self { base, drafts }
    }
}

impl Filesystem for DraftOverlayFs {
    fn view(&self, timestamp: Option<SystemTime>) -> Arc<dyn FsView> {
        Arc::new(OverlayView {
            drafts: self.drafts.snapshot(),
            base: self.base.view(timestamp),
        })
    }
}
