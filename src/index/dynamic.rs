//! Dynamic tier: symbols of the files open in this process
//!
//! Each open file owns two slabs, replaced wholesale:
//! - preamble slab - symbols from the headers its preamble included
//! - main slab - declarations and references of the main file
//!
//! A file update therefore never leaves entries of an older version behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::snapshot::{FileSlab, SnapshotCell};
use super::{FuzzyFindRequest, IndexEntry, SymbolIndex, Tier, TierSnapshot};
use crate::ast::ParsedAst;
use crate::memory::MemoryTree;
use crate::preamble::Preamble;
use crate::schema::{now_millis, Ref, SymbolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum SlabKind {
    Preamble,
    Main,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SlabKey {
    path: PathBuf,
    kind: SlabKind,
}

/// Index of open files
#[derive(Debug, Default)]
pub struct FileIndex {
    slabs: Mutex<HashMap<SlabKey, FileSlab>>,
    published: SnapshotCell,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the header symbols of `path`
    pub fn update_preamble(&self, path: &Path, preamble: &Preamble) {
        let slab = FileSlab {
            symbols: preamble.symbols.clone(),
            refs: Vec::new(),
            timestamp: now_millis(),
            owns_refs: false,
        };
        tracing::debug!(
            "Dynamic index: {} preamble symbols for {} (version {})",
            slab.symbols.len(),
            path.display(),
            preamble.version
        );
        self.replace(path, SlabKind::Preamble, slab);
    }

    /// Replace the main-file symbols and references of `path`
    pub fn update_main(&self, path: &Path, ast: &ParsedAst) {
        let slab = FileSlab {
            symbols: ast.symbols.clone(),
            refs: ast.refs.clone(),
            timestamp: now_millis(),
            owns_refs: true,
        };
        tracing::debug!(
            "Dynamic index: {} symbols, {} refs for {} (version {})",
            slab.symbols.len(),
            slab.refs.len(),
            path.display(),
            ast.version
        );
        self.replace(path, SlabKind::Main, slab);
    }

    pub fn remove_file(&self, path: &Path) {
        let mut slabs = self.slabs.lock();
        let before = slabs.len();
        slabs.retain(|key, _| key.path != path);
        if slabs.len() != before {
            self.publish(&slabs);
        }
    }

    pub fn files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.slabs.lock().keys().map(|k| k.path.clone()).collect();
        files.sort();
        files.dedup();
        files
    }

    pub fn snapshot(&self) -> std::sync::Arc<TierSnapshot> {
        self.published.load()
    }

    fn replace(&self, path: &Path, kind: SlabKind, slab: FileSlab) {
        let key = SlabKey {
            path: path.to_path_buf(),
            kind,
        };
        let mut slabs = self.slabs.lock();
        slabs.insert(key, slab);
        self.publish(&slabs);
    }

    /// Caller holds the slab lock, so publishes are ordered
    fn publish(&self, slabs: &HashMap<SlabKey, FileSlab>) {
        self.published.publish(TierSnapshot::build(Tier::Dynamic, slabs, |k: &SlabKey| {
            Some(k.path.as_path())
        }));
    }
}

impl SymbolIndex for FileIndex {
    fn tier(&self) -> Tier {
        Tier::Dynamic
    }

    fn lookup(&self, ids: &[SymbolId]) -> Vec<IndexEntry> {
        self.snapshot().lookup(ids)
    }

    fn fuzzy_find(&self, request: &FuzzyFindRequest) -> Vec<IndexEntry> {
        self.snapshot().fuzzy_find(request)
    }

    fn refs(&self, ids: &[SymbolId]) -> Vec<Ref> {
        self.snapshot().refs(ids)
    }

    fn indexes_file(&self, path: &Path) -> bool {
        self.snapshot().indexes_file(path)
    }

    fn profile(&self, tree: &mut MemoryTree) {
        tree.add_usage(self.snapshot().estimated_bytes());
    }
}
