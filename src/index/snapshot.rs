//! Immutable tier snapshots and the cell they are published through

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{FuzzyFindRequest, IndexEntry, Tier};
use crate::schema::{Ref, Symbol, SymbolId};

/// Everything one source contributed to a tier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSlab {
    pub symbols: Vec<Symbol>,
    pub refs: Vec<Ref>,
    pub timestamp: u64,
    /// Whether `refs` cover the slab's file completely
    pub owns_refs: bool,
}

impl FileSlab {
    pub fn estimated_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.symbols.iter().map(Symbol::estimated_bytes).sum::<usize>()
            + self.refs.len() * std::mem::size_of::<Ref>()
    }
}

/// Read-optimised view of a whole tier at one point in time
#[derive(Debug, Default)]
pub struct TierSnapshot {
    entries: HashMap<SymbolId, IndexEntry>,
    refs: HashMap<SymbolId, Vec<Ref>>,
    indexed_files: HashSet<PathBuf>,
    bytes: usize,
}

impl TierSnapshot {
    /// Build from slabs keyed by an ordered key; within the tier the newest
    /// timestamp wins, the first key on equal timestamps
    pub fn build<'a, K: 'a + Ord>(
        tier: Tier,
        slabs: impl IntoIterator<Item = (&'a K, &'a FileSlab)>,
        file_of: impl Fn(&K) -> Option<&Path>,
    ) -> Self {
        let mut snapshot = Self::default();
        let ordered: BTreeMap<&K, &FileSlab> = slabs.into_iter().collect();
        for (key, slab) in ordered {
            snapshot.bytes += slab.estimated_bytes();
            for symbol in &slab.symbols {
                match snapshot.entries.get(&symbol.id) {
                    Some(existing) if existing.timestamp >= slab.timestamp => {}
                    _ => {
                        snapshot.entries.insert(
                            symbol.id.clone(),
                            IndexEntry {
                                symbol: symbol.clone(),
                                tier,
                                timestamp: slab.timestamp,
                            },
                        );
                    }
                }
            }
            for r in &slab.refs {
                snapshot.refs.entry(r.symbol.clone()).or_default().push(r.clone());
            }
            if slab.owns_refs {
                if let Some(file) = file_of(key) {
                    snapshot.indexed_files.insert(file.to_path_buf());
                }
            }
        }
        snapshot
    }

    pub fn lookup(&self, ids: &[SymbolId]) -> Vec<IndexEntry> {
        ids.iter().filter_map(|id| self.entries.get(id).cloned()).collect()
    }

    pub fn fuzzy_find(&self, request: &FuzzyFindRequest) -> Vec<IndexEntry> {
        self.entries
            .values()
            .filter(|e| request.matches(&e.symbol))
            .cloned()
            .collect()
    }

    pub fn refs(&self, ids: &[SymbolId]) -> Vec<Ref> {
        ids.iter()
            .filter_map(|id| self.refs.get(id))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn indexes_file(&self, path: &Path) -> bool {
        self.indexed_files.contains(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.bytes
    }
}

/// Holds the current snapshot of a tier; publishing swaps the `Arc`
#[derive(Debug, Default)]
pub struct SnapshotCell {
    current: RwLock<Arc<TierSnapshot>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Arc<TierSnapshot> {
        Arc::clone(&*self.current.read())
    }

    pub fn publish(&self, snapshot: TierSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}
