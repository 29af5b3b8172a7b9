//! Static tier: an externally supplied, read-only symbol set
//!
//! Loaded once from JSON:
//!
//! ```json
//! {
//!   "timestamp": 1700000000000,
//!   "symbols": [{"id": "...", "name": "...", "kind": "function", "location": {...}}],
//!   "refs": []
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::snapshot::FileSlab;
use super::{FuzzyFindRequest, IndexEntry, SymbolIndex, Tier, TierSnapshot};
use crate::error::{Error, Result};
use crate::memory::MemoryTree;
use crate::schema::{Ref, Symbol, SymbolId};

/// On-disk form of a static index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticIndexFile {
    #[serde(default)]
    pub timestamp: u64,
    pub symbols: Vec<Symbol>,
    #[serde(default)]
    pub refs: Vec<Ref>,
}

/// Read-only index built once
#[derive(Debug)]
pub struct StaticIndex {
    snapshot: Arc<TierSnapshot>,
}

impl StaticIndex {
    pub fn new(symbols: Vec<Symbol>, refs: Vec<Ref>, timestamp: u64) -> Self {
        // Group by file so refs are authoritative per file
        let mut slabs: BTreeMap<PathBuf, FileSlab> = BTreeMap::new();
        for symbol in symbols {
            slabs
                .entry(symbol.location.path.clone())
                .or_insert_with(|| FileSlab {
                    timestamp,
                    ..FileSlab::default()
                })
                .symbols
                .push(symbol);
        }
        for r in refs {
            let slab = slabs.entry(r.location.path.clone()).or_insert_with(|| FileSlab {
                timestamp,
                ..FileSlab::default()
            });
            slab.owns_refs = true;
            slab.refs.push(r);
        }
        Self {
            snapshot: Arc::new(TierSnapshot::build(Tier::Static, &slabs, |p: &PathBuf| {
                Some(p.as_path())
            })),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: StaticIndexFile = serde_json::from_str(json)?;
        Ok(Self::new(file.symbols, file.refs, file.timestamp))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|_| Error::FileNotFound {
            path: path.display().to_string(),
        })?;
        let index = Self::from_json(&json)?;
        tracing::info!(
            "Loaded static index with {} symbols from {}",
            index.snapshot.len(),
            path.display()
        );
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }
}

impl SymbolIndex for StaticIndex {
    fn tier(&self) -> Tier {
        Tier::Static
    }

    fn lookup(&self, ids: &[SymbolId]) -> Vec<IndexEntry> {
        self.snapshot.lookup(ids)
    }

    fn fuzzy_find(&self, request: &FuzzyFindRequest) -> Vec<IndexEntry> {
        self.snapshot.fuzzy_find(request)
    }

    fn refs(&self, ids: &[SymbolId]) -> Vec<Ref> {
        self.snapshot.refs(ids)
    }

    fn indexes_file(&self, path: &Path) -> bool {
        self.snapshot.indexes_file(path)
    }

    fn profile(&self, tree: &mut MemoryTree) {
        tree.add_usage(self.snapshot.estimated_bytes());
    }
}
