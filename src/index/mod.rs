//! Tiered symbol index
//!
//! Three independently updated tiers are composed into one view:
//!
//! ```text
//! Dynamic     (open files, updated on every preamble/AST build)   highest
//!     ↓
//! Background  (whole project, persisted shards, eventually consistent)
//!     ↓
//! Static      (externally supplied, read-only)                     lowest
//! ```
//!
//! Every tier publishes immutable `TierSnapshot`s; readers never see a
//! partially applied update. `MergedIndex` fans queries out to all layers and
//! keeps, per symbol ID, the whole entry from the highest layer.

pub mod background;
pub mod dynamic;
pub mod merge;
pub mod shard;
pub mod snapshot;
pub mod static_index;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::memory::MemoryTree;
use crate::schema::{Ref, Symbol, SymbolId};

pub use background::{BackgroundIndex, BackgroundIndexer, BackgroundStats};
pub use dynamic::FileIndex;
pub use merge::MergedIndex;
pub use shard::{DiskShardStore, IndexShard, MemoryShardStore, ShardStore};
pub use snapshot::{FileSlab, TierSnapshot};
pub use static_index::StaticIndex;

/// Index source, ordered by precedence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Static = 0,
    Background = 1,
    Dynamic = 2,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Background => "background",
            Self::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A symbol with its provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub symbol: Symbol,
    pub tier: Tier,
    /// Unix millis of the update that produced the entry
    pub timestamp: u64,
}

/// Query for `fuzzy_find`
#[derive(Debug, Clone, Default)]
pub struct FuzzyFindRequest {
    /// Characters that must appear in order in the name, case-insensitive;
    /// empty matches everything
    pub query: String,
    /// Restrict to one scope
    pub scope: Option<String>,
    pub limit: Option<usize>,
}

impl FuzzyFindRequest {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, symbol: &Symbol) -> bool {
        if let Some(scope) = &self.scope {
            if *scope != symbol.scope {
                return false;
            }
        }
        let mut name = symbol.name.chars().flat_map(char::to_lowercase);
        self.query
            .chars()
            .flat_map(char::to_lowercase)
            .all(|q| name.any(|c| c == q))
    }
}

/// One layer of the merged index
pub trait SymbolIndex: Send + Sync {
    fn tier(&self) -> Tier;

    /// Entries for the given IDs, at most one per ID
    fn lookup(&self, ids: &[SymbolId]) -> Vec<IndexEntry>;

    /// Matching entries, at most one per ID, unlimited
    fn fuzzy_find(&self, request: &FuzzyFindRequest) -> Vec<IndexEntry>;

    fn refs(&self, ids: &[SymbolId]) -> Vec<Ref>;

    /// Whether this layer's refs are authoritative for `path`
    fn indexes_file(&self, path: &Path) -> bool;

    fn profile(&self, tree: &mut MemoryTree);
}
