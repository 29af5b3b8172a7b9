//! Merged view over an ordered stack of index layers
//!
//! # Query Resolution
//!
//! Layers are queried in parallel. For each symbol ID the entry of the
//! highest layer wins as a whole; fields are never combined across layers.
//! Two entries from the same layer are ordered by timestamp.
//!
//! References are merged differently: a layer's references located in a
//! file that some higher layer has indexed are dropped, since the higher
//! layer has a fresher picture of that file.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;

use super::{FuzzyFindRequest, IndexEntry, SymbolIndex};
use crate::memory::MemoryTree;
use crate::schema::{Ref, SymbolId};

/// Ordered list of layers; the last pushed has the highest priority
#[derive(Default)]
pub struct MergedIndex {
    layers: RwLock<Vec<Arc<dyn SymbolIndex>>>,
}

impl MergedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer above every existing one
    pub fn push_layer(&self, layer: Arc<dyn SymbolIndex>) {
        let mut layers = self.layers.write();
        tracing::debug!("Index layer {} pushed at position {}", layer.tier(), layers.len());
        layers.push(layer);
    }

    pub fn layer_count(&self) -> usize {
        self.layers.read().len()
    }

    /// Current layers, lowest first
    fn layers(&self) -> Vec<Arc<dyn SymbolIndex>> {
        let layers = self.layers.read().clone();
        if layers.is_empty() {
            tracing::debug!("Index query with no layers configured");
        }
        layers
    }

    pub fn lookup(&self, ids: &[SymbolId]) -> Vec<IndexEntry> {
        let per_layer: Vec<Vec<IndexEntry>> = self
            .layers()
            .par_iter()
            .map(|layer| layer.lookup(ids))
            .collect();
        let mut merged = merge_entries(per_layer);
        merged.sort_by(|a, b| a.symbol.id.cmp(&b.symbol.id));
        merged
    }

    /// Merged matches sorted by name, truncated to the request limit
    pub fn fuzzy_find(&self, request: &FuzzyFindRequest) -> Vec<IndexEntry> {
        let per_layer: Vec<Vec<IndexEntry>> = self
            .layers()
            .par_iter()
            .map(|layer| layer.fuzzy_find(request))
            .collect();
        let mut merged = merge_entries(per_layer);
        merged.sort_by(|a, b| {
            a.symbol
                .name
                .cmp(&b.symbol.name)
                .then_with(|| a.symbol.id.cmp(&b.symbol.id))
        });
        if let Some(limit) = request.limit {
            merged.truncate(limit);
        }
        merged
    }

    /// References to `ids`, sorted by location
    pub fn refs(&self, ids: &[SymbolId]) -> Vec<Ref> {
        let layers = self.layers();
        let per_layer: Vec<Vec<Ref>> = layers
            .par_iter()
            .enumerate()
            .map(|(rank, layer)| {
                let higher = &layers[rank + 1..];
                layer
                    .refs(ids)
                    .into_iter()
                    .filter(|r| !higher.iter().any(|h| h.indexes_file(&r.location.path)))
                    .collect()
            })
            .collect();

        let mut seen = HashSet::new();
        let mut merged: Vec<Ref> = per_layer
            .into_iter()
            .flatten()
            .filter(|r| seen.insert(r.clone()))
            .collect();
        merged.sort_by(|a, b| a.location.cmp(&b.location).then_with(|| a.symbol.cmp(&b.symbol)));
        merged
    }

    pub fn profile(&self, tree: &mut MemoryTree) {
        for layer in self.layers.read().iter() {
            layer.profile(tree.child(layer.tier().as_str()));
        }
    }
}

/// Keep one entry per ID: highest layer first, then newest timestamp
fn merge_entries(per_layer: Vec<Vec<IndexEntry>>) -> Vec<IndexEntry> {
    let mut best: HashMap<SymbolId, (usize, IndexEntry)> = HashMap::new();
    for (rank, entries) in per_layer.into_iter().enumerate() {
        for entry in entries {
            match best.get(&entry.symbol.id) {
                Some((r, existing))
                    if *r > rank || (*r == rank && existing.timestamp >= entry.timestamp) => {}
                _ => {
                    best.insert(entry.symbol.id.clone(), (rank, entry));
                }
            }
        }
    }
    best.into_values().map(|(_, entry)| entry).collect()
}
