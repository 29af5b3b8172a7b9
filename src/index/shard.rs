//! Persisted per-unit index shards
//!
//! Shards are keyed by compilation unit and command hash, so a unit whose
//! command flips back to an earlier one reuses that shard. The content hash is
//! a stamp: a shard whose contents no longer match is ignored and rebuilt. The byte layout is bincode of `IndexShard` and is not a stable
//! format.
//!
//! Disk layout:
//! ```text
//! ~/.cache/semfora/index/{project_hash}/
//! ├── main.3f2a9c0d11e4b7a6.0c47e2d19a8b3f50.idx
//! └── util.91ac02b4f5d6e7c8.77d0f3a2c1e9b864.idx
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::{fnv1a_hash, Ref, Symbol, SCHEMA_VERSION};

/// Index output for one compilation unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexShard {
    pub schema_version: String,
    pub path: PathBuf,
    pub content_hash: u64,
    pub command_hash: u64,
    /// Headers the unit included with the hash of the contents read
    pub includes: Vec<(PathBuf, u64)>,
    pub symbols: Vec<Symbol>,
    pub refs: Vec<Ref>,
    /// Unix millis
    pub indexed_at: u64,
}

impl IndexShard {
    /// Whether the shard was built from these inputs
    pub fn is_current(&self, content_hash: u64, command_hash: u64) -> bool {
        self.schema_version == SCHEMA_VERSION
            && self.content_hash == content_hash
            && self.command_hash == command_hash
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Blob store for shards keyed by unit path and command hash
pub trait ShardStore: Send + Sync {
    fn load(&self, path: &Path, command_hash: u64) -> Option<IndexShard>;

    fn store(&self, shard: &IndexShard) -> Result<()>;

    /// Paths of every stored unit
    fn stored_units(&self) -> Vec<PathBuf>;
}

// ============================================================================
// Disk store
// ============================================================================

/// One file per unit under a directory
#[derive(Debug, Clone)]
pub struct DiskShardStore {
    dir: PathBuf,
}

/// Base directory for shard storage
///
/// `$XDG_CACHE_HOME/semfora/index`, else `~/.cache/semfora/index`, else the
/// temp directory.
pub fn default_shard_root() -> PathBuf {
    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg_cache).join("semfora").join("index");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".cache").join("semfora").join("index");
    }
    std::env::temp_dir().join("semfora").join("index")
}

impl DiskShardStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Store under the default root, in a directory per project
    pub fn for_project(project_root: &Path) -> Result<Self> {
        let canonical = project_root
            .canonicalize()
            .unwrap_or_else(|_| project_root.to_path_buf());
        let hash = fnv1a_hash(&canonical.to_string_lossy());
        Self::new(default_shard_root().join(format!("{:016x}", hash)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn shard_path(&self, unit: &Path, command_hash: u64) -> PathBuf {
        let stem = unit
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unit".to_string());
        self.dir.join(format!(
            "{}.{:016x}.{:016x}.idx",
            stem,
            fnv1a_hash(&unit.to_string_lossy()),
            command_hash
        ))
    }
}

impl ShardStore for DiskShardStore {
    fn load(&self, path: &Path, command_hash: u64) -> Option<IndexShard> {
        let bytes = fs::read(self.shard_path(path, command_hash)).ok()?;
        match IndexShard::decode(&bytes) {
            Ok(shard) if shard.path == path && shard.command_hash == command_hash => Some(shard),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("Discarding unreadable shard for {}: {}", path.display(), e);
                None
            }
        }
    }

    fn store(&self, shard: &IndexShard) -> Result<()> {
        let target = self.shard_path(&shard.path, shard.command_hash);
        let temp = target.with_extension("tmp");
        fs::write(&temp, shard.encode()?)?;
        fs::rename(&temp, &target)?;
        Ok(())
    }

    fn stored_units(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut units: Vec<PathBuf> = entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "idx"))
            .filter_map(|e| fs::read(e.path()).ok())
            .filter_map(|bytes| IndexShard::decode(&bytes).ok())
            .map(|shard| shard.path)
            .collect();
        units.sort();
        units.dedup();
        units
    }
}

// ============================================================================
// Memory store
// ============================================================================

/// Encoded shards kept in memory
#[derive(Debug, Default)]
pub struct MemoryShardStore {
    shards: Mutex<HashMap<(PathBuf, u64), Vec<u8>>>,
}

impl MemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.shards.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.lock().is_empty()
    }
}

impl ShardStore for MemoryShardStore {
    fn load(&self, path: &Path, command_hash: u64) -> Option<IndexShard> {
        let shards = self.shards.lock();
        IndexShard::decode(shards.get(&(path.to_path_buf(), command_hash))?).ok()
    }

    fn store(&self, shard: &IndexShard) -> Result<()> {
        let bytes = shard.encode()?;
        self.shards
            .lock()
            .insert((shard.path.clone(), shard.command_hash), bytes);
        Ok(())
    }

    fn stored_units(&self) -> Vec<PathBuf> {
        let mut units: Vec<PathBuf> = self.shards.lock().keys().map(|(p, _)| p.clone()).collect();
        units.sort();
        units.dedup();
        units
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Location, SymbolKind};

    fn shard(path: &str) -> IndexShard {
        IndexShard {
            schema_version: SCHEMA_VERSION.to_string(),
            path: PathBuf::from(path),
            content_hash: 1,
            command_hash: 2,
            includes: vec![(PathBuf::from("/p/a.h"), 7)],
            symbols: vec![Symbol::new("f", SymbolKind::Function, Location::new(path, 1, 1))],
            refs: Vec::new(),
            indexed_at: 0,
        }
    }

    #[test]
    fn test_shard_staleness() {
        let s = shard("/p/a.c");
        assert!(s.is_current(1, 2));
        assert!(!s.is_current(1, 3));
        assert!(!s.is_current(9, 2));
    }

    #[test]
    fn test_disk_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskShardStore::new(dir.path().join("shards")).unwrap();
        store.store(&shard("/p/a.c")).unwrap();
        store.store(&shard("/q/a.c")).unwrap();

        let reopened = DiskShardStore::new(store.dir()).unwrap();
        assert_eq!(reopened.load(Path::new("/p/a.c"), 2).unwrap(), shard("/p/a.c"));
        assert!(reopened.load(Path::new("/p/a.c"), 3).is_none());
        assert!(reopened.load(Path::new("/p/b.c"), 2).is_none());
        assert_eq!(
            reopened.stored_units(),
            vec![PathBuf::from("/p/a.c"), PathBuf::from("/q/a.c")]
        );
    }

    #[test]
    fn test_disk_store_ignores_corrupt_shard() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskShardStore::new(dir.path()).unwrap();
        fs::write(store.shard_path(Path::new("/p/a.c"), 2), b"not bincode").unwrap();
        assert!(store.load(Path::new("/p/a.c"), 2).is_none());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryShardStore::new();
        assert!(store.load(Path::new("/p/a.c"), 2).is_none());
        store.store(&shard("/p/a.c")).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load(Path::new("/p/a.c"), 2).unwrap().symbols.len(), 1);
    }

    #[test]
    fn test_shards_keyed_by_command_hash() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskShardStore::new(dir.path()).unwrap();
        let memory = MemoryShardStore::new();
        let mut debug_build = shard("/p/a.c");
        debug_build.command_hash = 3;
        debug_build.symbols.clear();

        for store in [&disk as &dyn ShardStore, &memory as &dyn ShardStore] {
            store.store(&shard("/p/a.c")).unwrap();
            store.store(&debug_build).unwrap();
            assert_eq!(store.load(Path::new("/p/a.c"), 2).unwrap().symbols.len(), 1);
            assert!(store.load(Path::new("/p/a.c"), 3).unwrap().symbols.is_empty());
            assert_eq!(store.stored_units(), vec![PathBuf::from("/p/a.c")]);
        }
        assert_eq!(memory.len(), 2);
    }
}
