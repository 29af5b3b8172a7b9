//! Preamble: the compiled form of a file's leading directive block
//!
//! A preamble is shared (`Arc`) by every AST built on top of it and lives as
//! long as the longest holder. It is rebuilt only when something it depends
//! on changes:
//! - the bytes of the preamble region
//! - the compile command
//! - the contents of any header it included
//!
//! or when the caller forces a rebuild.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::fs::FsView;
use crate::frontend::{BuildError, Frontend, ParseInputs, PreambleData};
use crate::schema::{fnv1a_hash, Diagnostic, Symbol};
use crate::threading::CancelToken;

/// Reusable prefix-compilation artifact
#[derive(Debug, Clone)]
pub struct Preamble {
    /// Version of the file this preamble was built from
    pub version: String,
    pub region_hash: u64,
    pub command_hash: u64,
    pub header_state: Vec<u8>,
    /// Included headers with the hash of the contents that were read
    pub includes: Vec<(PathBuf, u64)>,
    pub diagnostics: Vec<Diagnostic>,
    pub symbols: Vec<Symbol>,
    pub build_time: Duration,
}

impl Preamble {
    pub fn from_data(version: &str, region_hash: u64, command_hash: u64, data: PreambleData) -> Self {
        Self {
            version: version.to_string(),
            region_hash,
            command_hash,
            header_state: data.header_state,
            includes: data.includes.into_iter().map(|p| (p, 0)).collect(),
            diagnostics: data.diagnostics,
            symbols: data.symbols,
            build_time: Duration::ZERO,
        }
    }

    pub fn included_files(&self) -> impl Iterator<Item = &Path> {
        self.includes.iter().map(|(p, _)| p.as_path())
    }

    pub fn includes_file(&self, path: &Path) -> bool {
        self.includes.iter().any(|(p, _)| p == path)
    }

    /// Whether this preamble can serve inputs with the given hashes
    pub fn is_compatible(&self, region_hash: u64, command_hash: u64, view: &dyn FsView) -> bool {
        self.region_hash == region_hash
            && self.command_hash == command_hash
            && self
                .includes
                .iter()
                .all(|(path, hash)| content_hash(view, path) == *hash)
    }

    pub fn estimated_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.header_state.len()
            + self
                .includes
                .iter()
                .map(|(p, _)| p.as_os_str().len() + 8)
                .sum::<usize>()
            + self.diagnostics.iter().map(|d| d.message.len() + 64).sum::<usize>()
            + self.symbols.iter().map(Symbol::estimated_bytes).sum::<usize>()
    }
}

fn content_hash(view: &dyn FsView, path: &Path) -> u64 {
    view.read(path).map(|c| fnv1a_hash(&c)).unwrap_or(0)
}

/// Hash of the preamble region of `contents`
pub fn region_hash(frontend: &dyn Frontend, contents: &str) -> u64 {
    fnv1a_hash(&contents[..frontend.preamble_bounds(contents)])
}

/// Result of asking for a preamble
#[derive(Debug, Clone)]
pub enum PreambleOutcome {
    /// The previous preamble still applies
    Reused(Arc<Preamble>),
    Built(Arc<Preamble>),
}

impl PreambleOutcome {
    pub fn preamble(&self) -> &Arc<Preamble> {
        match self {
            Self::Reused(p) | Self::Built(p) => p,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Built(_))
    }
}

/// Builds preambles, reusing the previous one when nothing it depends on
/// changed
pub struct PreambleBuilder {
    frontend: Arc<dyn Frontend>,
}

impl PreambleBuilder {
    pub fn new(frontend: Arc<dyn Frontend>) -> Self {
        Self { frontend }
    }

    pub fn region_hash(&self, contents: &str) -> u64 {
        region_hash(&*self.frontend, contents)
    }

    pub fn build(
        &self,
        path: &Path,
        inputs: &ParseInputs,
        previous: Option<&Arc<Preamble>>,
        cancel: &CancelToken,
    ) -> std::result::Result<PreambleOutcome, BuildError> {
        let region_hash = self.region_hash(&inputs.contents);
        let command_hash = inputs.command.hash();
        let view = inputs.fs.view(None);

        if let Some(previous) = previous.filter(|_| !inputs.force_rebuild) {
            if previous.is_compatible(region_hash, command_hash, &*view) {
                tracing::debug!(
                    "Reusing preamble of {} version {} for version {}",
                    path.display(),
                    previous.version,
                    inputs.version
                );
                return Ok(PreambleOutcome::Reused(Arc::clone(previous)));
            }
        }

        let start = Instant::now();
        let data = self.frontend.build_preamble(path, inputs, cancel)?;
        let mut preamble = Preamble::from_data(&inputs.version, region_hash, command_hash, data);
        for (include, hash) in preamble.includes.iter_mut() {
            *hash = content_hash(&*view, include);
        }
        preamble.build_time = start.elapsed();

        tracing::debug!(
            "Built preamble for {} version {} in {:?} ({} includes, {} symbols)",
            path.display(),
            inputs.version,
            preamble.build_time,
            preamble.includes.len(),
            preamble.symbols.len()
        );
        Ok(PreambleOutcome::Built(Arc::new(preamble)))
    }
}
