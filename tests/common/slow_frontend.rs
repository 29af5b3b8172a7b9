//! Frontend with artificial build latency and build accounting

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use semfora_scheduler::frontend::{AstData, BuildError, PreambleData};
use semfora_scheduler::{CancelToken, Frontend, ParseInputs, Preamble, TextFrontend};

/// Delays every build, honoring cancellation while it sleeps
pub struct SlowFrontend {
    inner: TextFrontend,
    preamble_delay_ms: AtomicU64,
    ast_delay_ms: AtomicU64,
    preamble_builds: AtomicUsize,
    cancelled_preambles: AtomicUsize,
    ast_builds: AtomicUsize,
    active_preambles: AtomicUsize,
    max_active_preambles: AtomicUsize,
}

impl SlowFrontend {
    pub fn new(preamble_delay: Duration, ast_delay: Duration) -> Self {
        Self {
            inner: TextFrontend::new().unwrap(),
            preamble_delay_ms: AtomicU64::new(preamble_delay.as_millis() as u64),
            ast_delay_ms: AtomicU64::new(ast_delay.as_millis() as u64),
            preamble_builds: AtomicUsize::new(0),
            cancelled_preambles: AtomicUsize::new(0),
            ast_builds: AtomicUsize::new(0),
            active_preambles: AtomicUsize::new(0),
            max_active_preambles: AtomicUsize::new(0),
        }
    }

    pub fn fast() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn set_preamble_delay(&self, delay: Duration) {
        self.preamble_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Completed preamble builds
    pub fn preamble_builds(&self) -> usize {
        self.preamble_builds.load(Ordering::SeqCst)
    }

    pub fn cancelled_preambles(&self) -> usize {
        self.cancelled_preambles.load(Ordering::SeqCst)
    }

    /// Completed AST builds
    pub fn ast_builds(&self) -> usize {
        self.ast_builds.load(Ordering::SeqCst)
    }

    /// Highest number of preamble builds seen running at once
    pub fn max_active_preambles(&self) -> usize {
        self.max_active_preambles.load(Ordering::SeqCst)
    }
}

impl Frontend for SlowFrontend {
    fn preamble_bounds(&self, contents: &str) -> usize {
        self.inner.preamble_bounds(contents)
    }

    fn build_preamble(
        &self,
        path: &Path,
        inputs: &ParseInputs,
        cancel: &CancelToken,
    ) -> Result<PreambleData, BuildError> {
        let active = self.active_preambles.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_preambles.fetch_max(active, Ordering::SeqCst);

        let delay = Duration::from_millis(self.preamble_delay_ms.load(Ordering::SeqCst));
        let result = cancel
            .sleep(delay)
            .map_err(BuildError::from)
            .and_then(|()| self.inner.build_preamble(path, inputs, cancel));

        self.active_preambles.fetch_sub(1, Ordering::SeqCst);
        match &result {
            Err(BuildError::Cancelled(_)) => self.cancelled_preambles.fetch_add(1, Ordering::SeqCst),
            _ => self.preamble_builds.fetch_add(1, Ordering::SeqCst),
        };
        result
    }

    fn build_ast(
        &self,
        path: &Path,
        inputs: &ParseInputs,
        preamble: &Preamble,
        cancel: &CancelToken,
    ) -> Result<AstData, BuildError> {
        let delay = Duration::from_millis(self.ast_delay_ms.load(Ordering::SeqCst));
        cancel.sleep(delay)?;
        let result = self.inner.build_ast(path, inputs, preamble, cancel);
        if result.is_ok() {
            self.ast_builds.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}
