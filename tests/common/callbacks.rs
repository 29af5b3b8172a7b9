//! Parsing callbacks that record what was published

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use semfora_scheduler::scheduler::Publisher;
use semfora_scheduler::{Diagnostic, ParsedAst, ParsingCallbacks, Preamble};

/// One diagnostics publication
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub path: PathBuf,
    pub version: String,
    pub diagnostics: Vec<Diagnostic>,
    /// Published from a failed build
    pub failed: bool,
}

#[derive(Default)]
pub struct RecordingCallbacks {
    published: Mutex<Vec<Published>>,
    preambles: Mutex<Vec<(PathBuf, String)>>,
}

impl RecordingCallbacks {
    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn published_versions(&self) -> Vec<String> {
        self.published.lock().iter().map(|p| p.version.clone()).collect()
    }

    /// Versions whose new preamble was reported
    pub fn preamble_versions(&self) -> Vec<String> {
        self.preambles.lock().iter().map(|(_, v)| v.clone()).collect()
    }
}

impl ParsingCallbacks for RecordingCallbacks {
    fn on_preamble_ast(&self, path: &Path, version: &str, _preamble: &Arc<Preamble>) {
        self.preambles
            .lock()
            .push((path.to_path_buf(), version.to_string()));
    }

    fn on_main_ast(&self, path: &Path, ast: &ParsedAst, publisher: Publisher<'_>) {
        publisher.publish(|| {
            self.published.lock().push(Published {
                path: path.to_path_buf(),
                version: ast.version.clone(),
                diagnostics: ast.diagnostics.clone(),
                failed: false,
            })
        });
    }

    fn on_failed_ast(
        &self,
        path: &Path,
        version: &str,
        diagnostics: Vec<Diagnostic>,
        publisher: Publisher<'_>,
    ) {
        publisher.publish(|| {
            self.published.lock().push(Published {
                path: path.to_path_buf(),
                version: version.to_string(),
                diagnostics,
                failed: true,
            })
        });
    }
}
