//! Update debounce policy

use std::time::Duration;

use crate::config::DebounceOptions;

/// Rebuild durations kept per file
pub const REBUILD_HISTORY: usize = 15;

/// How long an update waits for a follow-up edit before being built
///
/// The delay tracks how expensive rebuilds of the file have recently been:
/// the median of the last `REBUILD_HISTORY` rebuilds times `rebuild_ratio`,
/// clamped to `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebouncePolicy {
    pub min: Duration,
    pub max: Duration,
    pub rebuild_ratio: f64,
}

impl Default for DebouncePolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(50),
            max: Duration::from_millis(500),
            rebuild_ratio: 1.0,
        }
    }
}

impl DebouncePolicy {
    /// Always wait exactly `delay`
    pub fn fixed(delay: Duration) -> Self {
        Self {
            min: delay,
            max: delay,
            rebuild_ratio: 0.0,
        }
    }

    pub fn from_options(options: &DebounceOptions) -> Self {
        match options.fixed_ms {
            Some(ms) => Self::fixed(Duration::from_millis(ms)),
            None => Self {
                min: Duration::from_millis(options.min_ms),
                max: Duration::from_millis(options.max_ms),
                rebuild_ratio: options.rebuild_ratio,
            },
        }
    }

    pub fn compute(&self, history: &[Duration]) -> Duration {
        if history.is_empty() {
            return self.max;
        }
        let start = history.len().saturating_sub(REBUILD_HISTORY);
        let mut recent = history[start..].to_vec();
        recent.sort_unstable();
        let median = recent[recent.len() / 2];
        median.mul_f64(self.rebuild_ratio).clamp(self.min, self.max)
    }
}
