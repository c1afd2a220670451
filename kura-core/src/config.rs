//! Tunable knobs for scanning and watching.

use serde::Deserialize;

use crate::error::Result;

fn default_ignore_marker() -> Option<String> {
    Some(".nomedia".to_string())
}

fn default_report_interval() -> u64 {
    500
}

fn default_watch_poll_ms() -> u64 {
    500
}

fn default_queue_depth_per_worker() -> usize {
    2
}

/// Configuration for the scanner and watch pipeline.
///
/// Every field has a sensible default; [`ScanConfig::from_env`] overlays
/// values from `KURA_SCAN_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Marker filename whose presence excludes a directory subtree from
    /// scanning. `None` disables ignore handling entirely.
    pub ignore_marker: Option<String>,
    /// Log a progress line every this many committed events.
    pub report_interval: u64,
    /// Poll timeout used when waiting on a watch stream, so stop requests
    /// are noticed promptly.
    pub watch_poll_ms: u64,
    /// Bound of the parallel event queue, per worker.
    pub queue_depth_per_worker: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ignore_marker: default_ignore_marker(),
            report_interval: default_report_interval(),
            watch_poll_ms: default_watch_poll_ms(),
            queue_depth_per_worker: default_queue_depth_per_worker(),
        }
    }
}

impl ScanConfig {
    /// Build a configuration from the environment, e.g.
    /// `KURA_SCAN_IGNORE_MARKER=.kuraignore`.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("KURA_SCAN").try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ScanConfig::default();
        assert_eq!(config.ignore_marker.as_deref(), Some(".nomedia"));
        assert!(config.report_interval > 0);
        assert!(config.queue_depth_per_worker > 0);
    }
}
