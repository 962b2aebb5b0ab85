//! Configuration for bounded waits and thresholds.
//!
//! Every suspension point in the core (bidding, proposal collection,
//! feedback rounds, agent calls) has a configurable deadline here.
//! Defaults match the documented protocol values.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Tunable windows and thresholds for the coordination core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Contract-net bid collection window in seconds.
    pub bid_window_secs: u64,
    /// Delphi round-1 proposal collection window in seconds.
    pub proposal_window_secs: u64,
    /// Delphi feedback-round collection window in seconds.
    pub feedback_window_secs: u64,
    /// Window for collecting agent contributions in seconds.
    pub contribution_window_secs: u64,
    /// Per-agent generate call timeout in seconds.
    pub generate_timeout_secs: u64,
    /// Maximum Delphi proposal/feedback rounds before debate escalation.
    pub max_rounds: u32,
    /// Pairwise-similarity average required to declare convergence.
    pub convergence_threshold: f32,
    /// Minimum score each quality dimension must exceed to pass.
    pub quality_threshold: f32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            bid_window_secs: 30,
            proposal_window_secs: 600,
            feedback_window_secs: 300,
            contribution_window_secs: 60,
            generate_timeout_secs: 120,
            max_rounds: 3,
            convergence_threshold: 0.75,
            quality_threshold: 0.6,
        }
    }
}

impl CoordinationConfig {
    /// Load configuration from a TOML file. Missing keys fall back to
    /// defaults via `#[serde(default)]`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Bid collection window as a `Duration`.
    pub fn bid_window(&self) -> Duration {
        Duration::from_secs(self.bid_window_secs)
    }

    /// Proposal collection window as a `Duration`.
    pub fn proposal_window(&self) -> Duration {
        Duration::from_secs(self.proposal_window_secs)
    }

    /// Feedback-round window as a `Duration`.
    pub fn feedback_window(&self) -> Duration {
        Duration::from_secs(self.feedback_window_secs)
    }

    /// Contribution collection window as a `Duration`.
    pub fn contribution_window(&self) -> Duration {
        Duration::from_secs(self.contribution_window_secs)
    }

    /// Agent generate timeout as a `Duration`.
    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_timeout_secs)
    }

    /// Shrink every window to one second.
    ///
    /// Tests use this to keep deadline-or-quorum loops fast without
    /// changing protocol semantics; quorum normally fires first anyway.
    pub fn with_fast_windows(mut self) -> Self {
        self.bid_window_secs = 1;
        self.proposal_window_secs = 1;
        self.feedback_window_secs = 1;
        self.contribution_window_secs = 1;
        self.generate_timeout_secs = 1;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CoordinationConfig::default();
        assert_eq!(config.bid_window(), Duration::from_secs(30));
        assert_eq!(config.proposal_window(), Duration::from_secs(600));
        assert_eq!(config.max_rounds, 3);
        assert!((config.convergence_threshold - 0.75).abs() < f32::EPSILON);
        assert!((config.quality_threshold - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtable.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "bid_window_secs = 5\nmax_rounds = 2").unwrap();

        let config = CoordinationConfig::load(&path).unwrap();
        assert_eq!(config.bid_window_secs, 5);
        assert_eq!(config.max_rounds, 2);
        // Unspecified keys keep defaults
        assert_eq!(config.proposal_window_secs, 600);
    }

    #[test]
    fn test_load_missing_file() {
        let err = CoordinationConfig::load(Path::new("/nonexistent/roundtable.toml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
