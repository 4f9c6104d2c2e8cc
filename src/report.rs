//! Cook session statistics and reporting.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Aggregate statistics for one profile in one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookStats {
    /// Items for which a cook was attempted
    pub attempted: usize,
    /// Items committed successfully
    pub succeeded: usize,
    /// Items that failed
    pub failed: usize,
    /// Items skipped because the previous artifact was still valid
    pub skipped_identical: usize,
    /// Never-cook and redirect placeholders recorded
    pub placeholders: usize,
    /// Items unwound by a cancel
    pub canceled: usize,
    /// Total cook duration in milliseconds
    pub total_duration_ms: u64,
}

impl CookStats {
    /// Whether every attempted item succeeded.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Total items this profile saw in the session.
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped_identical + self.placeholders + self.canceled
    }

    /// Format the duration as a human-readable string.
    pub fn duration_string(&self) -> String {
        let ms = self.total_duration_ms;
        if ms < 1000 {
            format!("{}ms", ms)
        } else if ms < 60_000 {
            format!("{:.2}s", ms as f64 / 1000.0)
        } else {
            let mins = ms / 60_000;
            let secs = (ms % 60_000) / 1000;
            format!("{}m {}s", mins, secs)
        }
    }
}

impl std::fmt::Display for CookStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cooked, {} failed, {} skipped, {} placeholders in {}",
            self.succeeded,
            self.failed,
            self.skipped_identical,
            self.placeholders,
            self.duration_string()
        )
    }
}

/// Full session report across all profiles.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Per-profile statistics, keyed by profile name
    pub profiles: BTreeMap<String, CookStats>,
    /// Session wall time
    pub duration: Duration,
    /// Whether the session ended through a cancel
    pub canceled: bool,
}

impl SessionReport {
    /// Whether no profile recorded a failure.
    pub fn is_success(&self) -> bool {
        !self.canceled && self.profiles.values().all(CookStats::is_success)
    }

    /// Summed statistics over every profile.
    pub fn totals(&self) -> CookStats {
        let mut totals = CookStats::default();
        for stats in self.profiles.values() {
            totals.attempted += stats.attempted;
            totals.succeeded += stats.succeeded;
            totals.failed += stats.failed;
            totals.skipped_identical += stats.skipped_identical;
            totals.placeholders += stats.placeholders;
            totals.canceled += stats.canceled;
        }
        totals.total_duration_ms = self.duration.as_millis() as u64;
        totals
    }
}

impl std::fmt::Display for SessionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.canceled {
            writeln!(f, "cook cancelled after {:?}", self.duration)?;
        }
        for (name, stats) in &self.profiles {
            writeln!(f, "  {}: {}", name, stats)?;
        }
        let totals = self.totals();
        write!(f, "total: {}", totals)
    }
}
