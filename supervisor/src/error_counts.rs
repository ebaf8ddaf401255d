//! Per-error attempt counts, persisted as `error_counts.json` in the job
//! directory.
//!
//! The ledger is what lets a handler escalate: "this is the second time this
//! error fired, try the stronger fix". It survives process relaunches of the
//! same job and is never reset within a job. An absent file is the empty map
//! (a fresh job has corrected nothing), never an error.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Map from error kind to how many times its correction has been attempted.
///
/// A kind absent from the map counts as 0. BTreeMap keeps serialization
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCounts {
    counts: BTreeMap<String, u32>,
}

impl ErrorCounts {
    /// Load the ledger from disk; an absent file is the empty ledger.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read ledger {}", path.display()))?;
        let counts: Self = serde_json::from_str(&contents)
            .with_context(|| format!("parse ledger {}", path.display()))?;
        debug!(path = %path.display(), entries = counts.counts.len(), "ledger loaded");
        Ok(counts)
    }

    /// Attempt count for `kind`, 0 when absent.
    pub fn count(&self, kind: &str) -> u32 {
        self.counts.get(kind).copied().unwrap_or(0)
    }

    /// Increment the count for `kind`, returning the new value.
    pub fn increment(&mut self, kind: &str) -> u32 {
        let entry = self.counts.entry(kind.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Atomically write the ledger to disk (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(self)?;
        buf.push('\n');
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, buf)
            .with_context(|| format!("write temp ledger {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("replace ledger {}", path.display()))?;
        Ok(())
    }
}
