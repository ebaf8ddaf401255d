//! Supervisor configuration stored as `supervisor.toml` in the job directory.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Supervisor configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values; a missing file is
/// the default config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Command that launches the calculation (e.g. `["mpirun","-np","8","vasp_std"]`).
    pub command: Vec<String>,

    /// File the executable's stdout/stderr are streamed to, relative to the
    /// job directory.
    pub output_file: String,

    /// Total corrections allowed per job before giving up.
    pub max_corrections: u32,

    /// How often the running process's output is re-scanned for signatures.
    pub poll_interval_ms: u64,

    /// How long a terminated process gets to exit on SIGTERM before SIGKILL.
    pub terminate_grace_ms: u64,

    /// How many bytes of the final output stream to carry in the job result.
    pub output_tail_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: vec!["vasp_std".to_string()],
            output_file: "vasp.out".to_string(),
            max_corrections: 12,
            poll_interval_ms: 500,
            terminate_grace_ms: 5000,
            output_tail_bytes: 5000,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(anyhow!("command must be a non-empty array"));
        }
        if self.output_file.trim().is_empty() {
            return Err(anyhow!("output_file must be non-empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.output_tail_bytes == 0 {
            return Err(anyhow!("output_tail_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SupervisorConfig::default()`.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        let cfg = SupervisorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SupervisorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SupervisorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
