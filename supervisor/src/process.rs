//! Spawning, waiting on, and terminating the calculation process.
//!
//! The [`Launcher`]/[`JobHandle`] traits decouple the supervisor loop from
//! real subprocesses; tests use scripted implementations that never spawn
//! anything. [`VaspLauncher`] is the real backend: it runs the configured
//! command in the job directory with stdout and stderr streamed into the
//! job's output file (VASP convention: one merged `vasp.out`).

use std::fs::File;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::config::SupervisorConfig;
use crate::job::JobDir;

/// How a process ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobExit {
    pub code: Option<i32>,
}

impl JobExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for JobExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// A running calculation process.
pub trait JobHandle {
    /// Wait up to `timeout` for the process to exit. `Ok(None)` means it is
    /// still running; this suspends rather than busy-waiting.
    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<JobExit>>;

    /// Terminate the process: graceful first (SIGTERM), forced (SIGKILL)
    /// if it has not exited within `grace`.
    fn terminate(&mut self, grace: Duration) -> Result<JobExit>;
}

/// Abstraction over how a job's process is started.
pub trait Launcher {
    /// Spawn the process against `job`, creating a fresh output stream.
    fn spawn(&self, job: &JobDir) -> Result<Box<dyn JobHandle>>;
}

/// Launcher that spawns the configured VASP command.
pub struct VaspLauncher {
    command: Vec<String>,
    output_file: String,
}

impl VaspLauncher {
    pub fn new(command: Vec<String>, output_file: impl Into<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("launcher command must be non-empty"));
        }
        Ok(Self {
            command,
            output_file: output_file.into(),
        })
    }

    pub fn from_config(cfg: &SupervisorConfig) -> Result<Self> {
        Self::new(cfg.command.clone(), cfg.output_file.clone())
    }
}

impl Launcher for VaspLauncher {
    #[instrument(skip_all, fields(workdir = %job.root().display()))]
    fn spawn(&self, job: &JobDir) -> Result<Box<dyn JobHandle>> {
        let out_path = job.output(&self.output_file);
        // Truncate: each launch starts a fresh output stream.
        let stdout = File::create(&out_path)
            .with_context(|| format!("create output stream {}", out_path.display()))?;
        let stderr = stdout
            .try_clone()
            .with_context(|| format!("clone output stream {}", out_path.display()))?;

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .current_dir(job.root())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        debug!(command = ?self.command, "spawning job process");
        let child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", self.command[0]))?;
        info!(pid = child.id(), "job process started");
        Ok(Box::new(VaspProcess { child }))
    }
}

struct VaspProcess {
    child: Child,
}

impl JobHandle for VaspProcess {
    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<JobExit>> {
        let status = self
            .child
            .wait_timeout(timeout)
            .context("wait for job process")?;
        Ok(status.map(JobExit::from))
    }

    fn terminate(&mut self, grace: Duration) -> Result<JobExit> {
        send_sigterm(self.child.id());
        if let Some(status) = self
            .child
            .wait_timeout(grace)
            .context("wait for terminated job process")?
        {
            debug!(pid = self.child.id(), "process exited on SIGTERM");
            return Ok(status.into());
        }
        warn!(pid = self.child.id(), grace_ms = grace.as_millis() as u64, "process ignored SIGTERM, killing");
        self.child.kill().context("kill job process")?;
        let status = self.child.wait().context("wait after kill")?;
        Ok(status.into())
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    // ESRCH just means the process already exited; wait_timeout settles it.
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn spawn_streams_output_to_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let job = JobDir::new(temp.path());
        let launcher = VaspLauncher::new(sh("echo running; echo oops >&2"), "vasp.out")
            .expect("launcher");

        let mut handle = launcher.spawn(&job).expect("spawn");
        let exit = handle
            .wait_timeout(Duration::from_secs(5))
            .expect("wait")
            .expect("exited");
        assert!(exit.success());

        let output = std::fs::read_to_string(job.output("vasp.out")).expect("read output");
        assert!(output.contains("running"));
        assert!(output.contains("oops"));
    }

    #[test]
    fn respawn_truncates_previous_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let job = JobDir::new(temp.path());
        let launcher = VaspLauncher::new(sh("echo attempt"), "vasp.out").expect("launcher");

        for _ in 0..2 {
            let mut handle = launcher.spawn(&job).expect("spawn");
            handle.wait_timeout(Duration::from_secs(5)).expect("wait");
        }
        let output = std::fs::read_to_string(job.output("vasp.out")).expect("read output");
        assert_eq!(output.matches("attempt").count(), 1);
    }

    #[test]
    fn terminate_stops_a_stubborn_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        let job = JobDir::new(temp.path());
        let launcher = VaspLauncher::new(sh("sleep 30"), "vasp.out").expect("launcher");

        let mut handle = launcher.spawn(&job).expect("spawn");
        assert!(handle
            .wait_timeout(Duration::from_millis(50))
            .expect("wait")
            .is_none());
        let exit = handle.terminate(Duration::from_secs(2)).expect("terminate");
        assert!(!exit.success());
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(VaspLauncher::new(Vec::new(), "vasp.out").is_err());
    }
}
