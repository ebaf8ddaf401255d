//! Test-only scripted collaborators and job-directory fixtures.

use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use crate::handlers::ErrorHandler;
use crate::job::JobDir;
use crate::process::{JobExit, JobHandle, Launcher};

/// A temp job directory with writers for the canonical input files.
pub struct TestJob {
    temp: tempfile::TempDir,
}

impl TestJob {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir().context("create temp job dir")?,
        })
    }

    pub fn dir(&self) -> JobDir {
        JobDir::new(self.temp.path())
    }

    pub fn write_incar(&self, contents: &str) {
        self.write_file("INCAR", contents);
    }

    /// Write a minimal POSCAR with `natoms` sites of a single species.
    pub fn write_poscar(&self, natoms: usize) {
        let contents = format!(
            "test cell\n1.0\n 8.0 0.0 0.0\n 0.0 8.0 0.0\n 0.0 0.0 8.0\nFe\n{natoms}\nDirect\n"
        );
        self.write_file("POSCAR", &contents);
    }

    pub fn write_file(&self, name: &str, contents: &str) {
        fs::write(self.temp.path().join(name), contents).expect("write test file");
    }
}

/// One planned launch for [`ScriptedLauncher`].
#[derive(Debug, Clone)]
pub enum ScriptedSpawn {
    /// Write `output` to the job's output file, then report exit with `code`.
    Exit { output: String, code: i32 },
    /// Write `output`, then stay "running" until terminated.
    RunUntilTerminated { output: String },
}

/// Launcher double that replays a plan of spawn outcomes without spawning
/// real processes. Each spawn overwrites the output file, matching the real
/// launcher's fresh-stream-per-attempt behavior.
pub struct ScriptedLauncher {
    plan: Mutex<VecDeque<ScriptedSpawn>>,
    repeat: Option<ScriptedSpawn>,
    output_file: String,
    spawns: AtomicUsize,
    terminations: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    pub fn new(plan: Vec<ScriptedSpawn>) -> Self {
        Self {
            plan: Mutex::new(plan.into()),
            repeat: None,
            output_file: "vasp.out".to_string(),
            spawns: AtomicUsize::new(0),
            terminations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A launcher whose every spawn replays the same step, for conditions a
    /// correction never resolves.
    pub fn repeating(step: ScriptedSpawn) -> Self {
        Self {
            repeat: Some(step),
            ..Self::new(Vec::new())
        }
    }

    /// Redirect scripted output to a different stream name, for configs that
    /// rename the main output file.
    pub fn with_output_file(mut self, name: &str) -> Self {
        self.output_file = name.to_string();
        self
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl Launcher for ScriptedLauncher {
    fn spawn(&self, job: &JobDir) -> Result<Box<dyn JobHandle>> {
        let step = self
            .plan
            .lock()
            .expect("plan lock")
            .pop_front()
            .or_else(|| self.repeat.clone())
            .ok_or_else(|| anyhow!("scripted launcher plan exhausted"))?;
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let (output, exit) = match step {
            ScriptedSpawn::Exit { output, code } => (output, Some(JobExit { code: Some(code) })),
            ScriptedSpawn::RunUntilTerminated { output } => (output, None),
        };
        fs::write(job.output(&self.output_file), output).context("write scripted output")?;

        Ok(Box::new(ScriptedHandle {
            exit,
            terminations: self.terminations.clone(),
        }))
    }
}

struct ScriptedHandle {
    exit: Option<JobExit>,
    terminations: Arc<AtomicUsize>,
}

impl JobHandle for ScriptedHandle {
    fn wait_timeout(&mut self, _timeout: Duration) -> Result<Option<JobExit>> {
        Ok(self.exit)
    }

    fn terminate(&mut self, _grace: Duration) -> Result<JobExit> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        let exit = JobExit { code: None };
        self.exit = Some(exit);
        Ok(exit)
    }
}

/// Handler double with a scripted signature and a counting no-op correction.
pub struct ScriptedHandler {
    id: &'static str,
    signatures: Vec<&'static str>,
    monitor: bool,
    fail: bool,
    corrections: Arc<AtomicUsize>,
}

impl ScriptedHandler {
    pub fn monitor(id: &'static str, signature: &'static str) -> Self {
        Self {
            id,
            signatures: vec![signature],
            monitor: true,
            fail: false,
            corrections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn post_mortem(id: &'static str, signature: &'static str) -> Self {
        Self {
            monitor: false,
            ..Self::monitor(id, signature)
        }
    }

    /// A handler whose `correct` always errors.
    pub fn failing(id: &'static str, signature: &'static str) -> Self {
        Self {
            fail: true,
            ..Self::monitor(id, signature)
        }
    }

    /// Shared counter of applied corrections, for assertions after the
    /// handler has been boxed into a registry.
    pub fn corrections_counter(&self) -> Arc<AtomicUsize> {
        self.corrections.clone()
    }
}

impl ErrorHandler for ScriptedHandler {
    fn id(&self) -> &'static str {
        self.id
    }

    fn signatures(&self) -> &[&'static str] {
        &self.signatures
    }

    fn is_monitor(&self) -> bool {
        self.monitor
    }

    fn correct(&self, _job: &JobDir) -> Result<String> {
        if self.fail {
            bail!("scripted correction failure");
        }
        let applied = self.corrections.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("scripted correction {applied}"))
    }
}
