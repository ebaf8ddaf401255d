//! The monitor-detect-correct-retry loop.
//!
//! One call to [`run_job`] owns one job directory end to end: launch the
//! process, race "process exited" against "a monitor handler matched" on a
//! poll interval, and on a match terminate the process, apply that handler's
//! correction, and relaunch. After a natural exit the final output is scanned
//! once more against the whole registry (a signature written between the last
//! poll tick and exit must not be lost); only then does a clean exit count as
//! success. A global correction ceiling bounds the loop.
//!
//! Handler errors never crash the supervisor: they fold into a
//! [`FailureKind::HandlerFailed`] outcome naming the handler.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::config::SupervisorConfig;
use crate::handlers::ErrorHandler;
use crate::job::{self, Correction, FailureKind, JobDir, JobResult, JobStatus};
use crate::process::{JobExit, JobHandle, Launcher};

/// What `watch` observed first.
enum Event {
    Exited(JobExit),
    Matched(usize),
    Abort,
}

/// What happens after a signature match.
enum AfterMatch {
    Relaunch,
    Stop(FailureKind),
}

/// Run one job to completion or failure.
///
/// Precondition: no other supervisor is acting on `job`'s directory
/// (single-writer; not enforced by locking).
#[instrument(skip_all, fields(workdir = %job.root().display()))]
pub fn run_job(
    job: &JobDir,
    launcher: &dyn Launcher,
    handlers: &[Box<dyn ErrorHandler>],
    config: &SupervisorConfig,
    abort: &AtomicBool,
) -> Result<JobResult> {
    config.validate()?;

    let mut corrections: Vec<Correction> = Vec::new();
    let mut attempt: u32 = 1;
    loop {
        info!(attempt, "launching job process");
        let mut handle = launcher.spawn(job)?;

        let exit = match watch(job, handle.as_mut(), handlers, config, abort)? {
            Event::Abort => {
                info!(attempt, "abort requested, terminating");
                handle.terminate(config.terminate_grace())?;
                return Ok(finish(
                    job,
                    config,
                    JobStatus::Failure(FailureKind::Aborted),
                    corrections,
                    None,
                ));
            }
            Event::Matched(idx) => {
                let handler = &handlers[idx];
                info!(
                    handler = handler.id(),
                    attempt, "monitor signature matched, terminating process"
                );
                handle.terminate(config.terminate_grace())?;
                match correct(job, handler.as_ref(), &mut corrections, attempt, config) {
                    AfterMatch::Relaunch => {
                        attempt += 1;
                        continue;
                    }
                    AfterMatch::Stop(kind) => {
                        return Ok(finish(job, config, JobStatus::Failure(kind), corrections, None));
                    }
                }
            }
            Event::Exited(exit) => exit,
        };

        info!(attempt, code = ?exit.code, "job process exited");
        // Final scan over the whole registry: monitors first by construction,
        // then post-mortem handlers, first match wins.
        match scan(job, handlers, config, false)? {
            Some(idx) => {
                let handler = &handlers[idx];
                info!(handler = handler.id(), attempt, "signature matched after exit");
                match correct(job, handler.as_ref(), &mut corrections, attempt, config) {
                    AfterMatch::Relaunch => {
                        attempt += 1;
                    }
                    AfterMatch::Stop(kind) => {
                        return Ok(finish(
                            job,
                            config,
                            JobStatus::Failure(kind),
                            corrections,
                            exit.code,
                        ));
                    }
                }
            }
            None => {
                let status = if exit.success() {
                    JobStatus::Success
                } else {
                    warn!(code = ?exit.code, "process failed with no matching handler");
                    JobStatus::Failure(FailureKind::Unmatched)
                };
                return Ok(finish(job, config, status, corrections, exit.code));
            }
        }
    }
}

/// Race process exit against a monitor match, waking every poll interval.
fn watch(
    job: &JobDir,
    handle: &mut dyn JobHandle,
    handlers: &[Box<dyn ErrorHandler>],
    config: &SupervisorConfig,
    abort: &AtomicBool,
) -> Result<Event> {
    loop {
        if abort.load(Ordering::Relaxed) {
            return Ok(Event::Abort);
        }
        if let Some(exit) = handle.wait_timeout(config.poll_interval())? {
            return Ok(Event::Exited(exit));
        }
        if let Some(idx) = scan(job, handlers, config, true)? {
            return Ok(Event::Matched(idx));
        }
    }
}

/// One-shot scan of a job's existing output streams against the whole
/// registry, in registry order; returns the index of the first match.
pub fn scan_streams(
    job: &JobDir,
    handlers: &[Box<dyn ErrorHandler>],
    config: &SupervisorConfig,
) -> Result<Option<usize>> {
    scan(job, handlers, config, false)
}

/// Scan handler output streams in registry order; first match wins.
///
/// Handlers without a pinned stream scan the configured main output file.
/// Streams are read once per scan even when several handlers share a file.
/// A stream file that does not exist yet reads as empty (the process may not
/// have written anything).
fn scan(
    job: &JobDir,
    handlers: &[Box<dyn ErrorHandler>],
    config: &SupervisorConfig,
    monitors_only: bool,
) -> Result<Option<usize>> {
    let mut streams: HashMap<&str, String> = HashMap::new();
    for (idx, handler) in handlers.iter().enumerate() {
        if monitors_only && !handler.is_monitor() {
            continue;
        }
        let name = handler.output_file().unwrap_or(&config.output_file);
        if !streams.contains_key(name) {
            let path = job.output(name);
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("read output stream {}", path.display()));
                }
            };
            streams.insert(name, text);
        }
        if handler.matches(&streams[name]) {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

/// Apply one handler's correction, honoring the ceiling.
///
/// Handler errors are folded into a failure outcome rather than propagated,
/// so a broken correction can never crash the loop.
fn correct(
    job: &JobDir,
    handler: &dyn ErrorHandler,
    corrections: &mut Vec<Correction>,
    attempt: u32,
    config: &SupervisorConfig,
) -> AfterMatch {
    if corrections.len() as u32 >= config.max_corrections {
        warn!(
            handler = handler.id(),
            max_corrections = config.max_corrections,
            "retry ceiling reached, giving up"
        );
        return AfterMatch::Stop(FailureKind::RetryCeilingExceeded);
    }
    match handler.correct(job) {
        Ok(description) => {
            info!(
                handler = handler.id(),
                %description,
                attempt,
                "applied correction"
            );
            corrections.push(Correction {
                handler: handler.id().to_string(),
                description,
            });
            AfterMatch::Relaunch
        }
        Err(err) => {
            let error = format!("{err:#}");
            warn!(handler = handler.id(), %error, "correction failed");
            AfterMatch::Stop(FailureKind::HandlerFailed {
                handler: handler.id().to_string(),
                error,
            })
        }
    }
}

fn finish(
    job: &JobDir,
    config: &SupervisorConfig,
    status: JobStatus,
    corrections: Vec<Correction>,
    exit_code: Option<i32>,
) -> JobResult {
    let text = fs::read_to_string(job.output(&config.output_file)).unwrap_or_default();
    JobResult {
        status,
        corrections,
        exit_code,
        output_tail: job::output_tail(&text, config.output_tail_bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::default_handlers;
    use crate::incar::Incar;
    use crate::test_support::{ScriptedHandler, ScriptedLauncher, ScriptedSpawn, TestJob};

    const EDDRMM_SIG: &str = "WARNING in EDDRMM: call to ZHEGV failed";

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            poll_interval_ms: 10,
            terminate_grace_ms: 200,
            ..SupervisorConfig::default()
        }
    }

    fn no_abort() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn monitor_match_kills_corrects_and_relaunches() {
        let test = TestJob::new().expect("job");
        test.write_incar("ALGO = Fast\nICHARG = 11\n");

        let launcher = ScriptedLauncher::new(vec![
            ScriptedSpawn::RunUntilTerminated {
                output: format!("step 1\n{EDDRMM_SIG}\n"),
            },
            ScriptedSpawn::Exit {
                output: "converged\n".to_string(),
                code: 0,
            },
        ]);

        let result = run_job(
            &test.dir(),
            &launcher,
            &default_handlers(),
            &test_config(),
            &no_abort(),
        )
        .expect("run");

        assert!(result.succeeded());
        assert_eq!(result.corrections.len(), 1);
        assert_eq!(result.corrections[0].handler, "eddrmm");
        assert_eq!(launcher.terminations(), 1);
        assert_eq!(launcher.spawns(), 2);
        // Relaunch got a fresh stream: the final tail is attempt 2's output.
        assert_eq!(result.output_tail, "converged\n");

        let incar = Incar::load(&test.dir().incar()).expect("reload");
        assert_eq!(incar.get_str("ALGO", ""), "Normal");
    }

    #[test]
    fn renamed_output_stream_is_still_scanned() {
        let test = TestJob::new().expect("job");
        test.write_incar("ALGO = Fast\n");

        // The configured stream name replaces vasp.out everywhere: the
        // launcher writes there and the registry must scan there.
        let launcher = ScriptedLauncher::new(vec![
            ScriptedSpawn::Exit {
                output: format!("{EDDRMM_SIG}\n"),
                code: 1,
            },
            ScriptedSpawn::Exit {
                output: "converged\n".to_string(),
                code: 0,
            },
        ])
        .with_output_file("sim.out");
        let config = SupervisorConfig {
            output_file: "sim.out".to_string(),
            ..test_config()
        };

        let result = run_job(
            &test.dir(),
            &launcher,
            &default_handlers(),
            &config,
            &no_abort(),
        )
        .expect("run");

        assert!(result.succeeded());
        assert_eq!(result.corrections.len(), 1);
        assert_eq!(result.corrections[0].handler, "eddrmm");
        assert_eq!(result.output_tail, "converged\n");
    }

    #[test]
    fn clean_exit_with_no_signature_is_success() {
        let test = TestJob::new().expect("job");
        let launcher = ScriptedLauncher::new(vec![ScriptedSpawn::Exit {
            output: "reached required accuracy\n".to_string(),
            code: 0,
        }]);

        let result = run_job(
            &test.dir(),
            &launcher,
            &default_handlers(),
            &test_config(),
            &no_abort(),
        )
        .expect("run");

        assert!(result.succeeded());
        assert!(result.corrections.is_empty());
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn nonzero_exit_with_no_signature_is_unmatched() {
        let test = TestJob::new().expect("job");
        let launcher = ScriptedLauncher::new(vec![ScriptedSpawn::Exit {
            output: "segmentation fault\n".to_string(),
            code: 139,
        }]);

        let result = run_job(
            &test.dir(),
            &launcher,
            &default_handlers(),
            &test_config(),
            &no_abort(),
        )
        .expect("run");

        assert_eq!(
            result.status,
            JobStatus::Failure(FailureKind::Unmatched)
        );
        assert_eq!(result.exit_code, Some(139));
        assert!(result.corrections.is_empty());
        assert!(result.output_tail.contains("segmentation fault"));
    }

    #[test]
    fn repeating_failure_stops_at_the_retry_ceiling() {
        let test = TestJob::new().expect("job");
        let handler = ScriptedHandler::monitor("stuck", "BOOM");
        let applied = handler.corrections_counter();
        let handlers: Vec<Box<dyn ErrorHandler>> = vec![Box::new(handler)];

        // The correction never actually resolves the condition.
        let launcher = ScriptedLauncher::repeating(ScriptedSpawn::Exit {
            output: "BOOM\n".to_string(),
            code: 1,
        });
        let config = SupervisorConfig {
            max_corrections: 3,
            ..test_config()
        };

        let result = run_job(&test.dir(), &launcher, &handlers, &config, &no_abort())
            .expect("run");

        assert_eq!(
            result.status,
            JobStatus::Failure(FailureKind::RetryCeilingExceeded)
        );
        assert_eq!(result.corrections.len(), 3);
        assert_eq!(applied.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn handler_error_becomes_handler_failed() {
        let test = TestJob::new().expect("job");
        let handlers: Vec<Box<dyn ErrorHandler>> =
            vec![Box::new(ScriptedHandler::failing("broken", "BOOM"))];
        let launcher = ScriptedLauncher::new(vec![ScriptedSpawn::Exit {
            output: "BOOM\n".to_string(),
            code: 1,
        }]);

        let result = run_job(&test.dir(), &launcher, &handlers, &test_config(), &no_abort())
            .expect("run");

        match result.status {
            JobStatus::Failure(FailureKind::HandlerFailed { handler, .. }) => {
                assert_eq!(handler, "broken");
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert!(result.corrections.is_empty());
    }

    #[test]
    fn post_mortem_handler_fires_only_after_exit() {
        let test = TestJob::new().expect("job");
        let handler = ScriptedHandler::post_mortem("unconverged", "did not converge");
        let applied = handler.corrections_counter();
        let handlers: Vec<Box<dyn ErrorHandler>> = vec![Box::new(handler)];

        let launcher = ScriptedLauncher::new(vec![
            ScriptedSpawn::Exit {
                output: "did not converge\n".to_string(),
                code: 1,
            },
            ScriptedSpawn::Exit {
                output: "converged\n".to_string(),
                code: 0,
            },
        ]);

        let result = run_job(&test.dir(), &launcher, &handlers, &test_config(), &no_abort())
            .expect("run");

        assert!(result.succeeded());
        assert_eq!(result.corrections.len(), 1);
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        // No monitor match, so nothing was ever terminated.
        assert_eq!(launcher.terminations(), 0);
    }

    #[test]
    fn first_matching_handler_in_registry_order_wins() {
        let test = TestJob::new().expect("job");
        let first = ScriptedHandler::monitor("first", "SHARED SIGNATURE");
        let second = ScriptedHandler::monitor("second", "SHARED SIGNATURE");
        let second_applied = second.corrections_counter();
        let handlers: Vec<Box<dyn ErrorHandler>> = vec![Box::new(first), Box::new(second)];

        let launcher = ScriptedLauncher::new(vec![
            ScriptedSpawn::Exit {
                output: "SHARED SIGNATURE\n".to_string(),
                code: 1,
            },
            ScriptedSpawn::Exit {
                output: "ok\n".to_string(),
                code: 0,
            },
        ]);

        let result = run_job(&test.dir(), &launcher, &handlers, &test_config(), &no_abort())
            .expect("run");

        assert!(result.succeeded());
        assert_eq!(result.corrections.len(), 1);
        assert_eq!(result.corrections[0].handler, "first");
        assert_eq!(second_applied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn abort_terminates_without_correcting() {
        let test = TestJob::new().expect("job");
        let launcher = ScriptedLauncher::new(vec![ScriptedSpawn::RunUntilTerminated {
            output: format!("{EDDRMM_SIG}\n"),
        }]);

        let abort = AtomicBool::new(true);
        let result = run_job(
            &test.dir(),
            &launcher,
            &default_handlers(),
            &test_config(),
            &abort,
        )
        .expect("run");

        assert_eq!(result.status, JobStatus::Failure(FailureKind::Aborted));
        assert!(result.corrections.is_empty());
        assert_eq!(launcher.terminations(), 1);
    }

    /// End-to-end against real processes: the first launch prints a live
    /// failure signature and hangs; the supervisor must kill it, correct the
    /// INCAR, and relaunch, and the second launch exits clean.
    #[cfg(unix)]
    #[test]
    fn real_process_is_killed_corrected_and_relaunched() {
        use crate::process::VaspLauncher;

        let test = TestJob::new().expect("job");
        test.write_incar("ALGO = Fast\nICHARG = 11\n");

        let script = "if [ -f attempted.marker ]; then echo finished; exit 0; fi; \
                      touch attempted.marker; \
                      echo 'WARNING in EDDRMM: call to ZHEGV failed'; sleep 30";
        let config = SupervisorConfig {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            poll_interval_ms: 50,
            terminate_grace_ms: 2000,
            ..SupervisorConfig::default()
        };
        let launcher = VaspLauncher::from_config(&config).expect("launcher");

        let result = run_job(
            &test.dir(),
            &launcher,
            &default_handlers(),
            &config,
            &no_abort(),
        )
        .expect("run");

        assert!(result.succeeded());
        assert_eq!(result.corrections.len(), 1);
        assert_eq!(result.corrections[0].handler, "eddrmm");
        assert!(result.output_tail.contains("finished"));

        let incar = Incar::load(&test.dir().incar()).expect("reload");
        assert_eq!(incar.get_str("ALGO", ""), "Normal");
    }
}
