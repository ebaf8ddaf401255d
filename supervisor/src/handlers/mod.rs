//! Known failure conditions and their fixes.
//!
//! Each handler pairs a set of literal diagnostic strings (exactly as the
//! executable prints them; matching is case-sensitive substring, no regex)
//! with a `correct` operation that edits the job directory to resolve that
//! condition. All handlers live in one ordered registry; scan order is list
//! order and the first match wins, so priority is an explicit, testable list
//! rather than implicit declaration order.

mod eddrmm;
mod real_optlay;

use std::path::Path;

use anyhow::Result;

use crate::job::JobDir;

pub use eddrmm::Eddrmm;
pub use real_optlay::RealOptlay;

/// A recognized failure condition and its fix.
pub trait ErrorHandler: Send + Sync {
    /// Stable identifier, also the ledger key for escalating handlers.
    fn id(&self) -> &'static str;

    /// Literal diagnostic strings to look for.
    fn signatures(&self) -> &[&'static str];

    /// Which output stream file this handler scans. `None` means the job's
    /// main output stream, under whatever name it is configured (so renaming
    /// the stream in `supervisor.toml` never detaches these handlers from
    /// it); `Some(name)` pins the handler to a fixed auxiliary file.
    fn output_file(&self) -> Option<&'static str> {
        None
    }

    /// Monitor handlers are checked while the process runs; the rest only
    /// after it exits.
    fn is_monitor(&self) -> bool {
        true
    }

    /// True iff any signature occurs as a substring of the accumulated output.
    fn matches(&self, output: &str) -> bool {
        self.signatures().iter().any(|sig| output.contains(sig))
    }

    /// Apply the fix for this condition against the job directory.
    ///
    /// Must persist every touched file (INCAR, ledger) before returning and
    /// return a non-empty human-readable description of what changed. A
    /// missing required input fails with
    /// [`MissingInputError`](crate::job::MissingInputError) before anything
    /// is mutated.
    fn correct(&self, job: &JobDir) -> Result<String>;
}

/// The registry, in scan priority order.
pub fn default_handlers() -> Vec<Box<dyn ErrorHandler>> {
    vec![Box::new(Eddrmm), Box::new(RealOptlay)]
}

/// Delete a checkpoint file if it exists. Absence is fine (the run may never
/// have written one); any other failure aborts the correction.
pub(crate) fn remove_checkpoint(path: &Path) -> Result<bool> {
    use anyhow::Context;
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => {
            Err(err).with_context(|| format!("delete checkpoint {}", path.display()))
        }
    }
}
