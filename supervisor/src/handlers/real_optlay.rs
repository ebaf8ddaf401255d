//! Real-space projector failures (`RSPHER`, `REAL_OPTLAY`, `SBESSELITER`).
//!
//! All of these diagnostics share one family of fixes around `LREAL`, the
//! real-space-projection setting. Small cells give up on real-space
//! projection immediately; large cells (where reciprocal space is expensive)
//! escalate through the ledger: first retry with `LREAL = .TRUE.`, then
//! disable it. Past that point no further setting change exists; the ledger
//! still counts the attempt and the supervisor's retry ceiling ends the loop.

use anyhow::Result;
use tracing::debug;

use crate::error_counts::ErrorCounts;
use crate::handlers::ErrorHandler;
use crate::incar::Incar;
use crate::job::JobDir;
use crate::poscar;

const SIGNATURES: &[&str] = &[
    "ERROR RSPHER",
    "REAL_OPTLAY: internal error",
    "REAL_OPT: internal ERROR",
    "ERROR: SBESSELITER : nicht konvergent",
];

/// Cells with at least this many atoms get the escalating treatment.
const NATOMS_LARGE_CELL: usize = 100;

pub struct RealOptlay;

impl ErrorHandler for RealOptlay {
    fn id(&self) -> &'static str {
        "real_optlay"
    }

    fn signatures(&self) -> &[&'static str] {
        SIGNATURES
    }

    fn correct(&self, job: &JobDir) -> Result<String> {
        let incar_path = job.incar();
        let mut incar = Incar::load(&incar_path)?;
        // Required input; fails before anything is mutated.
        let natoms = poscar::atom_count(&job.poscar())?;

        let description;
        if natoms < NATOMS_LARGE_CELL {
            incar.set("LREAL", false);
            description = "set LREAL to .FALSE.".to_string();
        } else {
            let mut counts = ErrorCounts::load(&job.error_counts())?;
            description = match counts.count(self.id()) {
                0 => {
                    // In-between option before giving up on real space.
                    incar.set("LREAL", true);
                    "set LREAL to .TRUE.".to_string()
                }
                1 => {
                    incar.set("LREAL", false);
                    "set LREAL to .FALSE.".to_string()
                }
                _ => "no further real-space correction available".to_string(),
            };
            let attempt = counts.increment(self.id());
            counts.save(&job.error_counts())?;
            debug!(natoms, attempt, "large-cell real-space escalation");
        }

        incar.save(&incar_path)?;
        Ok(description)
    }
}
