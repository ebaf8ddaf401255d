//! Numerical instability in the RMM-DIIS electronic minimizer.
//!
//! VASP reports `WARNING in EDDRMM: call to ZHEGV failed` when the
//! subspace-rotation eigensolver blows up. The RMM-based `Fast` algorithms
//! are the usual culprit, so the first resort is falling back to the stable
//! `Normal` algorithm; if that is already in use, the ionic step size gets
//! halved instead. When the run is not restarting from a converged charge
//! density (ICHARG < 10), stale CHGCAR/WAVECAR files are removed so the
//! relaunch starts cold.

use anyhow::Result;
use tracing::debug;

use crate::handlers::{ErrorHandler, remove_checkpoint};
use crate::incar::Incar;
use crate::job::JobDir;

const SIGNATURES: &[&str] = &["WARNING in EDDRMM: call to ZHEGV failed"];

/// ICHARG values of 10+ mean "keep the charge density fixed"; below that the
/// checkpoint files are stale after a failed step.
const ICHARG_CLEAN_RESTART_MAX: i64 = 10;

pub struct Eddrmm;

impl ErrorHandler for Eddrmm {
    fn id(&self) -> &'static str {
        "eddrmm"
    }

    fn signatures(&self) -> &[&'static str] {
        SIGNATURES
    }

    fn correct(&self, job: &JobDir) -> Result<String> {
        let incar_path = job.incar();
        let mut incar = Incar::load(&incar_path)?;

        let algo = incar.get_str("ALGO", "Normal");
        let mut description = if matches!(algo.as_str(), "Fast" | "VeryFast") {
            incar.set("ALGO", "Normal");
            "switched ALGO to Normal".to_string()
        } else {
            let old_potim = incar.get_f64("POTIM", 0.5);
            let new_potim = old_potim / 2.0;
            incar.set("POTIM", new_potim);
            format!("switched POTIM from {old_potim} to {new_potim}")
        };

        if incar.get_i64("ICHARG", 0) < ICHARG_CLEAN_RESTART_MAX {
            remove_checkpoint(&job.chgcar())?;
            remove_checkpoint(&job.wavecar())?;
            description.push_str(" and deleted CHGCAR + WAVECAR");
        }

        incar.save(&incar_path)?;
        debug!(description, "eddrmm correction applied");
        Ok(description)
    }
}
