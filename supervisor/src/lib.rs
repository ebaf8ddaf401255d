//! Supervisor for long-running VASP calculations.
//!
//! This crate runs the VASP executable against a job directory, tails its
//! output stream while it runs, recognizes known failure signatures, applies
//! a targeted correction to the input deck, and relaunches, bounded by a
//! global retry ceiling. The architecture separates:
//!
//! - **Stores** ([`incar`], [`poscar`], [`error_counts`]): on-disk state in
//!   the job directory, loaded and saved atomically.
//! - **Handlers** ([`handlers`]): one descriptor + fix per known failure
//!   condition, kept in a single ordered registry so match order is explicit.
//! - **Process layer** ([`process`]): spawn/wait/terminate behind traits so
//!   tests run without a real VASP binary.
//! - **Loop** ([`looping`]): the monitor-detect-correct-retry state
//!   machine, producing a [`job::JobResult`] with the full correction history.

pub mod config;
pub mod error_counts;
pub mod exit_codes;
pub mod handlers;
pub mod incar;
pub mod job;
pub mod logging;
pub mod looping;
pub mod poscar;
pub mod process;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
