//! Stable exit codes for supervisor CLI commands.

/// Command succeeded (`run` finished with a successful job).
pub const OK: i32 = 0;
/// `supervisor run` finished with a failed job (unmatched error, retry
/// ceiling, handler failure, or abort).
pub const FAILED: i32 = 1;
/// Command failed due to invalid layout/config or other setup errors.
pub const INVALID: i32 = 2;
/// `supervisor scan` found no handler signature in the output stream.
pub const NO_MATCH: i32 = 3;
