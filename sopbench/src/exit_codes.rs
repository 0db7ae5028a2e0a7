//! Stable exit codes for the command-line tools.

/// Command succeeded.
pub const OK: i32 = 0;
/// Unrecoverable error: bad config, task file, descriptor or I/O failure.
pub const INVALID: i32 = 1;
/// Interrupted by SIGINT/SIGTERM; partial results were discarded.
pub const INTERRUPTED: i32 = 130;
