//! Classification of puppet's `--detailed-exitcodes` convention.
//!
//! Puppet encodes "changes were made" (bit 1) and "failures occurred"
//! (bit 2) independently in its exit code. This module is the only place
//! that interprets those codes.

use std::fmt;

use crate::executor::CommandResult;

/// Outcome of a puppet run, derived from its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Exit code 0: the run succeeded without changes.
    NoChanges,
    /// Exit code 2: the run succeeded and applied changes.
    Changes,
    /// Exit code 4: the run had failures.
    Failures,
    /// Exit code 6: changes were applied and failures occurred.
    ChangesAndFailures,
    /// Any other exit code.
    Unexpected(i32),
    /// The process exited without an exit code (e.g. killed by a signal).
    Terminated,
}

impl Outcome {
    /// Maps a detailed exit code to an outcome.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Self::NoChanges,
            2 => Self::Changes,
            4 => Self::Failures,
            6 => Self::ChangesAndFailures,
            other => Self::Unexpected(other),
        }
    }

    /// Classifies a captured command result.
    ///
    /// A result without a status is a dry run when `dry_run` is set and is
    /// treated as [`Outcome::NoChanges`]; otherwise the process was terminated.
    pub fn from_result(result: &CommandResult, dry_run: bool) -> Self {
        match result.status {
            Some(status) => status.code().map_or(Self::Terminated, Self::from_exit_code),
            None if dry_run => Self::NoChanges,
            None => Self::Terminated,
        }
    }

    /// Returns true when the provisioning pipeline may continue.
    pub fn is_success(self) -> bool {
        matches!(self, Self::NoChanges | Self::Changes)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChanges => f.write_str("no changes (exit code 0)"),
            Self::Changes => f.write_str("changes applied (exit code 2)"),
            Self::Failures => f.write_str("failures (exit code 4)"),
            Self::ChangesAndFailures => f.write_str("changes and failures (exit code 6)"),
            Self::Unexpected(code) => write!(f, "unexpected exit code {}", code),
            Self::Terminated => f.write_str("terminated without exit code"),
        }
    }
}
