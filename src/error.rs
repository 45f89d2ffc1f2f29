//! Domain-specific error types for rspuppet.
//!
//! This module defines `RspuppetError`, a `thiserror`-based enum that
//! provides typed error variants for each failure class of a provisioning
//! run. Public API functions return `Result<T, RspuppetError>` for
//! programmatic error handling, while trait boundaries continue to use
//! `anyhow::Result`.
//!
//! `RspuppetError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at trait boundaries that return `anyhow::Result`.

use std::io;

use crate::outcome::Outcome;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent, user-friendly messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)"). For unrecognized
/// error kinds, falls back to including the OS-level error message.
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Domain-specific error type for rspuppet.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RspuppetError {
    /// No usable run mode, or an invalid profile.
    ///
    /// Always surfaced before any filesystem mutation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Certificates or manifests could not be staged into the mount root.
    #[error("staging error: {0}")]
    Staging(String),

    /// The chroot scope could not be entered or released.
    #[error("scope error: {0}")]
    Scope(String),

    /// A command could not be run or exited unsuccessfully
    /// (package manager, certificate generation, spawn/wait failures).
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command that was executed.
        command: String,
        /// Exit status or a description of the internal failure.
        status: String,
    },

    /// Puppet ran but its detailed exit code reports failures.
    #[error("puppet run failed: {outcome}{}", format_stderr(stderr))]
    ToolFailure {
        /// Raw exit code, absent when the process was killed by a signal.
        exit_code: Option<i32>,
        /// Classified outcome of the run.
        outcome: Outcome,
        /// Captured standard error of the puppet run.
        stderr: String,
    },

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred (usually includes a path).
        context: String,
        /// Human-readable description derived from [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error, preserved for programmatic inspection.
        #[source]
        source: io::Error,
    },
}

fn format_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

impl RspuppetError {
    /// Creates an `Io` variant with the `message` field derived from `source`.
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Creates an `Execution` variant from an argv slice and a status description.
    pub(crate) fn execution(command: &[String], status: impl Into<String>) -> Self {
        Self::Execution {
            command: crate::executor::format_command_args(command),
            status: status.into(),
        }
    }
}
