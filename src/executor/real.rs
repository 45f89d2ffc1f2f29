//! Real command executor implementation.
//!
//! This module provides [`RealCommandExecutor`], which executes commands
//! using `std::process::Command`, streaming output to the log while it is
//! captured for the caller.

use std::process::{Child, Command, Stdio};
use std::thread;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use which::which;

use super::pipe::{StreamType, panic_message, read_pipe_to_log};
use super::{CommandExecutor, CommandResult, CommandSpec};
use crate::error::RspuppetError;

/// Kills a child process and joins its reader threads.
///
/// Called from error paths in [`RealCommandExecutor::execute()`] so that a
/// failed spawn or wait never leaks a process or a thread.
fn cleanup_child_process<I>(child: &mut Child, handles: I)
where
    I: IntoIterator<Item = JoinHandle<String>>,
{
    let pid = child.id();
    if let Err(e) = child.kill() {
        tracing::debug!(pid = pid, "kill returned error (process may have already exited): {}", e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = pid, "failed to wait for child process after kill: {}", e);
    }
    for handle in handles {
        if let Err(e) = handle.join() {
            tracing::warn!("reader thread panicked during cleanup: {}", panic_message(&*e));
        }
    }
}

fn spawn_reader<R>(
    name: &str,
    pipe: Option<R>,
    stream_type: StreamType,
) -> std::io::Result<JoinHandle<String>>
where
    R: std::io::Read + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || read_pipe_to_log(pipe, stream_type))
}

/// Command executor that runs actual system commands.
///
/// When `dry_run` is true, commands are logged but not executed,
/// and `execute()` returns a [`CommandResult`] without a status.
pub struct RealCommandExecutor {
    pub dry_run: bool,
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<CommandResult> {
        if self.dry_run {
            tracing::info!("dry run: {}", super::format_command_args(&spec.argv()));
            return Ok(CommandResult::from_status(None));
        }

        let cmd =
            which(&spec.command).with_context(|| format!("command not found: {}", spec.command))?;
        tracing::trace!("command found: {}: {}", spec.command, cmd.to_string_lossy());

        let mut command = Command::new(cmd);
        command.args(&spec.args);

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().with_context(|| {
            format!("failed to spawn command `{}` with args {:?}", spec.command, spec.args)
        })?;

        tracing::trace!("spawned command: {}: pid={}", spec.command, child.id());

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let stdout_handle = match spawn_reader("stdout-reader", stdout_pipe, StreamType::Stdout) {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, []);
                return Err(RspuppetError::execution(
                    &spec.argv(),
                    format!("failed to spawn stdout reader thread: {}", e),
                )
                .into());
            }
        };

        let stderr_handle = match spawn_reader("stderr-reader", stderr_pipe, StreamType::Stderr) {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, [stdout_handle]);
                return Err(RspuppetError::execution(
                    &spec.argv(),
                    format!("failed to spawn stderr reader thread: {}", e),
                )
                .into());
            }
        };

        let status = match child.wait() {
            Ok(s) => s,
            Err(e) => {
                cleanup_child_process(&mut child, [stdout_handle, stderr_handle]);
                return Err(RspuppetError::execution(
                    &spec.argv(),
                    format!("failed to wait for command: {}", e),
                )
                .into());
            }
        };

        let mut panicked_streams = Vec::new();
        let mut captured = [String::new(), String::new()];
        let handles = [("stdout", stdout_handle), ("stderr", stderr_handle)];
        for (slot, (name, handle)) in captured.iter_mut().zip(handles) {
            match handle.join() {
                Ok(text) => *slot = text,
                Err(e) => {
                    let msg = panic_message(&*e);
                    tracing::error!(stream = name, panic = msg, "reader thread panicked");
                    panicked_streams.push(format!("{}: {}", name, msg));
                }
            }
        }

        if !panicked_streams.is_empty() {
            return Err(RspuppetError::execution(
                &spec.argv(),
                format!(
                    "reader thread(s) panicked during command execution: {}",
                    panicked_streams.join(", ")
                ),
            )
            .into());
        }

        tracing::trace!("executed command: {}: success={}", spec.command, status.success());

        let [stdout, stderr] = captured;
        Ok(CommandResult {
            status: Some(status),
            stdout,
            stderr,
        })
    }
}
