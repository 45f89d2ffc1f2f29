//! Scoped chroot access to the mounted image.
//!
//! An [`IsolationProvider`] enters the scope for a rootfs and hands out an
//! [`IsolationContext`]. Commands executed through the context run with the
//! rootfs as `/`. The scope is released by [`IsolationContext::teardown`];
//! implementations also release it on `Drop` when teardown was never called.

use std::sync::Arc;

use anyhow::Result;
use camino::Utf8Path;

use crate::executor::{CommandExecutor, CommandResult};

pub mod chroot;
pub mod mount;

pub use chroot::{ChrootContext, ChrootProvider};
pub use mount::{MountEntry, RootfsMounts};

/// Enters the isolation scope for a rootfs.
pub trait IsolationProvider: Send + Sync {
    /// Returns the name of this isolation backend.
    fn name(&self) -> &'static str;

    /// Enters the scope for `rootfs` and returns the active context.
    ///
    /// A failure here must leave nothing mounted.
    fn setup(
        &self,
        rootfs: &Utf8Path,
        executor: Arc<dyn CommandExecutor>,
        dry_run: bool,
    ) -> Result<Box<dyn IsolationContext>>;
}

/// An active isolation scope.
pub trait IsolationContext {
    /// Returns the name of this isolation backend.
    fn name(&self) -> &'static str;

    /// Executes `command` (argv, `command[0]` is the program) inside the scope.
    fn execute(&self, command: &[String]) -> Result<CommandResult> {
        self.execute_with_env(command, &[])
    }

    /// Executes `command` inside the scope with extra environment variables.
    fn execute_with_env(
        &self,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<CommandResult>;

    /// Releases the scope. Calling it again is a no-op.
    fn teardown(&mut self) -> Result<()>;
}
