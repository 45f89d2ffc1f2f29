//! Chroot isolation implementation.

use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use super::{IsolationContext, IsolationProvider, MountEntry, RootfsMounts};
use crate::error::RspuppetError;
use crate::executor::{CommandExecutor, CommandResult, CommandSpec};

/// Chroot-based isolation provider.
///
/// Entering the scope mounts the pseudo filesystems package managers need
/// (`/proc`, `/sys`, `/dev`, `/dev/pts`) unless disabled, and every command
/// is wrapped in `chroot <rootfs>`.
#[derive(Debug, Clone)]
pub struct ChrootProvider {
    mounts: Vec<MountEntry>,
}

impl ChrootProvider {
    /// Creates a provider that mounts the given entries on setup.
    pub fn new(mounts: Vec<MountEntry>) -> Self {
        Self { mounts }
    }

    /// Creates a provider that mounts nothing.
    pub fn without_mounts() -> Self {
        Self::new(Vec::new())
    }
}

impl Default for ChrootProvider {
    fn default() -> Self {
        Self::new(MountEntry::pseudo_filesystems())
    }
}

impl IsolationProvider for ChrootProvider {
    fn name(&self) -> &'static str {
        "chroot"
    }

    fn setup(
        &self,
        rootfs: &Utf8Path,
        executor: Arc<dyn CommandExecutor>,
        dry_run: bool,
    ) -> Result<Box<dyn IsolationContext>> {
        if !dry_run && !rootfs.is_dir() {
            return Err(RspuppetError::Scope(format!(
                "cannot enter chroot: {} is not a directory",
                rootfs
            ))
            .into());
        }

        info!("entering chroot at {}", rootfs);
        let mut mounts =
            RootfsMounts::new(rootfs, self.mounts.clone(), executor.clone(), dry_run);
        mounts.mount().map_err(|e| {
            RspuppetError::Scope(format!("failed to prepare chroot at {}: {:#}", rootfs, e))
        })?;

        Ok(Box::new(ChrootContext {
            rootfs: rootfs.to_owned(),
            executor,
            mounts,
            torn_down: false,
        }))
    }
}

/// Active chroot scope.
pub struct ChrootContext {
    rootfs: Utf8PathBuf,
    executor: Arc<dyn CommandExecutor>,
    mounts: RootfsMounts,
    torn_down: bool,
}

impl IsolationContext for ChrootContext {
    fn name(&self) -> &'static str {
        "chroot"
    }

    fn execute_with_env(
        &self,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<CommandResult> {
        if self.torn_down {
            return Err(RspuppetError::Scope(
                "cannot execute command: chroot context has already been torn down".to_string(),
            )
            .into());
        }

        let mut args: Vec<String> = Vec::with_capacity(command.len() + 1);
        args.push(self.rootfs.to_string());
        args.extend(command.iter().cloned());

        // chroot passes its environment on to the command it runs.
        let spec = env
            .iter()
            .fold(CommandSpec::new("chroot", args), |spec, (key, value)| {
                spec.with_env(key.as_str(), value.as_str())
            });
        self.executor.execute(&spec)
    }

    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.mounts.unmount().map_err(|e| {
            RspuppetError::Scope(format!("failed to release chroot at {}: {:#}", self.rootfs, e))
        })?;
        self.torn_down = true;
        debug!("exited chroot at {}", self.rootfs);
        Ok(())
    }
}

impl Drop for ChrootContext {
    fn drop(&mut self) {
        if !self.torn_down
            && let Err(e) = self.teardown()
        {
            tracing::warn!("chroot teardown failed: {:#}", e);
        }
    }
}
