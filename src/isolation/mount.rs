//! Pseudo-filesystem mounts for the chroot scope.
//!
//! This module provides [`RootfsMounts`], an RAII guard that manages the
//! mounts a chroot needs. Mounts are set up in order and torn down in
//! reverse order, with guaranteed cleanup via `Drop`.

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::error::RspuppetError;
use crate::executor::{CommandExecutor, CommandSpec};

/// A single mount inside the rootfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mount source (device, filesystem name or host path for bind mounts)
    pub source: String,
    /// Absolute target path as seen from inside the chroot
    pub target: Utf8PathBuf,
    /// Options passed to `mount` before the source (e.g. `-t proc`, `--bind`)
    pub options: Vec<String>,
}

impl MountEntry {
    fn new(source: &str, target: &str, options: &[&str]) -> Self {
        Self {
            source: source.to_string(),
            target: target.into(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    /// Mounts needed by package managers and puppet inside a chroot.
    pub fn pseudo_filesystems() -> Vec<Self> {
        vec![
            Self::new("proc", "/proc", &["-t", "proc"]),
            Self::new("sysfs", "/sys", &["-t", "sysfs"]),
            Self::new("/dev", "/dev", &["--bind"]),
            Self::new("devpts", "/dev/pts", &["-t", "devpts"]),
        ]
    }

    fn absolute_target(&self, rootfs: &Utf8Path) -> Utf8PathBuf {
        rootfs.join(self.target.strip_prefix("/").unwrap_or(&self.target))
    }

    /// Builds the `mount` command for this entry.
    pub fn build_mount_spec(&self, rootfs: &Utf8Path) -> CommandSpec {
        let mut args = self.options.clone();
        args.push(self.source.clone());
        args.push(self.absolute_target(rootfs).into_string());
        CommandSpec::new("mount", args)
    }

    /// Builds the `umount` command for this entry.
    pub fn build_umount_spec(&self, rootfs: &Utf8Path) -> CommandSpec {
        CommandSpec::new("umount", vec![self.absolute_target(rootfs).into_string()])
    }
}

/// Validates that no component of the target path within rootfs is a symlink.
///
/// A symlinked mount point inside the image could redirect a mount onto
/// the host filesystem.
fn validate_no_symlinks(rootfs: &Utf8Path, target: &Utf8Path) -> Result<()> {
    let relative = target.strip_prefix("/").unwrap_or(target);
    let mut current = rootfs.to_path_buf();

    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(RspuppetError::Scope(format!(
                        "symlink detected at {} in rootfs mount target path {}",
                        current, target,
                    ))
                    .into());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => {
                return Err(RspuppetError::io(
                    format!("failed to check mount target path component: {}", current),
                    e,
                )
                .into());
            }
        }
    }

    Ok(())
}

/// RAII guard for filesystem mounts within a rootfs.
pub struct RootfsMounts {
    rootfs: Utf8PathBuf,
    entries: Vec<MountEntry>,
    mounted: Vec<bool>,
    executor: Arc<dyn CommandExecutor>,
    dry_run: bool,
    torn_down: bool,
}

impl RootfsMounts {
    /// Creates a new `RootfsMounts` instance.
    ///
    /// No mounts are performed until [`mount()`](Self::mount) is called.
    pub fn new(
        rootfs: &Utf8Path,
        entries: Vec<MountEntry>,
        executor: Arc<dyn CommandExecutor>,
        dry_run: bool,
    ) -> Self {
        let mounted = vec![false; entries.len()];
        Self {
            rootfs: rootfs.to_owned(),
            entries,
            mounted,
            executor,
            dry_run,
            torn_down: false,
        }
    }

    fn mounted_count(&self) -> usize {
        self.mounted.iter().filter(|&&m| m).count()
    }

    /// Mounts all entries in order.
    ///
    /// Creates mount point directories as needed (skipped in dry-run mode).
    /// On failure, unmounts whatever was already mounted.
    pub fn mount(&mut self) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }

        info!("mounting {} filesystem(s) in rootfs", self.entries.len());

        for i in 0..self.entries.len() {
            let entry = &self.entries[i];
            let abs_target = entry.absolute_target(&self.rootfs);

            if !self.dry_run {
                if let Err(e) = validate_no_symlinks(&self.rootfs, &entry.target) {
                    return Err(self.cleanup_after_error(e));
                }
                if let Err(e) = fs::create_dir_all(&abs_target) {
                    return Err(self.cleanup_after_error(
                        RspuppetError::io(
                            format!("failed to create mount point: {}", abs_target),
                            e,
                        )
                        .into(),
                    ));
                }
            }

            tracing::debug!("mounting {} on {}", entry.source, entry.target);
            let spec = entry.build_mount_spec(&self.rootfs);
            match self.executor.execute(&spec) {
                Ok(result) if result.success() => {
                    self.mounted[i] = true;
                }
                Ok(result) => {
                    let status = result
                        .status
                        .map_or_else(|| "unknown".to_string(), |s| s.to_string());
                    return Err(self.cleanup_after_error(
                        RspuppetError::execution(&spec.argv(), status).into(),
                    ));
                }
                Err(e) => {
                    return Err(self.cleanup_after_error(e));
                }
            }
        }

        Ok(())
    }

    fn cleanup_after_error(&mut self, error: anyhow::Error) -> anyhow::Error {
        if let Err(unmount_err) = self.unmount_internal() {
            tracing::error!("failed to unmount filesystems during cleanup: {:#}", unmount_err);
        }
        error
    }

    /// Unmounts all mounted entries in reverse order.
    ///
    /// Idempotent after a successful unmount. After a failure, a retry only
    /// attempts the entries that are still mounted.
    pub fn unmount(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        let result = self.unmount_internal();
        if result.is_ok() {
            self.torn_down = true;
        }
        result
    }

    fn unmount_internal(&mut self) -> Result<()> {
        let count = self.mounted_count();
        if count == 0 {
            return Ok(());
        }

        info!("unmounting {} filesystem(s) from rootfs", count);

        let mut errors = Vec::new();

        for i in (0..self.entries.len()).rev() {
            if !self.mounted[i] {
                continue;
            }
            let entry = &self.entries[i];
            let spec = entry.build_umount_spec(&self.rootfs);
            match self.executor.execute(&spec) {
                Ok(result) if result.success() => {
                    self.mounted[i] = false;
                }
                Ok(result) => {
                    let status = result
                        .status
                        .map_or_else(|| "unknown".to_string(), |s| s.to_string());
                    errors.push(format!("umount {} failed: {}", entry.target, status));
                }
                Err(e) => {
                    errors.push(format!("umount {} failed: {}", entry.target, e));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RspuppetError::Scope(format!(
                "failed to unmount {} filesystem(s): {}",
                errors.len(),
                errors.join("; ")
            ))
            .into())
        }
    }
}

impl Drop for RootfsMounts {
    fn drop(&mut self) {
        if !self.torn_down
            && self.mounted.iter().any(|&m| m)
            && let Err(e) = self.unmount()
        {
            tracing::error!(
                "failed to unmount {} filesystem(s) during cleanup: {:#}. \
                Manual cleanup may be required: findmnt | grep {}",
                self.mounted_count(),
                e,
                self.rootfs
            );
        }
    }
}
