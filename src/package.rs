//! OS family detection and package-manager operations.
//!
//! The OS family of the target filesystem is selected once and yields a
//! [`PackageManager`] that knows how to refresh metadata and install a
//! package. Both operations run inside the chroot.

use anyhow::Result;
use camino::Utf8Path;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info};

use crate::error::RspuppetError;
use crate::isolation::IsolationContext;

/// OS family of the target filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OsFamily {
    /// Debian, Ubuntu and derivatives (apt).
    #[default]
    Debian,
    /// Red Hat, CentOS, Fedora and derivatives (yum).
    Redhat,
}

impl OsFamily {
    /// Detects the OS family from release files under `mount_root`.
    ///
    /// `etc/redhat-release` selects Red Hat, `etc/debian_version` selects
    /// Debian. Anything else falls back to Debian.
    pub fn detect(mount_root: &Utf8Path) -> Self {
        if mount_root.join("etc/redhat-release").is_file() {
            debug!("found etc/redhat-release under {}", mount_root);
            Self::Redhat
        } else {
            if !mount_root.join("etc/debian_version").is_file() {
                debug!("no release file found under {}, assuming debian", mount_root);
            }
            Self::Debian
        }
    }

    /// Returns the package manager for this OS family.
    pub fn package_manager(self) -> Box<dyn PackageManager> {
        match self {
            Self::Debian => Box::new(AptGet),
            Self::Redhat => Box::new(Yum),
        }
    }
}

/// Package-manager capability used to make puppet available in the chroot.
pub trait PackageManager: Send + Sync {
    /// Returns the name of the package manager.
    fn name(&self) -> &'static str;

    /// Builds the command that refreshes package metadata.
    fn update_metadata(&self) -> Vec<String>;

    /// Builds the command that installs `package`.
    fn install_package(&self, package: &str) -> Vec<String>;

    /// Environment both commands run with.
    fn environment(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Refreshes metadata and installs `package` inside the given context.
    ///
    /// Any non-zero exit is an [`RspuppetError::Execution`] error and stops
    /// the sequence.
    fn ensure_installed(&self, context: &dyn IsolationContext, package: &str) -> Result<()> {
        info!("installing {} with {}", package, self.name());
        let env = self.environment();
        for command in [self.update_metadata(), self.install_package(package)] {
            let result = context.execute_with_env(&command, &env)?;
            if !result.success() {
                let status = result
                    .status
                    .map_or_else(|| "no exit status".to_string(), |s| s.to_string());
                return Err(RspuppetError::execution(&command, status).into());
            }
        }
        Ok(())
    }
}

/// apt-based package manager: update, then install.
///
/// Runs with `DEBIAN_FRONTEND=noninteractive` so debconf never waits for input.
#[derive(Debug, Default, Clone)]
pub struct AptGet;

impl PackageManager for AptGet {
    fn name(&self) -> &'static str {
        "apt-get"
    }

    fn update_metadata(&self) -> Vec<String> {
        vec!["apt-get".to_string(), "update".to_string()]
    }

    fn install_package(&self, package: &str) -> Vec<String> {
        ["apt-get", "-y", "install", package]
            .map(String::from)
            .to_vec()
    }

    fn environment(&self) -> Vec<(String, String)> {
        vec![("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())]
    }
}

/// yum-based package manager: clean metadata, then install.
#[derive(Debug, Default, Clone)]
pub struct Yum;

impl PackageManager for Yum {
    fn name(&self) -> &'static str {
        "yum"
    }

    fn update_metadata(&self) -> Vec<String> {
        ["yum", "clean", "metadata"].map(String::from).to_vec()
    }

    fn install_package(&self, package: &str) -> Vec<String> {
        ["yum", "-y", "install", package].map(String::from).to_vec()
    }
}
