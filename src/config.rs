//! Build context loading and validation.
//!
//! The build context is the pipeline-supplied configuration of one
//! provisioning run. It is loaded from a YAML profile, optionally
//! overridden from the command line, and passed by reference into each
//! component. Only [`PackageContext::attributes`] is ever written, and only
//! by the metadata recorder.

use std::fs::File;
use std::io::BufReader;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::certs::DEFAULT_SSL_SOURCE;
use crate::command::DEFAULT_APPLY_ARGS;
use crate::error::RspuppetError;
use crate::mode::RunMode;
use crate::package::OsFamily;

/// Build context of a provisioning run.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BuildContext {
    /// Path where the target image is mounted
    pub mount_root: Utf8PathBuf,
    /// OS family of the image; detected from the mount root when absent
    #[serde(default)]
    pub os_family: Option<OsFamily>,
    /// Mount /proc, /sys and /dev inside the chroot (default: true)
    #[serde(default = "default_true")]
    pub mount_pseudo_filesystems: bool,
    /// Package identity driving this build
    #[serde(default)]
    pub package: PackageContext,
    /// Puppet options
    #[serde(default)]
    pub puppet: PuppetConfig,
}

fn default_true() -> bool {
    true
}

/// Package section of the build context.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageContext {
    /// Identity of the build; also the puppet certname
    #[serde(default)]
    pub arg: String,
    /// Attributes recorded after a successful run, used for image tagging
    #[serde(skip)]
    pub attributes: Option<PackageAttributes>,
}

/// Package attributes recorded for image tagging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageAttributes {
    pub name: String,
    pub version: String,
    pub release: String,
}

/// Puppet section of the build context.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PuppetConfig {
    /// Puppet master to run the agent against (master mode)
    #[serde(default)]
    pub master_hostname: Option<String>,
    /// Manifest file or archive to apply (apply mode)
    #[serde(default)]
    pub manifests: Option<Utf8PathBuf>,
    /// Extra arguments for `puppet apply`
    #[serde(default)]
    pub apply_args: Option<String>,
    /// Host-side ssl tree certificates are staged from
    #[serde(default)]
    pub ssl_source: Option<Utf8PathBuf>,
}

impl PuppetConfig {
    /// Returns the configured apply arguments or the default.
    pub fn apply_args(&self) -> &str {
        self.apply_args.as_deref().unwrap_or(DEFAULT_APPLY_ARGS)
    }

    /// Returns the configured ssl source or the default.
    pub fn ssl_source(&self) -> &Utf8Path {
        self.ssl_source
            .as_deref()
            .unwrap_or(Utf8Path::new(DEFAULT_SSL_SOURCE))
    }
}

impl BuildContext {
    /// Creates a context for `mount_root` with default options.
    pub fn new(mount_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
            os_family: None,
            mount_pseudo_filesystems: true,
            package: PackageContext::default(),
            puppet: PuppetConfig::default(),
        }
    }

    /// Resolves relative paths against `base_dir` (usually the profile's directory).
    pub fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        for path in [
            Some(&mut self.mount_root),
            self.puppet.manifests.as_mut(),
            self.puppet.ssl_source.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base_dir.join(&*path);
            }
        }
    }

    /// Returns the OS family, detecting it from the mount root if not configured.
    pub fn os_family(&self) -> OsFamily {
        self.os_family
            .unwrap_or_else(|| OsFamily::detect(&self.mount_root))
    }

    /// Validates the context without touching the filesystem.
    ///
    /// Returns the run mode that will be used.
    pub fn validate(&self) -> Result<RunMode, RspuppetError> {
        if self.mount_root.as_str().is_empty() {
            return Err(RspuppetError::Configuration(
                "mount_root must not be empty".to_string(),
            ));
        }
        let mode = RunMode::select(&self.puppet)?;
        match mode {
            RunMode::Master => {
                if self.package.arg.trim().is_empty() {
                    return Err(RspuppetError::Configuration(
                        "package.arg (the certname) is required in master mode".to_string(),
                    ));
                }
                if self
                    .puppet
                    .master_hostname
                    .as_deref()
                    .is_some_and(|h| h.trim().is_empty())
                {
                    return Err(RspuppetError::Configuration(
                        "puppet.master_hostname must not be empty".to_string(),
                    ));
                }
            }
            RunMode::Apply => {
                if self
                    .puppet
                    .manifests
                    .as_deref()
                    .is_some_and(|m| m.as_str().is_empty())
                {
                    return Err(RspuppetError::Configuration(
                        "puppet.manifests must not be empty".to_string(),
                    ));
                }
            }
        }
        Ok(mode)
    }
}

/// Loads a build context from a YAML profile.
///
/// Relative paths in the profile are resolved against the profile's directory.
pub fn load_context(path: &Utf8Path) -> Result<BuildContext, RspuppetError> {
    let file = File::open(path)
        .map_err(|e| RspuppetError::io(format!("failed to load file: {}", path), e))?;
    let reader = BufReader::new(file);
    let mut context: BuildContext = serde_yaml::from_reader(reader).map_err(|e| {
        RspuppetError::Configuration(format!("failed to parse yaml: {}: {}", path, e))
    })?;

    let base_dir = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_owned(),
        _ => Utf8PathBuf::from("."),
    };
    context.resolve_paths(&base_dir);
    Ok(context)
}
