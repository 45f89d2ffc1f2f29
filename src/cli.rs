use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::config::BuildContext;
use crate::package::OsFamily;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run puppet against the mounted image described by the profile
    Provision(ProvisionArgs),

    /// Validate the given YAML profile
    Validate(ValidateArgs),

    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// Path to the YAML file defining the build context
    #[arg(short, long, default_value = "profile.yaml")]
    pub file: Utf8PathBuf,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,

    /// Do not run, just show what would be done
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub overrides: ContextOverrides,

    /// Write the recorded package attributes to this YAML file
    #[arg(long, value_name = "PATH")]
    pub attributes_out: Option<Utf8PathBuf>,
}

/// Command-line values that take precedence over the profile.
#[derive(Args, Debug, Default, Clone)]
pub struct ContextOverrides {
    /// Path where the target image is mounted
    #[arg(long, value_name = "PATH")]
    pub mount_root: Option<Utf8PathBuf>,

    /// Package identity of the build (also the puppet certname)
    #[arg(long, value_name = "NAME")]
    pub package: Option<String>,

    /// OS family of the image (detected when omitted)
    #[arg(long, value_name = "FAMILY")]
    pub os_family: Option<OsFamily>,

    /// Run `puppet agent` against this puppet master
    #[arg(long, value_name = "HOST", conflicts_with = "puppet_manifests")]
    pub puppet_master_hostname: Option<String>,

    /// Run `puppet apply` with this manifest file or archive
    #[arg(long, value_name = "PATH")]
    pub puppet_manifests: Option<Utf8PathBuf>,

    /// Extra arguments for `puppet apply`
    #[arg(long, value_name = "ARGS", requires = "puppet_manifests", allow_hyphen_values = true)]
    pub puppet_apply_args: Option<String>,
}

impl ContextOverrides {
    /// Applies the overrides to a loaded context.
    ///
    /// A run-mode flag replaces the other mode's input from the profile, so
    /// the command line always decides the mode when given.
    pub fn apply_to(&self, context: &mut BuildContext) {
        if let Some(mount_root) = &self.mount_root {
            context.mount_root = mount_root.clone();
        }
        if let Some(package) = &self.package {
            context.package.arg = package.clone();
        }
        if let Some(family) = self.os_family {
            context.os_family = Some(family);
        }
        if let Some(hostname) = &self.puppet_master_hostname {
            context.puppet.master_hostname = Some(hostname.clone());
            context.puppet.manifests = None;
        }
        if let Some(manifests) = &self.puppet_manifests {
            context.puppet.manifests = Some(manifests.clone());
            context.puppet.master_hostname = None;
        }
        if let Some(apply_args) = &self.puppet_apply_args {
            context.puppet.apply_args = Some(apply_args.clone());
        }
    }
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the YAML file to validate
    #[arg(short, long, default_value = "profile.yaml")]
    pub file: Utf8PathBuf,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,

    #[command(flatten)]
    pub overrides: ContextOverrides,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Represents log levels for controlling the verbosity of logging output.
///
/// Maps directly to the `tracing` levels. `--log-level debug` shows the
/// staging steps, `info` the phase transitions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}
