pub mod certs;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod isolation;
pub mod manifest;
pub mod metadata;
pub mod mode;
pub mod outcome;
pub mod package;
pub mod provision;

use std::fs;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::CommandFactory;
use tracing::info;
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

pub use error::RspuppetError;

use crate::config::{BuildContext, PackageAttributes};
use crate::executor::CommandExecutor;
use crate::isolation::{ChrootProvider, IsolationProvider};
use crate::outcome::Outcome;
use crate::provision::PuppetProvisioner;

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// Loads the profile, applies command-line overrides and validates the result.
fn load_build_context(
    file: &camino::Utf8Path,
    overrides: &cli::ContextOverrides,
) -> Result<BuildContext> {
    let mut context = config::load_context(file)
        .with_context(|| format!("failed to load profile from {}", file))?;
    overrides.apply_to(&mut context);
    context.validate().context("profile validation failed")?;
    Ok(context)
}

fn chroot_provider(context: &BuildContext) -> Box<dyn IsolationProvider> {
    if context.mount_pseudo_filesystems {
        Box::new(ChrootProvider::default())
    } else {
        Box::new(ChrootProvider::without_mounts())
    }
}

fn write_attributes(path: &camino::Utf8Path, attributes: &PackageAttributes) -> Result<()> {
    let yaml = serde_yaml::to_string(attributes).context("failed to serialize attributes")?;
    let mut file = fs::File::create(path)
        .map_err(|e| RspuppetError::io(format!("failed to create {}", path), e))?;
    file.write_all(yaml.as_bytes())
        .map_err(|e| RspuppetError::io(format!("failed to write {}", path), e))?;
    info!("wrote package attributes to {}", path);
    Ok(())
}

pub fn run_provision(
    opts: &cli::ProvisionArgs,
    executor: Arc<dyn CommandExecutor>,
) -> Result<Outcome> {
    let mut context = load_build_context(&opts.file, &opts.overrides)?;

    let provisioner = PuppetProvisioner::new(chroot_provider(&context), executor, opts.dry_run);
    let outcome = provisioner.provision(&mut context)?;

    if let (Some(path), Some(attributes)) = (&opts.attributes_out, &context.package.attributes) {
        if opts.dry_run {
            info!("dry run: would write package attributes to {}", path);
        } else {
            write_attributes(path, attributes)?;
        }
    }

    info!("provisioning completed successfully: {}", outcome);
    Ok(outcome)
}

pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let context = load_build_context(&opts.file, &opts.overrides)?;
    let mode = context.validate()?;
    info!("validation successful ({} mode):\n{:#?}", mode, context);
    Ok(())
}

pub fn run_completions(opts: &cli::CompletionsArgs, out: &mut dyn Write) {
    let mut cmd = cli::Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(opts.shell, &mut cmd, name, out);
}
