//! Puppet provisioning of a mounted image.
//!
//! A run selects the mode, stages its inputs into the mount root, enters the
//! chroot scope, makes puppet available with the image's package manager,
//! runs puppet once and classifies the result. The scope is released
//! exactly once on every path, and staged certificates are removed before
//! it is released. Package attributes are recorded only when the run
//! succeeds.

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8Path;
use chrono::Local;
use tracing::{debug, error, info};

use crate::certs::StagedCerts;
use crate::command::{PUPPET_BINARY, PuppetCommand};
use crate::config::BuildContext;
use crate::error::RspuppetError;
use crate::executor::{CommandExecutor, CommandResult, CommandSpec};
use crate::isolation::{IsolationContext, IsolationProvider};
use crate::manifest::{StagedManifest, stage_manifest};
use crate::metadata::record_package_metadata;
use crate::mode::RunMode;
use crate::outcome::Outcome;
use crate::package::OsFamily;

/// Inputs staged into the mount root before the scope is entered.
enum StagedInputs {
    Certificates { certname: String, server: String, certs: StagedCerts },
    Manifest { apply_args: String, manifest: StagedManifest },
}

impl StagedInputs {
    fn command(&self) -> PuppetCommand<'_> {
        match self {
            Self::Certificates {
                certname, server, ..
            } => PuppetCommand::Agent { certname, server },
            Self::Manifest { apply_args, manifest } => PuppetCommand::Apply {
                apply_args,
                target: manifest.apply_target(),
            },
        }
    }

    /// Removes whatever must not stay in the image. Only certificates do.
    fn release(self) -> Result<(), RspuppetError> {
        match self {
            Self::Certificates { certs, .. } => certs.remove(),
            Self::Manifest { .. } => Ok(()),
        }
    }
}

/// Runs puppet against a mounted image.
pub struct PuppetProvisioner {
    provider: Box<dyn IsolationProvider>,
    executor: Arc<dyn CommandExecutor>,
    dry_run: bool,
}

impl PuppetProvisioner {
    /// Creates a provisioner entering scopes with `provider` and running
    /// commands through `executor`.
    pub fn new(
        provider: Box<dyn IsolationProvider>,
        executor: Arc<dyn CommandExecutor>,
        dry_run: bool,
    ) -> Self {
        Self {
            provider,
            executor,
            dry_run,
        }
    }

    /// Provisions the image described by `context`.
    ///
    /// On success the package attributes are recorded on `context` and the
    /// outcome is returned. A puppet run reporting failures is an
    /// [`RspuppetError::ToolFailure`]; the attributes are then left unset.
    pub fn provision(&self, context: &mut BuildContext) -> Result<Outcome> {
        let mode = context.validate()?;
        info!("provisioning {} with puppet in {} mode", context.mount_root, mode);

        let inputs = self.stage_inputs(context, mode)?;
        let outcome = self.run_scoped(&context.mount_root, context.os_family(), inputs)?;

        info!("puppet run finished: {}", outcome);
        record_package_metadata(context, Local::now());
        Ok(outcome)
    }

    fn stage_inputs(&self, context: &BuildContext, mode: RunMode) -> Result<StagedInputs> {
        let mount_root = &context.mount_root;
        let puppet = &context.puppet;
        match (mode, &puppet.master_hostname, &puppet.manifests) {
            (RunMode::Master, Some(server), _) => {
                let certname = context.package.arg.as_str();
                self.generate_certificate(certname)?;
                debug!("staging certificates for {} from {}", certname, puppet.ssl_source());
                let certs =
                    StagedCerts::stage(mount_root, certname, puppet.ssl_source(), self.dry_run)?;
                Ok(StagedInputs::Certificates {
                    certname: certname.to_string(),
                    server: server.clone(),
                    certs,
                })
            }
            (RunMode::Apply, _, Some(manifests)) => {
                debug!("staging manifest {}", manifests);
                let manifest = stage_manifest(mount_root, manifests, self.dry_run)?;
                Ok(StagedInputs::Manifest {
                    apply_args: puppet.apply_args().to_string(),
                    manifest,
                })
            }
            _ => Err(RspuppetError::Configuration(format!(
                "{} mode selected without its input",
                mode
            ))
            .into()),
        }
    }

    /// Generates the node certificate on the host with `puppetca`.
    fn generate_certificate(&self, certname: &str) -> Result<()> {
        let command = PuppetCommand::GenerateCertificate { certname };
        let argv = command.argv();
        info!("generating certificate for {}", certname);
        let spec = CommandSpec::from_argv(&argv)
            .ok_or_else(|| RspuppetError::Configuration("empty command".to_string()))?;
        let result = self
            .executor
            .execute(&spec)
            .with_context(|| format!("failed to execute {}", command.label()))?;
        if !result.success() {
            let status = result
                .status
                .map_or_else(|| "no exit status".to_string(), |s| s.to_string());
            return Err(RspuppetError::execution(&argv, status).into());
        }
        Ok(())
    }

    fn run_scoped(
        &self,
        mount_root: &Utf8Path,
        os_family: OsFamily,
        inputs: StagedInputs,
    ) -> Result<Outcome> {
        info!("entering {} scope at {}", self.provider.name(), mount_root);
        let mut scope = match self
            .provider
            .setup(mount_root, self.executor.clone(), self.dry_run)
        {
            Ok(scope) => scope,
            Err(e) => {
                if let Err(release_err) = inputs.release() {
                    error!("failed to remove staged inputs: {}", release_err);
                }
                return Err(e.context("failed to enter chroot scope"));
            }
        };

        let run_result = run_puppet(scope.as_ref(), os_family, &inputs);
        // Certificates leave the image before the scope is released.
        let release_result = inputs.release();
        let teardown_result = scope.teardown();
        info!("left {} scope at {}", self.provider.name(), mount_root);

        let run_result = match (run_result, release_result) {
            (run_result, Ok(())) => run_result,
            (Ok(_), Err(release_err)) => {
                Err(release_err).context("failed to remove staged certificates")
            }
            (Err(run_err), Err(release_err)) => {
                error!("failed to remove staged certificates: {}", release_err);
                Err(run_err.context(format!(
                    "also failed to remove staged certificates: {}",
                    release_err
                )))
            }
        };

        let result = match (run_result, teardown_result) {
            (Ok(result), Ok(())) => result,
            (Err(e), Ok(())) => return Err(e),
            (Ok(_), Err(e)) => return Err(e).context("failed to release chroot scope"),
            (Err(run_err), Err(tear_err)) => {
                error!("chroot scope release also failed: {:#}", tear_err);
                return Err(run_err);
            }
        };

        let outcome = Outcome::from_result(&result, self.dry_run);
        if !outcome.is_success() {
            error!("{} failed: {}", PUPPET_BINARY, outcome);
            if !result.stderr.trim().is_empty() {
                error!("{} stderr:\n{}", PUPPET_BINARY, result.stderr.trim_end());
            }
            return Err(RspuppetError::ToolFailure {
                exit_code: result.code(),
                outcome,
                stderr: result.stderr,
            }
            .into());
        }
        Ok(outcome)
    }
}

/// Installs puppet and runs it once inside the scope.
fn run_puppet(
    scope: &dyn IsolationContext,
    os_family: OsFamily,
    inputs: &StagedInputs,
) -> Result<CommandResult> {
    os_family
        .package_manager()
        .ensure_installed(scope, PUPPET_BINARY)
        .with_context(|| format!("failed to install {}", PUPPET_BINARY))?;

    let command = inputs.command();
    let argv = command.argv();
    info!("running {}", command.label());
    debug!("command: {:?}", argv);
    scope
        .execute(&argv)
        .with_context(|| format!("failed to execute {}", command.label()))
}
