//! Run-mode selection.

use strum::Display;
use tracing::{debug, warn};

use crate::config::PuppetConfig;
use crate::error::RspuppetError;

/// How puppet is invoked inside the chroot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RunMode {
    /// `puppet agent` against a puppet master, using a staged certificate.
    Master,
    /// `puppet apply` of a staged manifest or module tree.
    Apply,
}

impl RunMode {
    /// Selects the run mode from the puppet options.
    ///
    /// A master hostname selects [`RunMode::Master`] and takes precedence
    /// over manifests when both are set. Manifests alone select
    /// [`RunMode::Apply`]. Neither is a configuration error.
    pub fn select(puppet: &PuppetConfig) -> Result<Self, RspuppetError> {
        let mode = match (&puppet.master_hostname, &puppet.manifests) {
            (Some(hostname), Some(manifests)) => {
                warn!(
                    "both master_hostname ({}) and manifests ({}) are set; using master mode",
                    hostname, manifests
                );
                Self::Master
            }
            (Some(_), None) => Self::Master,
            (None, Some(_)) => Self::Apply,
            (None, None) => {
                return Err(RspuppetError::Configuration(
                    "no run mode specified: set either puppet.master_hostname or puppet.manifests"
                        .to_string(),
                ));
            }
        };
        debug!("puppet run mode = {}", mode);
        Ok(mode)
    }
}
