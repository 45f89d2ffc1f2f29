//! Staging of puppet agent certificates into the mounted image.
//!
//! Master-mode runs need the CA certificate plus the node's certificate and
//! private key inside the chroot. They are copied from the host ssl tree
//! before the chroot is entered and the whole staged ssl tree is removed
//! again before the chroot is left, so no key material ends up in the image.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info};

use crate::error::RspuppetError;

/// Puppet ssl directory, relative to a filesystem root.
pub const SSL_DIR: &str = "var/lib/puppet/ssl";

/// Host-side ssl tree certificates are copied from by default.
pub const DEFAULT_SSL_SOURCE: &str = "/var/lib/puppet/ssl";

const CERTS_SUBDIR: &str = "certs";
const PRIVATE_KEYS_SUBDIR: &str = "private_keys";
const CA_CERT: &str = "ca.pem";

/// Conventional certificate locations under a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    /// `<root>/var/lib/puppet/ssl`
    pub ssl_dir: Utf8PathBuf,
    /// `<root>/var/lib/puppet/ssl/certs`
    pub certs_dir: Utf8PathBuf,
    /// `<root>/var/lib/puppet/ssl/private_keys`
    pub private_keys_dir: Utf8PathBuf,
}

impl CertificatePaths {
    /// Returns the staged locations under a mount root.
    pub fn under(mount_root: &Utf8Path) -> Self {
        Self::from_ssl_dir(mount_root.join(SSL_DIR))
    }

    /// Returns the locations below an existing ssl directory.
    pub fn from_ssl_dir(ssl_dir: Utf8PathBuf) -> Self {
        Self {
            certs_dir: ssl_dir.join(CERTS_SUBDIR),
            private_keys_dir: ssl_dir.join(PRIVATE_KEYS_SUBDIR),
            ssl_dir,
        }
    }

    /// Returns `(source, destination)` pairs for the three files of `certname`.
    fn files_for(&self, dest: &Self, certname: &str) -> [(Utf8PathBuf, Utf8PathBuf); 3] {
        let pem = format!("{}.pem", certname);
        [
            (self.certs_dir.join(CA_CERT), dest.certs_dir.join(CA_CERT)),
            (self.certs_dir.join(&pem), dest.certs_dir.join(&pem)),
            (self.private_keys_dir.join(&pem), dest.private_keys_dir.join(&pem)),
        ]
    }
}

fn validate_certname(certname: &str) -> Result<(), RspuppetError> {
    if certname.is_empty() {
        return Err(RspuppetError::Staging("certname must not be empty".to_string()));
    }
    if certname.contains('/') || certname == "." || certname == ".." {
        return Err(RspuppetError::Staging(format!(
            "certname '{}' must be a plain file name",
            certname
        )));
    }
    Ok(())
}

/// Creates the staged certs and private keys directories.
///
/// Idempotent: existing directories are not an error.
pub fn ensure_cert_dirs(mount_root: &Utf8Path) -> Result<CertificatePaths, RspuppetError> {
    let paths = CertificatePaths::under(mount_root);
    for dir in [&paths.certs_dir, &paths.private_keys_dir] {
        debug!("creating directory {} if it does not exist", dir);
        fs::create_dir_all(dir).map_err(|e| {
            RspuppetError::Staging(format!("failed to create directory {}: {}", dir, e))
        })?;
    }
    Ok(paths)
}

/// Copies the CA certificate and the certificate and key of `certname`
/// from `ssl_source` into the mount root.
///
/// All three source files are checked before anything is copied. The
/// staged directories must already exist (see [`ensure_cert_dirs`]).
pub fn stage_certs(
    mount_root: &Utf8Path,
    certname: &str,
    ssl_source: &Utf8Path,
) -> Result<(), RspuppetError> {
    validate_certname(certname)?;

    let source = CertificatePaths::from_ssl_dir(ssl_source.to_owned());
    let dest = CertificatePaths::under(mount_root);
    let files = source.files_for(&dest, certname);

    let missing: Vec<&str> = files
        .iter()
        .filter(|(src, _)| !src.is_file())
        .map(|(src, _)| src.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(RspuppetError::Staging(format!(
            "missing certificate file(s) for {}: {}",
            certname,
            missing.join(", ")
        )));
    }

    debug!("placing certs for {} into mount root {}", certname, mount_root);
    for (src, dst) in &files {
        fs::copy(src, dst).map_err(|e| {
            RspuppetError::Staging(format!("failed to copy {} to {}: {}", src, dst, e))
        })?;
    }
    restrict_key_permissions(&files[2].1)
}

/// Makes the staged private key readable by its owner only.
fn restrict_key_permissions(key: &Utf8Path) -> Result<(), RspuppetError> {
    fs::set_permissions(key, fs::Permissions::from_mode(0o600))
        .map_err(|e| RspuppetError::io(format!("failed to set permissions on {}", key), e))
}

/// Removes the staged ssl tree from the mount root.
///
/// Idempotent: a missing tree is not an error.
pub fn remove_certs(mount_root: &Utf8Path) -> Result<(), RspuppetError> {
    let ssl_dir = mount_root.join(SSL_DIR);
    match fs::remove_dir_all(&ssl_dir) {
        Ok(()) => {
            debug!("removed staged ssl tree {}", ssl_dir);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RspuppetError::io(format!("failed to remove {}", ssl_dir), e)),
    }
}

/// Staged certificates that are removed on every exit path.
///
/// [`StagedCerts::remove`] reports removal errors; if the guard is dropped
/// without it, removal still happens and failures are logged.
#[derive(Debug)]
pub struct StagedCerts {
    mount_root: Utf8PathBuf,
    dry_run: bool,
    removed: bool,
}

impl StagedCerts {
    /// Creates the directories, copies the files and returns the guard.
    ///
    /// In dry-run mode nothing is touched on disk.
    pub fn stage(
        mount_root: &Utf8Path,
        certname: &str,
        ssl_source: &Utf8Path,
        dry_run: bool,
    ) -> Result<Self, RspuppetError> {
        let guard = Self {
            mount_root: mount_root.to_owned(),
            dry_run,
            removed: false,
        };
        if dry_run {
            info!("dry run: would stage certificates for {} from {}", certname, ssl_source);
            return Ok(guard);
        }
        ensure_cert_dirs(mount_root)?;
        stage_certs(mount_root, certname, ssl_source)?;
        Ok(guard)
    }

    /// Removes the staged ssl tree now.
    pub fn remove(mut self) -> Result<(), RspuppetError> {
        self.removed = true;
        if self.dry_run {
            return Ok(());
        }
        info!("removing staged certificates");
        remove_certs(&self.mount_root)
    }
}

impl Drop for StagedCerts {
    fn drop(&mut self) {
        if !self.removed
            && !self.dry_run
            && let Err(e) = remove_certs(&self.mount_root)
        {
            error!("failed to remove staged certificates: {}", e);
        }
    }
}
