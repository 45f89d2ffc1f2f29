//! Staging of puppet manifests into the mounted image.
//!
//! A manifest input is either a tar archive (plain or gzip-compressed) of
//! modules, or a single `.pp` file. Archives are expanded under
//! `etc/puppet`, single files are copied into `etc/puppet/modules` and
//! become the apply target.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::command::PUPPET_BINARY;
use crate::error::RspuppetError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MODULES_DIR: &str = "modules";

/// Result of staging a manifest input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedManifest {
    /// An archive was expanded into `target_dir` (host-side path).
    ArchiveExpanded { target_dir: Utf8PathBuf },
    /// A single file was copied; `relative_path` is relative to the mount root.
    SingleFile { relative_path: Utf8PathBuf },
}

impl StagedManifest {
    /// Returns the apply target passed to `puppet apply`.
    ///
    /// Empty for an expanded archive, since apply then runs against the
    /// whole module tree.
    pub fn apply_target(&self) -> &str {
        match self {
            Self::ArchiveExpanded { .. } => "",
            Self::SingleFile { relative_path } => relative_path.as_str(),
        }
    }
}

/// `etc/<tool>` relative to a filesystem root.
fn tool_config_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("etc").join(PUPPET_BINARY)
}

fn staging_error(context: &str, path: &Utf8Path, err: impl std::fmt::Display) -> RspuppetError {
    RspuppetError::Staging(format!("{} {}: {}", context, path, err))
}

fn open_archive(path: &Utf8Path) -> io::Result<tar::Archive<Box<dyn Read>>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    // Re-open so the reader starts at offset 0 regardless of what was read.
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = if n == 2 && magic == GZIP_MAGIC {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

/// Top-level layout of a manifest archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLayout {
    /// True if some entry lives under a top-level `modules` directory.
    pub has_modules_dir: bool,
}

/// Inspects `path` and returns its layout if it is a tar archive.
///
/// Returns `Ok(None)` for anything that does not start with a valid tar
/// header (e.g. a plain manifest file). An archive whose later entries
/// are corrupt is a staging error.
pub fn inspect_archive(path: &Utf8Path) -> Result<Option<ArchiveLayout>, RspuppetError> {
    let mut archive =
        open_archive(path).map_err(|e| staging_error("failed to open manifest", path, e))?;
    let Ok(entries) = archive.entries() else {
        return Ok(None);
    };

    let mut has_modules_dir = false;
    let mut seen_any = false;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) if !seen_any => return Ok(None),
            Err(e) => return Err(staging_error("corrupt manifest archive", path, e)),
        };
        seen_any = true;
        let entry_path = entry
            .path()
            .map_err(|e| staging_error("invalid entry path in", path, e))?;
        let first = entry_path
            .components()
            .find(|c| matches!(c, std::path::Component::Normal(_)));
        if first.is_some_and(|c| c.as_os_str() == MODULES_DIR) {
            has_modules_dir = true;
        }
    }

    Ok(seen_any.then_some(ArchiveLayout { has_modules_dir }))
}

/// Returns the directory an archive is expanded into.
///
/// Archives that carry their own top-level `modules` directory expand into
/// `<mount_root>/etc/<tool>`, everything else into `<mount_root>/etc/<tool>/modules`.
pub fn archive_destination(mount_root: &Utf8Path, layout: ArchiveLayout) -> Utf8PathBuf {
    let base = mount_root.join(tool_config_dir());
    if layout.has_modules_dir {
        base
    } else {
        base.join(MODULES_DIR)
    }
}

/// Returns the apply target (relative to the mount root) for a single manifest file.
pub fn single_file_target(manifest: &Utf8Path) -> Result<Utf8PathBuf, RspuppetError> {
    let name = manifest.file_name().ok_or_else(|| {
        RspuppetError::Staging(format!("manifest path has no file name: {}", manifest))
    })?;
    Ok(tool_config_dir().join(MODULES_DIR).join(name))
}

fn expand_archive(path: &Utf8Path, dest: &Utf8Path) -> Result<(), RspuppetError> {
    fs::create_dir_all(dest)
        .map_err(|e| staging_error("failed to create directory", dest, e))?;
    let mut archive =
        open_archive(path).map_err(|e| staging_error("failed to open manifest", path, e))?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(false);
    archive
        .unpack(dest)
        .map_err(|e| staging_error("failed to expand manifest archive into", dest, e))
}

/// Copies `src` to `dst`, keeping permissions and modification time.
fn copy_with_metadata(src: &Utf8Path, dst: &Utf8Path) -> io::Result<()> {
    fs::copy(src, dst)?;
    let modified = fs::metadata(src)?.modified()?;
    File::options().write(true).open(dst)?.set_modified(modified)
}

/// Stages `manifest` into `mount_root`.
///
/// In dry-run mode the source is only inspected; nothing is written.
pub fn stage_manifest(
    mount_root: &Utf8Path,
    manifest: &Utf8Path,
    dry_run: bool,
) -> Result<StagedManifest, RspuppetError> {
    let metadata = fs::metadata(manifest)
        .map_err(|e| staging_error("manifest source is not accessible:", manifest, e))?;
    if !metadata.is_file() {
        return Err(RspuppetError::Staging(format!(
            "manifest source is not a file: {}",
            manifest
        )));
    }

    if let Some(layout) = inspect_archive(manifest)? {
        let target_dir = archive_destination(mount_root, layout);
        if dry_run {
            info!("dry run: would expand {} into {}", manifest, target_dir);
        } else {
            debug!("expanding {} into {}", manifest, target_dir);
            expand_archive(manifest, &target_dir)?;
        }
        return Ok(StagedManifest::ArchiveExpanded { target_dir });
    }

    let relative_path = single_file_target(manifest)?;
    let dest_file = mount_root.join(&relative_path);
    if dry_run {
        info!("dry run: would copy {} to {}", manifest, dest_file);
    } else {
        if let Some(parent) = dest_file.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| staging_error("failed to create directory", parent, e))?;
        }
        debug!("copying '{}' to '{}'", manifest, dest_file);
        copy_with_metadata(manifest, &dest_file)
            .map_err(|e| staging_error("failed to copy manifest to", &dest_file, e))?;
    }
    Ok(StagedManifest::SingleFile { relative_path })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .expect("path should be valid UTF-8");
        (dir, path)
    }

    fn append_file<W: io::Write>(builder: &mut tar::Builder<W>, path: &str, content: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content).unwrap();
    }

    fn write_tar(path: &Utf8Path, files: &[(&str, &str)]) {
        let mut builder = tar::Builder::new(File::create(path).unwrap());
        for (name, content) in files {
            append_file(&mut builder, name, content.as_bytes());
        }
        builder.finish().unwrap();
    }

    fn write_tar_gz(path: &Utf8Path, files: &[(&str, &str)]) {
        let enc = flate2::write::GzEncoder::new(
            File::create(path).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(enc);
        for (name, content) in files {
            append_file(&mut builder, name, content.as_bytes());
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_single_file_is_copied_under_modules() {
        let (_src, src_dir) = utf8_tempdir();
        let (_root, root) = utf8_tempdir();
        let manifest = src_dir.join("site.pp");
        fs::write(&manifest, "node default {}\n").unwrap();

        let staged = stage_manifest(&root, &manifest, false).unwrap();

        assert_eq!(
            staged,
            StagedManifest::SingleFile {
                relative_path: "etc/puppet/modules/site.pp".into()
            }
        );
        assert_eq!(staged.apply_target(), "etc/puppet/modules/site.pp");
        assert_eq!(
            fs::read_to_string(root.join("etc/puppet/modules/site.pp")).unwrap(),
            "node default {}\n"
        );
    }

    #[test]
    fn test_single_file_keeps_mtime() {
        let (_src, src_dir) = utf8_tempdir();
        let (_root, root) = utf8_tempdir();
        let manifest = src_dir.join("site.pp");
        fs::write(&manifest, "node default {}\n").unwrap();
        let old = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        File::options()
            .write(true)
            .open(&manifest)
            .unwrap()
            .set_modified(old)
            .unwrap();

        stage_manifest(&root, &manifest, false).unwrap();

        let copied = fs::metadata(root.join("etc/puppet/modules/site.pp")).unwrap();
        assert_eq!(copied.modified().unwrap(), old);
    }

    #[test]
    fn test_archive_without_modules_expands_into_modules() {
        let (_src, src_dir) = utf8_tempdir();
        let (_root, root) = utf8_tempdir();
        let bundle = src_dir.join("bundle.tar");
        write_tar(&bundle, &[("nginx/manifests/init.pp", "class nginx {}")]);

        let staged = stage_manifest(&root, &bundle, false).unwrap();

        assert_eq!(
            staged,
            StagedManifest::ArchiveExpanded {
                target_dir: root.join("etc/puppet/modules")
            }
        );
        assert_eq!(staged.apply_target(), "");
        assert!(root.join("etc/puppet/modules/nginx/manifests/init.pp").is_file());
    }

    #[test]
    fn test_archive_with_modules_expands_into_tool_dir() {
        let (_src, src_dir) = utf8_tempdir();
        let (_root, root) = utf8_tempdir();
        let bundle = src_dir.join("bundle.tar");
        write_tar(
            &bundle,
            &[
                ("modules/nginx/manifests/init.pp", "class nginx {}"),
                ("manifests/site.pp", "include nginx"),
            ],
        );

        let staged = stage_manifest(&root, &bundle, false).unwrap();

        assert_eq!(
            staged,
            StagedManifest::ArchiveExpanded {
                target_dir: root.join("etc/puppet")
            }
        );
        assert!(root.join("etc/puppet/modules/nginx/manifests/init.pp").is_file());
        assert!(root.join("etc/puppet/manifests/site.pp").is_file());
    }

    #[test]
    fn test_gzip_archive_is_detected_by_content() {
        let (_src, src_dir) = utf8_tempdir();
        let (_root, root) = utf8_tempdir();
        let bundle = src_dir.join("bundle.bin");
        write_tar_gz(&bundle, &[("modules/base/manifests/init.pp", "class base {}")]);

        let staged = stage_manifest(&root, &bundle, false).unwrap();

        assert_eq!(
            staged,
            StagedManifest::ArchiveExpanded {
                target_dir: root.join("etc/puppet")
            }
        );
        assert!(root.join("etc/puppet/modules/base/manifests/init.pp").is_file());
    }

    #[test]
    fn test_inspect_plain_manifest_is_not_archive() {
        let (_src, src_dir) = utf8_tempdir();
        let manifest = src_dir.join("site.pp");
        fs::write(&manifest, "node default {\n  include base\n}\n".repeat(40)).unwrap();
        assert_eq!(inspect_archive(&manifest).unwrap(), None);
    }

    #[test]
    fn test_missing_source_is_staging_error() {
        let (_root, root) = utf8_tempdir();
        let err = stage_manifest(&root, Utf8Path::new("/nonexistent/site.pp"), false).unwrap_err();
        assert!(matches!(err, RspuppetError::Staging(_)));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let (_src, src_dir) = utf8_tempdir();
        let (_root, root) = utf8_tempdir();
        let manifest = src_dir.join("site.pp");
        fs::write(&manifest, "node default {}\n").unwrap();

        let staged = stage_manifest(&root, &manifest, true).unwrap();

        assert_eq!(staged.apply_target(), "etc/puppet/modules/site.pp");
        assert!(!root.join("etc").exists());
    }
}
