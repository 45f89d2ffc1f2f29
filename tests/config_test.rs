mod helpers;

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use rspuppet::RspuppetError;
use rspuppet::cli::{ContextOverrides, LogLevel, ProvisionArgs, ValidateArgs};
use rspuppet::config::load_context;
use rspuppet::executor::RealCommandExecutor;
use rspuppet::mode::RunMode;
use rspuppet::outcome::Outcome;

#[test]
fn test_load_context_resolves_relative_paths() -> Result<()> {
    let workspace = helpers::Workspace::new();
    let profile = workspace.root.join("build.yml");
    // editorconfig-checker-disable
    fs::write(
        &profile,
        r#"---
mount_root: image
os_family: redhat
package:
  arg: web-01
puppet:
  manifests: manifests/site.pp
  apply_args: "--noop"
"#,
    )?;
    // editorconfig-checker-enable

    let context = load_context(&profile)?;

    assert_eq!(context.mount_root, workspace.root.join("image"));
    assert_eq!(
        context.puppet.manifests.as_deref(),
        Some(workspace.root.join("manifests/site.pp").as_path())
    );
    assert_eq!(context.puppet.apply_args(), "--noop");
    assert_eq!(context.os_family(), rspuppet::package::OsFamily::Redhat);
    assert_eq!(context.validate()?, RunMode::Apply);
    Ok(())
}

#[test]
fn test_load_context_rejects_attributes() -> Result<()> {
    let workspace = helpers::Workspace::new();
    let profile = workspace.root.join("build.yml");
    fs::write(
        &profile,
        "mount_root: /mnt/image\npackage:\n  arg: web-01\n  attributes:\n    name: web-01\n",
    )?;

    let err = load_context(&profile).unwrap_err();
    assert!(matches!(err, RspuppetError::Configuration(_)), "got {:?}", err);
    Ok(())
}

#[test]
fn test_load_context_missing_file() {
    let err = load_context(camino::Utf8Path::new("/nonexistent/rspuppet/build.yml")).unwrap_err();
    match err {
        RspuppetError::Io { message, .. } => assert_eq!(message, "I/O error: not found"),
        other => panic!("expected Io error, got {:?}", other),
    }
}

#[test]
fn test_run_validate_reports_missing_mode() -> Result<()> {
    let workspace = helpers::Workspace::new();
    let profile = workspace.root.join("build.yml");
    fs::write(&profile, "mount_root: /mnt/image\n")?;

    let err = rspuppet::run_validate(&ValidateArgs {
        file: profile,
        log_level: LogLevel::Info,
        overrides: ContextOverrides::default(),
    })
    .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<RspuppetError>(),
        Some(RspuppetError::Configuration(_))
    ));
    Ok(())
}

#[test]
fn test_run_provision_dry_run_from_profile() -> Result<()> {
    let workspace = helpers::Workspace::new();
    let manifest = workspace.manifest("site.pp");
    let profile = workspace.root.join("build.yml");
    fs::write(
        &profile,
        format!(
            concat!(
                "mount_root: {}\n",
                "mount_pseudo_filesystems: false\n",
                "package:\n  arg: web-01\n",
                "puppet:\n  manifests: {}\n",
            ),
            workspace.mount_root(),
            manifest
        ),
    )?;
    let attributes_out = workspace.root.join("attributes.yml");

    let opts = ProvisionArgs {
        file: profile,
        log_level: LogLevel::Info,
        dry_run: true,
        overrides: ContextOverrides::default(),
        attributes_out: Some(attributes_out.clone()),
    };
    let outcome = rspuppet::run_provision(&opts, Arc::new(RealCommandExecutor { dry_run: true }))?;

    assert_eq!(outcome, Outcome::NoChanges);
    assert!(!workspace.mount_root().join("etc/puppet").exists());
    assert!(!attributes_out.exists());
    Ok(())
}

#[test]
fn test_run_provision_writes_attributes() -> Result<()> {
    let workspace = helpers::Workspace::new();
    let manifest = workspace.manifest("site.pp");
    let profile = workspace.root.join("build.yml");
    fs::write(
        &profile,
        format!(
            concat!(
                "mount_root: {}\n",
                "mount_pseudo_filesystems: false\n",
                "package:\n  arg: web-01\n",
                "puppet:\n  manifests: {}\n",
            ),
            workspace.mount_root(),
            manifest
        ),
    )?;
    let attributes_out = workspace.root.join("attributes.yml");

    let opts = ProvisionArgs {
        file: profile,
        log_level: LogLevel::Info,
        dry_run: false,
        overrides: ContextOverrides::default(),
        attributes_out: Some(attributes_out.clone()),
    };
    let executor = Arc::new(helpers::MockExecutor::new().with_exit_code("puppet", 2));
    let outcome = rspuppet::run_provision(&opts, executor)?;

    assert_eq!(outcome, Outcome::Changes);
    let written: serde_yaml::Value = serde_yaml::from_str(&fs::read_to_string(&attributes_out)?)?;
    assert_eq!(written["name"].as_str(), Some("web-01"));
    assert_eq!(written["version"].as_str(), Some("puppet"));
    assert_eq!(written["release"].as_str().map(str::len), Some(12));
    Ok(())
}
