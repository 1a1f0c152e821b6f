use anyhow::Result;
use archive::BackupOptions;
use serde_json::json;

use crate::context::KernelContext;
use crate::env::Dirs;
use crate::{BackupCreateArgs, BackupRestoreArgs, EXIT_OK};

/// `backup create --out FILE [--include-data] --passphrase ...`
pub fn create(dirs: &Dirs, args: &BackupCreateArgs) -> Result<u8> {
    let ctx = KernelContext::open(dirs.clone())?;
    let options = BackupOptions {
        include_data: args.include_data,
        include_keyring_bundle: true,
        keyring_bundle_passphrase: Some(args.passphrase.clone()),
        overwrite: false,
    };
    let report = archive::create_backup_bundle(
        &args.out,
        &dirs.root,
        &dirs.config_dir,
        &dirs.data_dir,
        &dirs.keyring_path(),
        &options,
    )?;
    archive::record_operator_action(
        &ctx.events,
        "backup_create",
        Some(&json!({"output_path": report.path, "entries": report.entries})),
        None,
    )?;
    println!(
        "{}",
        json!({
            "ok": true,
            "path": report.path,
            "entries": report.entries,
            "includes_data": report.includes_data,
            "includes_keyring_bundle": report.includes_keyring_bundle,
        })
    );
    Ok(EXIT_OK)
}

/// `backup restore --bundle FILE --passphrase ...`
pub fn restore(dirs: &Dirs, args: &BackupRestoreArgs) -> Result<u8> {
    let report = archive::restore_backup_bundle(
        &args.bundle,
        &dirs.root,
        &dirs.config_dir,
        &dirs.data_dir,
        Some(&args.passphrase),
        args.overwrite,
    )?;
    println!(
        "{}",
        json!({
            "ok": true,
            "extracted": report.extracted,
            "archived": report.archived,
        })
    );
    Ok(EXIT_OK)
}
