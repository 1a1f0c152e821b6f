use anyhow::{Context as _, Result};
use keyring::Purpose;
use serde_json::json;

use crate::context::KernelContext;
use crate::env::Dirs;
use crate::{KeysExportArgs, KeysImportArgs, KeysRotateArgs, EXIT_OK};

/// `keys export --out FILE --passphrase ...`
pub fn export(dirs: &Dirs, args: &KeysExportArgs) -> Result<u8> {
    let ctx = KernelContext::open(dirs.clone())?;
    keyring::export_keyring_bundle(&ctx.keyring, &args.out, &args.passphrase)?;
    archive::record_operator_action(
        &ctx.events,
        "keys_export",
        Some(&json!({"output_path": args.out})),
        None,
    )?;
    println!("{}", json!({"ok": true, "path": args.out}));
    Ok(EXIT_OK)
}

/// `keys import --bundle FILE --passphrase ...`
pub fn import(dirs: &Dirs, args: &KeysImportArgs) -> Result<u8> {
    let ring = keyring::import_keyring_bundle(
        &args.bundle,
        &args.passphrase,
        dirs.keyring_path(),
        false,
        None,
    )?;
    let ctx = KernelContext::open(dirs.clone())?;
    archive::record_operator_action(
        &ctx.events,
        "keys_import",
        Some(&json!({"bundle": args.bundle})),
        None,
    )?;
    println!("{}", json!({"ok": true, "status": ring.status()}));
    Ok(EXIT_OK)
}

/// `keys rotate --purpose P [--rewrap]`
pub fn rotate(dirs: &Dirs, args: &KeysRotateArgs) -> Result<u8> {
    let purpose: Purpose = args
        .purpose
        .parse()
        .with_context(|| format!("invalid purpose: {}", args.purpose))?;
    let ctx = KernelContext::open(dirs.clone())?;
    let new_key_id = ctx.keyring.rotate(purpose)?;
    let mut rewrapped = 0usize;
    if args.rewrap {
        // Rewrap reads every record through the candidate list and
        // re-encrypts under the new active key.
        rewrapped = match purpose {
            Purpose::Media => ctx.media.rewrap()?,
            Purpose::Metadata => {
                let raw = storage::EncryptedJsonStore::new(
                    dirs.data_dir.join("metadata"),
                    storage::DerivedKeyProvider::new(ctx.keyring.clone(), Purpose::Metadata),
                    true,
                    storage::FsyncPolicy::Critical,
                )?;
                raw.rewrap()?
            }
            _ => 0,
        };
    }
    archive::record_operator_action(
        &ctx.events,
        "keys_rotate",
        Some(&json!({
            "purpose": purpose.as_str(),
            "new_key_id": new_key_id,
            "rewrapped": rewrapped,
        })),
        None,
    )?;
    println!(
        "{}",
        json!({
            "ok": true,
            "purpose": purpose.as_str(),
            "new_key_id": new_key_id,
            "rewrapped": rewrapped,
        })
    );
    Ok(EXIT_OK)
}
