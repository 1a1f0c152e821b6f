use anyhow::Result;
use keyring::{Keyring, LoadOptions};
use serde_json::json;

use crate::env::Dirs;
use crate::{VerifyArgs, EXIT_INTEGRITY, EXIT_OK};

/// `verify <bundle.zip>`: exit 0 on a valid bundle, 3 on the first
/// integrity failure with a machine-readable reason on stderr.
pub fn run(dirs: &Dirs, args: &VerifyArgs) -> Result<u8> {
    let keyring = if dirs.keyring_path().exists() {
        Some(Keyring::load(dirs.keyring_path(), LoadOptions::default())?)
    } else {
        None
    };
    let report = proof::verify_proof_bundle(&args.bundle, keyring.as_ref())?;
    if report.ok {
        println!(
            "{}",
            json!({
                "ok": true,
                "bundle": args.bundle,
                "manifest_sha256": report.manifest_sha256,
                "key_id": report.key_id,
            })
        );
        Ok(EXIT_OK)
    } else {
        eprintln!(
            "{}",
            json!({"ok": false, "error": report.error, "bundle": args.bundle})
        );
        Ok(EXIT_INTEGRITY)
    }
}
