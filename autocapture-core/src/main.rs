use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod context;
mod env;

/// Exit codes: 0 success, 2 invalid arguments (clap), 3 integrity or
/// verification failure, 4 I/O failure.
pub const EXIT_OK: u8 = 0;
pub const EXIT_INTEGRITY: u8 = 3;
pub const EXIT_IO: u8 = 4;

/// Autocapture provenance kernel CLI
#[derive(Parser)]
#[command(name = "autocapture-core")]
#[command(about = "Local-first evidence kernel: verify, replay, export, compact, backup, keys")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a proof bundle's signature and file hashes
    Verify(VerifyArgs),

    /// Replay a proof bundle offline, revalidating citations
    Replay(ReplayArgs),

    /// Export operations
    #[command(subcommand)]
    Export(ExportCommands),

    /// Storage compaction
    #[command(subcommand)]
    Compact(CompactCommands),

    /// Backup bundle operations
    #[command(subcommand)]
    Backup(BackupCommands),

    /// Keyring operations
    #[command(subcommand)]
    Keys(KeyCommands),

    /// Run the derivation pipeline over captured frames
    Derive(DeriveArgs),

    /// Complete interrupted staged evidence writes
    Recover,
}

#[derive(Args)]
pub struct DeriveArgs {
    /// Evidence record IDs to process (repeatable)
    #[arg(long = "record-id", required = true)]
    pub record_ids: Vec<String>,
    /// Skip OCR providers during the heavy pass
    #[arg(long)]
    pub no_ocr: bool,
}

#[derive(Args)]
pub struct VerifyArgs {
    /// Proof bundle path
    pub bundle: PathBuf,
}

#[derive(Args)]
pub struct ReplayArgs {
    /// Proof bundle path
    pub bundle: PathBuf,
}

#[derive(Subcommand)]
pub enum ExportCommands {
    /// Write a signed proof bundle for the given evidence IDs
    Proof(ExportProofArgs),
    /// Write a hash-chained export of ChatGPT-related capture segments
    Chatgpt(ExportChatgptArgs),
}

#[derive(Args)]
pub struct ExportProofArgs {
    /// Evidence record IDs to export (repeatable)
    #[arg(long = "evidence-id", required = true)]
    pub evidence_ids: Vec<String>,
    /// Optional citations JSON file
    #[arg(long)]
    pub citations: Option<PathBuf>,
    /// Output bundle path
    #[arg(long)]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct ExportChatgptArgs {
    /// Cap the number of exported segments
    #[arg(long)]
    pub max_segments: Option<usize>,
    /// Only segments at or after this RFC-3339 timestamp
    #[arg(long)]
    pub since_ts: Option<String>,
}

#[derive(Subcommand)]
pub enum CompactCommands {
    /// Delete derived records and index files; evidence is never touched
    Derived(CompactDerivedArgs),
}

#[derive(Args)]
pub struct CompactDerivedArgs {
    /// Count what would be removed without deleting anything
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create a portable backup bundle
    Create(BackupCreateArgs),
    /// Restore a backup bundle (existing files are archived, never deleted)
    Restore(BackupRestoreArgs),
}

#[derive(Args)]
pub struct BackupCreateArgs {
    /// Output bundle path
    #[arg(long)]
    pub out: PathBuf,
    /// Include the whole data directory
    #[arg(long)]
    pub include_data: bool,
    /// Passphrase protecting the embedded keyring bundle
    #[arg(long)]
    pub passphrase: String,
}

#[derive(Args)]
pub struct BackupRestoreArgs {
    /// Bundle path
    #[arg(long)]
    pub bundle: PathBuf,
    /// Passphrase for the embedded keyring bundle
    #[arg(long)]
    pub passphrase: String,
    /// Overwrite existing files instead of archiving them
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Export the keyring as a passphrase-encrypted bundle
    Export(KeysExportArgs),
    /// Import a keyring bundle
    Import(KeysImportArgs),
    /// Rotate the active key for one purpose
    Rotate(KeysRotateArgs),
}

#[derive(Args)]
pub struct KeysExportArgs {
    #[arg(long)]
    pub out: PathBuf,
    #[arg(long)]
    pub passphrase: String,
}

#[derive(Args)]
pub struct KeysImportArgs {
    #[arg(long)]
    pub bundle: PathBuf,
    #[arg(long)]
    pub passphrase: String,
}

#[derive(Args)]
pub struct KeysRotateArgs {
    /// Key purpose: metadata, media, entity_tokens, anchor
    #[arg(long)]
    pub purpose: String,
    /// Re-encrypt existing records under the new active key
    #[arg(long)]
    pub rewrap: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let dirs = env::Dirs::resolve();
    let code = match cli.command {
        Commands::Verify(args) => commands::verify::run(&dirs, &args),
        Commands::Replay(args) => commands::replay::run(&dirs, &args),
        Commands::Export(ExportCommands::Proof(args)) => commands::export::proof(&dirs, &args),
        Commands::Export(ExportCommands::Chatgpt(args)) => commands::export::chatgpt(&dirs, &args),
        Commands::Compact(CompactCommands::Derived(args)) => commands::compact::derived(&dirs, &args),
        Commands::Backup(BackupCommands::Create(args)) => commands::backup::create(&dirs, &args),
        Commands::Backup(BackupCommands::Restore(args)) => commands::backup::restore(&dirs, &args),
        Commands::Keys(KeyCommands::Export(args)) => commands::keys::export(&dirs, &args),
        Commands::Keys(KeyCommands::Import(args)) => commands::keys::import(&dirs, &args),
        Commands::Keys(KeyCommands::Rotate(args)) => commands::keys::rotate(&dirs, &args),
        Commands::Derive(args) => commands::derive::run(&dirs, &args),
        Commands::Recover => commands::recover::run(&dirs),
    };
    match code {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(classify_error(&err))
        }
    }
}

/// Map an error chain onto the CLI exit-code contract.
fn classify_error(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return EXIT_IO;
        }
        if let Some(archive_err) = cause.downcast_ref::<archive::ArchiveError>() {
            return match archive_err {
                archive::ArchiveError::IntegrityCheckFailed(_) => EXIT_INTEGRITY,
                archive::ArchiveError::Io(_) => EXIT_IO,
                _ => 1,
            };
        }
        if let Some(proof_err) = cause.downcast_ref::<proof::ProofError>() {
            return match proof_err {
                proof::ProofError::CitationInvalid(_) | proof::ProofError::BundleInvalid(_) => {
                    EXIT_INTEGRITY
                }
                proof::ProofError::Io(_) => EXIT_IO,
                _ => 1,
            };
        }
    }
    1
}
