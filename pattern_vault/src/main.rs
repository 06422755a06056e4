//! Pattern Vault - CLI
//!
//! Command-line interface for vault operations. Every command unlocks with
//! the given pattern, runs, and locks again.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pattern_keyvault::Pattern;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pattern_vault::backup::{DirectoryRemote, ForegroundHost};
use pattern_vault::{BackupCoordinator, Engine, EngineConfig, ImportItem, UnlockOutcome};

#[derive(Parser)]
#[command(name = "pattern-vault")]
#[command(version = pattern_vault::VERSION)]
#[command(about = "Pattern Vault - pattern-locked encrypted media vault")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Vault root directory (overrides the configuration)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Unlock pattern as comma-separated cell indices, e.g. 0,1,2,5
    #[arg(short, long)]
    pattern: String,

    /// Grid size of the pattern
    #[arg(short, long, default_value_t = 3)]
    grid: u8,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Unlock (creating the vault on first use) and show its name
    Unlock,

    /// Import photos and videos
    Import {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// List files in the vault
    List,

    /// Decrypt a file to disk
    Export {
        id: Uuid,
        output: PathBuf,
    },

    /// Delete a file
    Delete { id: Uuid },

    /// Rename the vault; without a name the pattern name is restored
    Rename { name: Option<String> },

    /// Show vault statistics
    Stats,

    /// Reclaim space from fragmented blobs
    Compact,

    /// Manage duress patterns
    Duress {
        #[command(subcommand)]
        command: DuressCommands,
    },

    /// Back up the vault to a directory (USB drive, NAS mount)
    Backup {
        #[arg(long)]
        remote: PathBuf,
    },

    /// Restore the vault from a directory backup
    Restore {
        #[arg(long)]
        remote: PathBuf,
    },
}

#[derive(Subcommand)]
enum DuressCommands {
    /// Register a duress pattern
    Add {
        /// Duress pattern as comma-separated cell indices
        duress_pattern: String,
    },
    /// List registered duress patterns
    List,
    /// Remove a duress pattern and wipe its decoy
    Remove { decoy_id: String },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = EngineConfig::default();
            config.apply_env();
            config
        }
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    Ok(config)
}

fn coordinator(engine: &Engine, remote: PathBuf) -> BackupCoordinator {
    BackupCoordinator::new(
        Arc::new(DirectoryRemote::new(remote)),
        Arc::new(ForegroundHost::default()),
        engine.config().backup.clone(),
    )
}

async fn unlock(engine: &Engine, pattern: &Pattern) -> Result<()> {
    match engine.unlock(pattern.cells(), pattern.grid_size()).await? {
        UnlockOutcome::Unlocked { created, .. } => {
            if created {
                println!("✅ New vault created");
            }
            Ok(())
        }
        UnlockOutcome::Failed(e) => bail!("unlock failed: {}", e),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.json);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let pattern = Pattern::parse(&cli.pattern, cli.grid)?;
    let engine = Engine::new(config)?;

    // Restore runs against a locked engine
    if !matches!(cli.command, Commands::Restore { .. }) {
        unlock(&engine, &pattern).await?;
    }
    let result = execute(&engine, &pattern, cli.command).await;
    engine.lock();
    result
}

async fn execute(engine: &Engine, pattern: &Pattern, command: Commands) -> Result<()> {
    match command {
        Commands::Unlock => {
            let stats = engine.stats()?;
            println!("🔓 {} ({} files)", stats.display_name, stats.file_count);
        }

        Commands::Import { paths } => {
            let items: Vec<ImportItem> = paths.iter().map(ImportItem::from_path).collect();
            let outcomes = engine.import(items).await?;

            let mut failed = 0;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(entry) => println!("✅ {} -> {}", outcome.name, entry.id),
                    Err(e) => {
                        failed += 1;
                        println!("❌ {}: {}", outcome.name, e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} of {} imports failed", failed, outcomes.len());
            }
        }

        Commands::List => {
            let files = engine.list_files()?;
            if files.is_empty() {
                println!("📭 Vault is empty");
            } else {
                println!("📷 Files ({}):", files.len());
                println!("{:-<72}", "");
                for file in files {
                    println!(
                        "{} {:<6} {:>10}  {}  {}",
                        file.id,
                        format!("{:?}", file.kind),
                        file.size,
                        file.imported_at.format("%Y-%m-%d %H:%M"),
                        file.original_name
                    );
                }
            }
        }

        Commands::Export { id, output } => {
            let written = engine.export_file(&id, &output)?;
            println!("✅ {} bytes written to {}", written, output.display());
        }

        Commands::Delete { id } => {
            let entry = engine.remove_file(&id)?;
            println!("🗑️ Deleted {}", entry.original_name);
        }

        Commands::Rename { name } => {
            let name = engine.rename(name)?;
            println!("✅ Vault renamed to {}", name);
        }

        Commands::Stats => {
            let stats = engine.stats()?;
            println!("📊 {}", stats.display_name);
            println!("{:-<40}", "");
            println!("Files:           {}", stats.file_count);
            println!("Plaintext size:  {} bytes", stats.total_size);
            println!("Stored size:     {} bytes", stats.stored_bytes);
            println!("Blobs:           {}", stats.blob_count);
            println!("Free in blobs:   {} bytes", stats.free_bytes);
            println!("On disk:         {} bytes", stats.disk_bytes);
            println!("Created:         {}", stats.created_at.format("%Y-%m-%d %H:%M"));
        }

        Commands::Compact => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });
            let report = engine.compact(&cancel)?;
            println!(
                "✅ Compacted {} blobs, reclaimed {} bytes",
                report.blobs_compacted.len(),
                report.bytes_reclaimed
            );
        }

        Commands::Duress { command } => match command {
            DuressCommands::Add { duress_pattern } => {
                let grid = engine.vault()?.snapshot().settings.grid_size;
                let decoy = Pattern::parse(&duress_pattern, grid)?;
                let entry = engine.register_duress(decoy.cells(), decoy.grid_size()).await?;
                println!("✅ Duress pattern registered ({})", entry.decoy_id);
            }
            DuressCommands::List => {
                let entries = engine.list_duress()?;
                if entries.is_empty() {
                    println!("No duress patterns");
                }
                for entry in entries {
                    println!("{}  {}", entry.decoy_id, entry.registered_at.format("%Y-%m-%d %H:%M"));
                }
            }
            DuressCommands::Remove { decoy_id } => {
                engine.remove_duress(&decoy_id)?;
                println!("🗑️ Duress pattern removed");
            }
        },

        Commands::Backup { remote } => {
            println!("📤 Backing up to {}", remote.display());
            let backup = coordinator(engine, remote);
            let report = engine.backup(&backup).await?;
            println!(
                "✅ {} blobs uploaded, {} unchanged, {} bytes",
                report.blobs_uploaded, report.blobs_skipped, report.bytes_uploaded
            );
        }

        Commands::Restore { remote } => {
            println!("📥 Restoring from {}", remote.display());
            let backup = coordinator(engine, remote);
            let report = engine.restore(&backup, pattern.cells(), pattern.grid_size()).await?;
            println!("✅ Restored {} files ({} bytes, {} blobs)", report.files, report.bytes, report.blobs);
        }
    }

    Ok(())
}
