use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use keel_state::{
    Address, BackendConfig, DocSummary, LocalStore, LockInfo, Migrator, ObjectStore,
    StateDocument, StateRepository, create_backend, default_holder, init_backend,
};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Lock-protected remote state storage", long_about = None)]
struct Cli {
    /// Path to the backend configuration file (JSON)
    #[arg(long, global = true, default_value = "keel.backend.json")]
    backend: PathBuf,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the configured backend (creates the S3 bucket if allowed)
    Init,
    /// Show the document and lock at an address
    Show {
        /// State address
        address: String,
    },
    /// List stored versions, newest first
    Versions {
        /// State address
        address: String,
    },
    /// Write a file's contents as the next document at an address
    Push {
        /// State address
        address: String,

        /// File holding the new payload
        file: PathBuf,

        /// Lock holder identity (default: user@hostname)
        #[arg(long)]
        holder: Option<String>,
    },
    /// Write the current payload at an address to a file or stdout
    Pull {
        /// State address
        address: String,

        /// Output file (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Copy state to a new, empty address; the source is left untouched
    Migrate {
        /// Address to copy from
        source: String,

        /// Empty address to copy to
        dest: String,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Remove the lock on an address regardless of who holds it
    ForceUnlock {
        /// State address
        address: String,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Hide the current document behind a tombstone (history is kept)
    Delete {
        /// State address
        address: String,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Permanently remove one stored version
    Purge {
        /// State address
        address: String,

        /// Version to remove (see `keel versions`)
        version_id: String,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let initialize = matches!(cli.command, Commands::Init);
    let result = match load_store(&cli.backend, initialize).await {
        Ok(store) => run(cli.command, store).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Commands, store: Arc<dyn ObjectStore>) -> Result<(), String> {
    match command {
        Commands::Init => {
            println!("{}", "Backend ready.".green().bold());
            Ok(())
        }
        Commands::Show { address } => run_show(&parse_address(&address)?, store).await,
        Commands::Versions { address } => run_versions(&parse_address(&address)?, store).await,
        Commands::Push {
            address,
            file,
            holder,
        } => {
            let holder = holder.unwrap_or_else(default_holder);
            run_push(&parse_address(&address)?, &file, &holder, store).await
        }
        Commands::Pull { address, output } => {
            run_pull(&parse_address(&address)?, output.as_deref(), store).await
        }
        Commands::Migrate {
            source,
            dest,
            auto_approve,
        } => {
            run_migrate(
                &parse_address(&source)?,
                &parse_address(&dest)?,
                auto_approve,
                store,
            )
            .await
        }
        Commands::ForceUnlock {
            address,
            auto_approve,
        } => run_force_unlock(&parse_address(&address)?, auto_approve, store).await,
        Commands::Delete {
            address,
            auto_approve,
        } => run_delete(&parse_address(&address)?, auto_approve, store).await,
        Commands::Purge {
            address,
            version_id,
            auto_approve,
        } => run_purge(&parse_address(&address)?, &version_id, auto_approve, store).await,
    }
}

/// Read the backend configuration, falling back to a local store when the file is absent
fn load_config(path: &Path) -> Result<BackendConfig, String> {
    if !path.exists() {
        return Ok(BackendConfig::new("local").with_attribute(
            "path",
            serde_json::Value::String(LocalStore::DEFAULT_ROOT.to_string()),
        ));
    }

    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    BackendConfig::from_json(&content).map_err(|e| e.to_string())
}

/// Open the configured store; only `init` may create the bucket or directory behind it
async fn load_store(path: &Path, initialize: bool) -> Result<Arc<dyn ObjectStore>, String> {
    let config = load_config(path)?;
    let store = if initialize {
        init_backend(&config).await
    } else {
        create_backend(&config).await
    };
    store.map_err(|e| e.to_string())
}

fn parse_address(address: &str) -> Result<Address, String> {
    Address::new(address).map_err(|e| e.to_string())
}

async fn run_show(address: &Address, store: Arc<dyn ObjectStore>) -> Result<(), String> {
    let repository = StateRepository::new(store);

    match repository
        .load_versioned(address)
        .await
        .map_err(|e| e.to_string())?
    {
        Some(current) => {
            let summary = current.document.summarize(address, &current.version_id);
            print_summary(&summary);
        }
        None => println!("{}", format!("No state at {}.", address).yellow()),
    }

    match repository
        .locks()
        .current(address)
        .await
        .map_err(|e| e.to_string())?
    {
        Some(lock) => println!("  {} {}", "Lock:".bold(), describe_lock(&lock).red()),
        None => println!("  {} {}", "Lock:".bold(), "unlocked".green()),
    }
    Ok(())
}

async fn run_versions(address: &Address, store: Arc<dyn ObjectStore>) -> Result<(), String> {
    let versions = store
        .list_versions(address)
        .await
        .map_err(|e| e.to_string())?;

    if versions.is_empty() {
        println!("{}", format!("No versions stored at {}.", address).yellow());
        return Ok(());
    }

    for version in versions {
        let marker = if version.is_tombstone {
            "deleted".red().to_string()
        } else {
            "live".green().to_string()
        };
        println!(
            "  {}  {}  {}",
            version.version_id.bold(),
            version.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            marker
        );
    }
    Ok(())
}

async fn run_push(
    address: &Address,
    file: &Path,
    holder: &str,
    store: Arc<dyn ObjectStore>,
) -> Result<(), String> {
    let payload =
        fs::read(file).map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
    let repository = StateRepository::new(store);

    let written = repository
        .transact(address, holder, |current| match current {
            Some(doc) => doc.successor(payload),
            None => StateDocument::initial(payload),
        })
        .await
        .map_err(|e| e.to_string())?;

    println!(
        "{} {} (serial {}, lineage {})",
        "✓".green(),
        address,
        written.serial,
        written.lineage
    );
    Ok(())
}

async fn run_pull(
    address: &Address,
    output: Option<&Path>,
    store: Arc<dyn ObjectStore>,
) -> Result<(), String> {
    let repository = StateRepository::new(store);
    let document = repository
        .load(address)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("No state at {}", address))?;

    match output {
        Some(path) => fs::write(path, &document.payload)
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e)),
        None => std::io::stdout()
            .write_all(&document.payload)
            .map_err(|e| e.to_string()),
    }
}

async fn run_migrate(
    source: &Address,
    dest: &Address,
    auto_approve: bool,
    store: Arc<dyn ObjectStore>,
) -> Result<(), String> {
    let migrator = Migrator::new(store);

    let result = migrator
        .migrate(source, dest, |summary| {
            if auto_approve {
                return true;
            }
            print_summary(summary);
            confirm(
                &format!("Copy this state to {}?", dest),
                "The source is left in place. Type 'yes' to confirm.",
            )
            .unwrap_or(false)
        })
        .await;

    match result {
        Ok(result) if result.was_empty => {
            println!(
                "{} {} was empty; initialized {}",
                "✓".green(),
                result.source,
                result.dest
            );
            Ok(())
        }
        Ok(result) => {
            println!(
                "{} Copied {} bytes from {} to {}",
                "✓".green(),
                result.bytes_copied,
                result.source,
                result.dest
            );
            let note = format!(
                "{} still holds its copy; remove it with `keel delete` when ready.",
                result.source
            );
            println!("  {}", note.yellow());
            Ok(())
        }
        Err(keel_state::BackendError::MigrationCancelled { .. }) => {
            println!();
            println!("{}", "Migration cancelled.".yellow());
            Ok(())
        }
        Err(e) => Err(e.to_string()),
    }
}

async fn run_force_unlock(
    address: &Address,
    auto_approve: bool,
    store: Arc<dyn ObjectStore>,
) -> Result<(), String> {
    let repository = StateRepository::new(store);
    let locks = repository.locks();

    let Some(lock) = locks.current(address).await.map_err(|e| e.to_string())? else {
        println!("{}", format!("{} is not locked.", address).yellow());
        return Ok(());
    };

    if !auto_approve {
        println!("  {} {}", "Lock:".bold(), describe_lock(&lock));
        let approved = confirm(
            "Do you really want to force-unlock this state?",
            "If the holder is still running, concurrent writes become possible. Type 'yes' to confirm.",
        )?;
        if !approved {
            println!();
            println!("{}", "Force-unlock cancelled.".yellow());
            return Ok(());
        }
    }

    match locks
        .force_release(address)
        .await
        .map_err(|e| e.to_string())?
    {
        Some(evicted) => println!(
            "{} Removed lock held by {}",
            "✓".green(),
            evicted.holder.bold()
        ),
        None => println!("{} Removed lock on {}", "✓".green(), address),
    }
    Ok(())
}

async fn run_delete(
    address: &Address,
    auto_approve: bool,
    store: Arc<dyn ObjectStore>,
) -> Result<(), String> {
    if !auto_approve {
        let approved = confirm(
            &format!("Delete the state at {}?", address),
            "Earlier versions stay listed until purged. Type 'yes' to confirm.",
        )?;
        if !approved {
            println!();
            println!("{}", "Delete cancelled.".yellow());
            return Ok(());
        }
    }

    let tombstone = store
        .soft_delete(address)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "{} Deleted {} (tombstone version {})",
        "✓".green(),
        address,
        tombstone
    );
    Ok(())
}

async fn run_purge(
    address: &Address,
    version_id: &str,
    auto_approve: bool,
    store: Arc<dyn ObjectStore>,
) -> Result<(), String> {
    if !auto_approve {
        let approved = confirm(
            &format!(
                "Do you really want to purge version {} of {}?",
                version_id, address
            ),
            "This action cannot be undone. Type 'yes' to confirm.",
        )?;
        if !approved {
            println!();
            println!("{}", "Purge cancelled.".yellow());
            return Ok(());
        }
    }

    store
        .purge(address, version_id)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "{} Purged version {} of {}",
        "✓".red(),
        version_id,
        address
    );
    Ok(())
}

fn print_summary(summary: &DocSummary) {
    println!("{}", summary.address.to_string().bold());
    println!("  {} {}", "Lineage:".bold(), summary.lineage);
    println!("  {} {}", "Serial:".bold(), summary.serial);
    println!("  {} {}", "Version:".bold(), summary.version_id);
    println!("  {} {} bytes", "Payload:".bold(), summary.payload_len);
}

fn describe_lock(lock: &LockInfo) -> String {
    format!(
        "held by {} for {} (lock ID: {}, since {}, {}s ago)",
        lock.holder,
        lock.operation,
        lock.id,
        lock.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
        lock.age().num_seconds()
    )
}

/// Ask for a literal `yes` on stdin
fn confirm(question: &str, detail: &str) -> Result<bool, String> {
    println!();
    println!("{}", question.yellow().bold());
    println!("  {}", detail.yellow());
    print!("\n  Enter a value: ");
    std::io::stdout().flush().map_err(|e| e.to_string())?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .map_err(|e| e.to_string())?;

    Ok(input.trim() == "yes")
}
