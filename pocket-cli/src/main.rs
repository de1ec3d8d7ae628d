//! Pocket CLI - Manage tool package sources and inspect tools

use anyhow::Result;
use clap::{Parser, Subcommand};
use pocket_core::prelude::*;

#[derive(Parser)]
#[command(name = "pocket")]
#[command(about = "Tool-calling core for LLM agents", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the lockfile (defaults to ~/.pocket/pocket.lock)
    #[arg(long, global = true, env = "POCKET_LOCKFILE")]
    lockfile: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lockfile management commands
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// Sync every source in the lockfile into the package cache
    Sync {
        /// Re-resolve refs and re-fetch even when checkouts exist
        #[arg(short, long)]
        force: bool,
    },
    /// Version information
    Version,
}

#[derive(Subcommand)]
enum LockCommands {
    /// Add a git source
    AddGit {
        /// Repository URL
        url: String,
        /// Branch, tag, or commit SHA
        #[arg(short, long, default_value = "HEAD")]
        git_ref: String,
    },
    /// Add a local directory source
    AddLocal {
        /// Directory holding the tool package
        path: std::path::PathBuf,
    },
    /// Remove a source by its key
    Remove {
        /// Lock key, e.g. `git/https://github.com/org/tools#main`
        key: String,
    },
    /// List all sources
    List,
}

fn lockfile_path(cli: &Cli) -> std::path::PathBuf {
    cli.lockfile
        .clone()
        .unwrap_or_else(|| pocket_core::config::pocket_root().join("pocket.lock"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let path = lockfile_path(&cli);

    match cli.command {
        Commands::Version => {
            println!("pocket {}", env!("CARGO_PKG_VERSION"));
            println!("pocket-core {}", pocket_core::VERSION);
        }
        Commands::Sync { force } => {
            let config = PocketConfig::load()?;
            let mut lockfile = Lockfile::load(&path).await?;
            let git = GitClient::new();
            lockfile.sync_all(&git, &config.toolpkg_path, force).await?;
            lockfile.save().await?;
            println!("Synced {} source(s)", lockfile.len());
        }
        Commands::Lock { command } => {
            let mut lockfile = Lockfile::load(&path).await?;
            match command {
                LockCommands::AddGit { url, git_ref } => {
                    let lock = Lock::git(&url, &git_ref);
                    println!("Added {}", lock.key());
                    lockfile.add(lock);
                    lockfile.save().await?;
                }
                LockCommands::AddLocal { path: tool_path } => {
                    let lock = Lock::local(tool_path);
                    println!("Added {}", lock.key());
                    lockfile.add(lock);
                    lockfile.save().await?;
                }
                LockCommands::Remove { key } => {
                    match lockfile.remove(&key) {
                        Some(_) => {
                            lockfile.save().await?;
                            println!("Removed {}", key);
                        }
                        None => println!("No such source: {}", key),
                    }
                }
                LockCommands::List => {
                    if lockfile.is_empty() {
                        println!("No sources in {}", path.display());
                    }
                    for lock in lockfile.locks() {
                        println!("{}", lock.to_line().replace('\t', "  "));
                    }
                }
            }
        }
    }

    Ok(())
}
