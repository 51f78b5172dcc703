//! # Catalog Sync CLI (`catalog-sync`)
//!
//! ## Usage
//!
//! ```bash
//! catalog-sync --config ./config/catalog-sync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `catalog-sync init` | Create the SQLite database and schema |
//! | `catalog-sync sync` | Reconcile the replica with the catalog |
//! | `catalog-sync profiles` | List configured repository allow-lists |
//! | `catalog-sync stats` | Print replica row counts |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! catalog-sync init --config ./config/catalog-sync.toml
//!
//! # Reconcile only repositories in the `ubi` profile
//! catalog-sync sync --profile ubi
//!
//! # Show what would change without committing
//! catalog-sync sync --dry-run --limit 10
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use catalog_sync::sync::SyncArgs;
use catalog_sync::{config, logging, migrate, profile, stats, sync};

/// Keep a local SQLite replica of the image catalog up to date.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "catalog-sync",
    about = "Reconcile a local SQLite replica with the image catalog",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/catalog-sync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it on an existing replica changes nothing.
    Init,

    /// Reconcile repositories, images, CVEs and their associations.
    ///
    /// Each repository is synced in its own transaction. A repository that
    /// fails is rolled back and skipped; the run continues.
    Sync {
        /// Profile name from `[profiles]`. Overrides `sync.profile`.
        #[arg(long)]
        profile: Option<String>,

        /// Skip known repositories whose catalog timestamp did not advance.
        #[arg(long)]
        changed_only: bool,

        /// Compute every change, then roll it back.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of repositories to sync. Unchanged repositories
        /// skipped by `--changed-only` do not count.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List configured profiles.
    Profiles,

    /// Show replica statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.log)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync {
            profile,
            changed_only,
            dry_run,
            limit,
        } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing current repository");
                    on_signal.cancel();
                }
            });

            let args = SyncArgs {
                profile,
                changed_only,
                dry_run,
                limit,
            };
            sync::run_sync(&cfg, args, cancel).await?;
        }
        Commands::Profiles => {
            profile::list_profiles(&cfg)?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
