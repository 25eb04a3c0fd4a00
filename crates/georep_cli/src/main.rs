//! georep CLI
//!
//! Runs replication and verification workers against a store directory
//! shared by a primary and its secondaries.
//!
//! # Commands
//!
//! - `init` - Write a site settings file
//! - `add-resource`, `update-resource`, `remove-resource` - Change
//!   resources on the primary
//! - `backfill` - Create missing registry or verification rows
//! - `sync` - Apply new events and run sync batches on a secondary
//! - `verify` - Run verification batches
//! - `sweep-timeouts` - Fail rows stuck past their timeouts
//! - `reverify` - Queue old verifications for recomputation
//! - `status` - Show replication status

mod commands;
mod journal;

use clap::{Parser, Subcommand};
use commands::init::InitOptions;
use commands::{Layout, Target};
use georep_engine::SiteRole;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// georep replication workers.
#[derive(Parser)]
#[command(name = "georep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the shared store directory
    #[arg(global = true, short, long, default_value = "georep-store")]
    store: PathBuf,

    /// Path to this site's settings file
    #[arg(global = true, long, default_value = "site.json")]
    site: PathBuf,

    /// Resource kind to work on
    #[arg(global = true, short, long, default_value = "upload")]
    kind: String,

    /// How the kind's content is stored
    #[arg(global = true, long, value_enum, default_value = "blob")]
    layout: Layout,

    /// The primary's storage root (secondaries only)
    #[arg(global = true, long)]
    primary_root: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Role {
    Primary,
    Secondary,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a site settings file
    Init {
        /// Site name
        #[arg(long)]
        name: String,

        /// Site role
        #[arg(long, value_enum)]
        role: Role,

        /// Directory for this site's copies
        #[arg(long)]
        storage_root: PathBuf,

        /// Shared transfer signing secret
        #[arg(long, default_value = "")]
        secret: String,

        /// Replicate only these scopes (repeatable)
        #[arg(long = "scope")]
        scopes: Vec<String>,

        /// Disable verification
        #[arg(long)]
        no_verification: bool,
    },

    /// Create a resource on the primary
    AddResource {
        /// Resource id
        #[arg(long)]
        id: i64,

        /// Storage path relative to the primary's storage root
        #[arg(long)]
        locator: String,

        /// Selective-sync scope
        #[arg(long)]
        scope: Option<String>,
    },

    /// Record a content change on the primary
    UpdateResource {
        /// Resource id
        #[arg(long)]
        id: i64,
    },

    /// Delete a resource on the primary
    RemoveResource {
        /// Resource id
        #[arg(long)]
        id: i64,
    },

    /// Create missing registry or verification rows
    Backfill,

    /// Apply new events and run sync batches
    Sync {
        /// Maximum number of batches
        #[arg(short, long, default_value = "1")]
        batches: usize,
    },

    /// Run verification batches
    Verify {
        /// Maximum number of batches
        #[arg(short, long, default_value = "1")]
        batches: usize,

        /// Run the full periodic verification pass
        #[arg(long)]
        background: bool,
    },

    /// Fail rows stuck past their timeouts
    SweepTimeouts,

    /// Queue old verifications for recomputation
    Reverify,

    /// Show replication status
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let target = Target {
        store: cli.store,
        site: cli.site,
        kind: cli.kind,
        layout: cli.layout,
        primary_root: cli.primary_root,
    };

    match cli.command {
        Commands::Init {
            name,
            role,
            storage_root,
            secret,
            scopes,
            no_verification,
        } => {
            let role = match role {
                Role::Primary => SiteRole::Primary,
                Role::Secondary => SiteRole::Secondary,
            };
            commands::init::run(
                &target.site,
                InitOptions {
                    name,
                    role,
                    storage_root,
                    secret,
                    scopes,
                    no_verification,
                },
            )?;
        }
        Commands::AddResource { id, locator, scope } => {
            commands::resources::add(&target, id, &locator, scope.as_deref())?;
        }
        Commands::UpdateResource { id } => {
            commands::resources::update(&target, id)?;
        }
        Commands::RemoveResource { id } => {
            commands::resources::remove(&target, id)?;
        }
        Commands::Backfill => {
            commands::work::backfill(&target)?;
        }
        Commands::Sync { batches } => {
            commands::work::sync(&target, batches)?;
        }
        Commands::Verify { batches, background } => {
            commands::work::verify(&target, batches, background)?;
        }
        Commands::SweepTimeouts => {
            commands::work::sweep_timeouts(&target)?;
        }
        Commands::Reverify => {
            commands::work::reverify(&target)?;
        }
        Commands::Status { format } => {
            commands::status::run(&target, &format)?;
        }
    }

    Ok(())
}
