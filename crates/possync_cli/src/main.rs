//! possync CLI
//!
//! Command-line tools for exercising and maintaining possync devices.
//!
//! # Commands
//!
//! - `simulate` - Run several devices against a shared in-memory backend
//! - `inspect` - Display the contents of a local store snapshot
//! - `reap` - Purge expired tombstones from a local store snapshot
//! - `clear-menu` - Delete all but the named menu categories and their items
//! - `export` - Write the menu of a snapshot to a JSON backup
//! - `restore` - Stage a JSON menu backup into a snapshot

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// possync command-line tools.
#[derive(Parser)]
#[command(name = "possync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate devices of one restaurant syncing through a shared backend
    Simulate {
        /// Number of devices
        #[arg(short, long, default_value = "3")]
        devices: usize,

        /// Orders created offline on each device
        #[arg(short, long, default_value = "10")]
        orders: usize,

        /// Restaurant (tenant) id
        #[arg(short, long, default_value = "demo-restaurant")]
        tenant: String,

        /// Sync configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory to write each device's local snapshot to
        #[arg(short, long)]
        snapshot_dir: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display record counts and checkpoints of a local snapshot
    Inspect {
        /// Path to the snapshot file
        #[arg(short, long)]
        path: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Purge expired tombstones from a local snapshot
    Reap {
        /// Path to the snapshot file
        #[arg(short, long)]
        path: PathBuf,

        /// Restaurant (tenant) id
        #[arg(short, long)]
        tenant: String,

        /// Tombstone retention in days
        #[arg(short, long, default_value = "30")]
        retention_days: u64,

        /// Dry run - show what would be purged
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Delete every menu category except the named ones, with their items
    ClearMenu {
        /// Path to the snapshot file
        #[arg(short, long)]
        path: PathBuf,

        /// Restaurant (tenant) id
        #[arg(short, long)]
        tenant: String,

        /// Category names to keep
        #[arg(short, long, num_args = 1.., default_values = ["Snacks", "Receipts"])]
        keep: Vec<String>,

        /// Device id recorded on the staged deletes
        #[arg(long, default_value = "possync-cli")]
        device: String,

        /// Dry run - show what would be deleted
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Export categories and menu items of a snapshot to a JSON backup
    Export {
        /// Path to the snapshot file
        #[arg(short, long)]
        path: PathBuf,

        /// Restaurant (tenant) id
        #[arg(short, long)]
        tenant: String,

        /// Output backup file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Restore categories and menu items from a JSON backup into a snapshot
    Restore {
        /// Path to the snapshot file
        #[arg(short, long)]
        path: PathBuf,

        /// Restaurant (tenant) id to restore into
        #[arg(short, long)]
        tenant: String,

        /// Input backup file
        #[arg(short, long)]
        input: PathBuf,

        /// Device id recorded on the staged records
        #[arg(long, default_value = "possync-cli")]
        device: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            devices,
            orders,
            tenant,
            config,
            snapshot_dir,
            format,
        } => {
            let options = commands::simulate::Options {
                devices,
                orders,
                tenant,
                config,
                snapshot_dir,
            };
            commands::simulate::run(options, &format).await?;
        }
        Commands::Inspect { path, format } => {
            commands::inspect::run(&path, &format)?;
        }
        Commands::Reap {
            path,
            tenant,
            retention_days,
            dry_run,
        } => {
            commands::reap::run(&path, &tenant, retention_days, dry_run)?;
        }
        Commands::ClearMenu {
            path,
            tenant,
            keep,
            device,
            dry_run,
        } => {
            commands::menu::clear(&path, &tenant, &device, &keep, dry_run)?;
        }
        Commands::Export {
            path,
            tenant,
            output,
        } => {
            commands::menu::export(&path, &tenant, &output)?;
        }
        Commands::Restore {
            path,
            tenant,
            input,
            device,
        } => {
            commands::menu::restore(&path, &tenant, &device, &input)?;
        }
        Commands::Version => {
            println!("possync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("possync engine v{}", possync_engine::VERSION);
        }
    }

    Ok(())
}
