use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rustvtl")]
#[command(about = "Virtual tape library disk allocation and consistency tool")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Library configuration file (defaults to <config dir>/rustvtl/library.xml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create and initialise a backing disk image
    Format {
        /// Disk image path
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Block interface id
        #[arg(short, long)]
        bid: u32,

        /// Usable size in bytes
        #[arg(short, long)]
        size: u64,

        /// Register the new disk in the library configuration
        #[arg(long)]
        register: bool,
    },

    /// Show per-disk space usage
    Space {
        /// Show per-page allocation counts
        #[arg(short, long)]
        detailed: bool,
    },

    /// Run the consistency checker
    Check {
        /// Only check this block interface id
        #[arg(short, long)]
        disk: Option<u32>,

        /// Report drift without repairing it
        #[arg(long)]
        dry_run: bool,

        /// Check disks concurrently
        #[arg(short, long)]
        parallel: bool,

        /// Write a CSV report to this path
        #[arg(short, long, value_name = "CSV")]
        report: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
