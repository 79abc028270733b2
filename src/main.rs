//! tuffdb - administration tool for tuffdb databases.
//!
//! Offline inspection and maintenance of a database directory: chunk
//! inventory, integrity verification, stream reads, and scavenging.
//! Commands open the directory directly; do not point them at a
//! database a server is writing to.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tuffdb")]
#[command(about = "Administration tool for tuffdb transaction logs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print chunk inventory and checkpoint values
    Stat {
        /// Database directory
        dir: PathBuf,
    },

    /// Scan the whole log, validating framing, digests, and footers
    Verify {
        /// Database directory
        dir: PathBuf,
    },

    /// Print committed events, rebuilt from the log
    Read {
        /// Database directory
        dir: PathBuf,

        /// Stream to read
        #[arg(short, long, conflicts_with = "all")]
        stream: Option<String>,

        /// Read every record in the log instead of one stream
        #[arg(short, long)]
        all: bool,

        /// Maximum number of events to print
        #[arg(short, long, default_value = "100")]
        count: usize,
    },

    /// Rewrite completed chunks, dropping events of deleted streams
    Scavenge {
        /// Database directory
        dir: PathBuf,

        /// Merge adjacent completed chunks while rewriting
        #[arg(long)]
        merge: bool,

        /// Keep rewritten chunks even when they reclaim no space
        #[arg(long)]
        always_keep: bool,
    },
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match commands::execute(cli.command) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}
