//! Directory index admin tool
//!
//! Inspect and edit a persistent directory index from the command line:
//! - Structural check of a region (`check`)
//! - Usage statistics (`stats`)
//! - Listing, lookup, insert and removal of entries (`ls`, `get`, `put`, `rm`)
//! - Prometheus metrics of the session (`metrics`)
//!
//! # Examples
//!
//! ```bash
//! # Check a region after a crash
//! dirindex --region /mnt/pmem/dirindex.pm check
//!
//! # Add and list entries
//! dirindex --region /mnt/pmem/dirindex.pm put 1 etc 2
//! dirindex --region /mnt/pmem/dirindex.pm ls 1
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use dirindex::{DeleteOutcome, DirIndex, IndexConfig, InodeId};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PhotonDB directory-entry index tool
#[derive(Parser, Debug)]
#[command(name = "dirindex")]
#[command(version = dirindex::VERSION)]
#[command(about = "Inspect and edit a persistent directory-entry index", long_about = None)]
#[command(author = "Anton Feldmann <anton.feldmann@gmail.com>")]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Region file holding the index
    #[arg(
        long,
        global = true,
        default_value = "data/dirindex.pm",
        env = "DIRINDEX_REGION"
    )]
    region: PathBuf,

    /// TOML configuration file (DIRINDEX__* variables override it)
    #[arg(long, global = true, env = "DIRINDEX_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "DIRINDEX_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check every reachable structure of the region
    Check,

    /// Show usage statistics as JSON
    Stats,

    /// List the entries of a directory
    Ls {
        /// Directory inode id
        dir: InodeId,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Look up one entry
    Get { dir: InodeId, name: String },

    /// Insert or update an entry
    Put {
        dir: InodeId,
        name: String,
        child: InodeId,
    },

    /// Remove an entry
    Rm { dir: InodeId, name: String },

    /// Print the metrics gathered by this invocation
    Metrics,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let _guard = setup_logging(&cli)?;

    let config = match &cli.config {
        Some(path) => IndexConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => IndexConfig::default(),
    };

    if let Some(parent) = cli.region.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let index = DirIndex::open(&cli.region, config)
        .with_context(|| format!("opening {}", cli.region.display()))?;
    info!(region = %cli.region.display(), "Index ready");

    let result = run(&index, cli.command);
    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    index.close().context("closing index")?;
    result
}

fn run(index: &DirIndex, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Check => {
            let report = index.verify()?;
            if let Some(recovery) = index.recovery_report() {
                println!("recovery: {}", serde_json::to_string(recovery)?);
            }
            println!(
                "{} tables, {} generations, {} buckets, {} nodes, {} entries",
                report.tables, report.generations, report.buckets, report.nodes, report.entries
            );
            for problem in &report.problems {
                println!("  ✗ {}", problem);
            }
            if !report.is_clean() {
                anyhow::bail!("{} problems found", report.problems.len());
            }
            println!("✅ index is consistent");
        }
        Commands::Stats => {
            index.wait_for_background();
            println!("{}", serde_json::to_string_pretty(&index.stats())?);
        }
        Commands::Ls { dir, json } => {
            let entries: Vec<_> = index.iter(dir)?.collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!(
                        "{:016x}  {:>12}  {}",
                        entry.name_hash,
                        entry.child,
                        String::from_utf8_lossy(&entry.name)
                    );
                }
                println!("{} entries", entries.len());
            }
        }
        Commands::Get { dir, name } => match index.get(dir, &name)? {
            Some(child) => println!("{}", child),
            None => anyhow::bail!("{} not found in directory {}", name, dir),
        },
        Commands::Put { dir, name, child } => {
            let outcome = index.put(dir, &name, child)?;
            println!("{:?}", outcome);
        }
        Commands::Rm { dir, name } => match index.delete(dir, &name)? {
            DeleteOutcome::Deleted => println!("Deleted"),
            DeleteOutcome::NotFound => anyhow::bail!("{} not found in directory {}", name, dir),
        },
        Commands::Metrics => {
            print!("{}", dirindex::metrics::export_metrics());
        }
    }
    Ok(())
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "dirindex.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(guard)
}
