//! Thin CLI shell over the library: report finalization, invariant
//! validation, and report-cache maintenance. All analysis logic lives in the
//! services; this module only parses arguments and prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

use crate::models::report::CrashReport;
use crate::services::finalizer;
use crate::services::report_cache::ReportDiskCache;

#[derive(Parser)]
#[command(name = "dumpscope", version, about = "Post-mortem crash analysis for managed process dumps")]
pub struct Cli {
    /// Informational logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging for dumpscope modules
    #[arg(long, global = true)]
    pub debug: bool,

    /// Full trace logging
    #[arg(long, global = true)]
    pub trace: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Normalize a report JSON file (renumber frames, recompute derived
    /// counts) and write it back out
    Finalize {
        /// Input report JSON
        input: PathBuf,
        /// Output path; defaults to stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check a report JSON file against the emitted-report invariants
    Validate {
        /// Input report JSON
        input: PathBuf,
    },
    /// Inspect or clear the report disk cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
        /// Cache root directory
        #[arg(long, env = "DUMPSCOPE_CACHE_ROOT")]
        root: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Print entry count and location
    Stats,
    /// Remove every cached report
    Clear,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Finalize { input, output } => {
            let mut report = read_report(&input)?;
            finalizer::finalize(&mut report);
            let json = serde_json::to_string_pretty(&report)?;
            match output {
                Some(path) => fs::write(&path, json)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => println!("{json}"),
            }
            Ok(0)
        }
        Commands::Validate { input } => {
            let report = read_report(&input)?;
            match finalizer::validate(&report) {
                Ok(()) => {
                    println!("ok: {}", input.display());
                    Ok(0)
                }
                Err(e) => {
                    eprintln!("invalid: {e}");
                    Ok(1)
                }
            }
        }
        Commands::Cache { command, root } => {
            let cache = ReportDiskCache::new(root.unwrap_or_else(ReportDiskCache::default_root));
            match command {
                CacheCommands::Stats => {
                    println!("cached reports: {}", cache.len());
                    Ok(0)
                }
                CacheCommands::Clear => {
                    cache.clear()?;
                    println!("cache cleared");
                    Ok(0)
                }
            }
        }
    }
}

fn read_report(path: &PathBuf) -> Result<CrashReport> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid report JSON in {}", path.display()))
}
