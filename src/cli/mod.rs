//! Command-line interface module
//!
//! This module handles argument parsing and output formatting.
//! It contains no build logic - that belongs in the [`crate::core`] module.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::config::defaults;

/// forestbuild - package build orchestrator
///
/// Builds packages from an autobuild recipe tree in dependency order.
#[derive(Parser, Debug)]
#[command(name = "forestbuild")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Packages (or group files) to be built
    #[arg(value_name = "PACKAGES")]
    pub packages: Vec<String>,

    /// Increase verbosity to ease debugging process
    #[arg(short, long)]
    pub debug: bool,

    /// Specify which abbs-tree to use
    #[arg(short, long, default_value = defaults::DEFAULT_TREE)]
    pub tree: String,

    /// Clear build directory
    #[arg(short, long)]
    pub clear: bool,

    /// Skip dependency resolution
    #[arg(short = 'k', long = "skip-deps")]
    pub no_deps: bool,

    /// Only download source packages without building
    #[arg(short, long)]
    pub get: bool,

    /// (with -g) write checksums to spec files
    #[arg(short = 'w', long = "write-checksums", requires = "get")]
    pub write_checksums: bool,

    /// Resume a previous build attempt from a checkpoint file
    #[arg(short, long, value_name = "FILE")]
    pub resume: Option<PathBuf>,

    /// Save the resolved build order to a group file and exit
    #[arg(short = 'p', long)]
    pub save_list: bool,

    /// Try to reorder the packages to break dependency loops
    #[arg(short = 'e', long)]
    pub reorder: bool,

    /// Output in JSON format for scripting
    #[arg(long)]
    pub json: bool,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    /// Execute the CLI command
    pub async fn run(self) -> Result<()> {
        commands::build::execute(self).await
    }
}
