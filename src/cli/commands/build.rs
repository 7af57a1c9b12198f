//! Build command implementation
//!
//! Clears the build directory when asked, then builds or resumes and
//! prints the timing summary.

use std::path::Path;

use anyhow::{Context, Result};

use crate::cli::output::{self, create_clear_bar, full_line_banner, terminal_width};
use crate::cli::Cli;
use crate::core::builder::{BuildOptions, BuildOutcome};
use crate::error::ForestbuildError;
use crate::infra::filesystem;

use super::Session;

impl From<&Cli> for BuildOptions {
    fn from(cli: &Cli) -> Self {
        Self {
            no_deps: cli.no_deps,
            download_only: cli.get,
            generate: cli.write_checksums,
            reorder: cli.reorder,
            save_list: cli.save_list,
            stage2: false,
        }
    }
}

/// Version string shown in the welcome banner
pub fn version_string() -> String {
    match option_env!("VERGEN_GIT_SHA") {
        Some(sha) if !sha.is_empty() => format!("{} ({sha})", env!("CARGO_PKG_VERSION")),
        _ => env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// Execute a build (or resume) request
pub async fn execute(cli: Cli) -> Result<()> {
    let session = Session::open(&cli.tree)?;

    if cli.clear {
        clear_build_dir(session.dirs.build_dir(), cli.quiet)?;
    }
    if cli.packages.is_empty() && cli.resume.is_none() {
        if !cli.clear && !cli.quiet {
            println!("Nothing to build, specify packages or --resume");
        }
        return Ok(());
    }

    if !cli.quiet && !cli.json {
        println!(
            "{}",
            full_line_banner(
                &format!("Welcome to forestbuild - {}", version_string()),
                '-',
                terminal_width()
            )
        );
    }

    let mut core = session.core(BuildOptions::from(&cli));
    let result = match &cli.resume {
        Some(path) => core.resume(path).await,
        None => core.build(&cli.packages).await,
    };

    match result {
        Ok(outcome) => {
            report(&cli, &outcome);
            Ok(())
        }
        Err(err @ ForestbuildError::Interrupted { .. }) => {
            let summary = core.summary();
            if cli.json {
                println!("{}", output::outcome_json(Err(&summary)));
            } else if !cli.quiet {
                output::print_build_timings(&summary);
            }
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

fn report(cli: &Cli, outcome: &BuildOutcome) {
    if cli.json {
        println!("{}", output::outcome_json(Ok(outcome)));
        return;
    }
    if cli.quiet {
        return;
    }
    match outcome {
        BuildOutcome::NothingToDo => println!("Nothing to do after dependency resolution"),
        BuildOutcome::QueueSaved { group, queue } => {
            println!(
                "{} Saved {} package(s) to {group}",
                output::status::SUCCESS,
                queue.len()
            );
        }
        BuildOutcome::Built(summary) => output::print_build_timings(summary),
    }
}

/// Remove everything under the build directory
pub fn clear_build_dir(build_dir: &Path, quiet: bool) -> Result<()> {
    let entries: Vec<_> = std::fs::read_dir(build_dir)
        .with_context(|| format!("Failed to read {}", build_dir.display()))?
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("Failed to read {}", build_dir.display()))?;

    if entries.is_empty() {
        if !quiet {
            println!("Build directory clean, no need to clear...");
        }
        return Ok(());
    }

    let bar = create_clear_bar(entries.len() as u64);
    if quiet {
        bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }
    bar.set_message("Clearing build directory");
    for entry in entries {
        let path = entry.path();
        if path.is_dir() && !path.is_symlink() {
            filesystem::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        bar.inc(1);
    }
    bar.finish_with_message("Build directory cleared");
    Ok(())
}
