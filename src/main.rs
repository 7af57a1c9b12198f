//! forestbuild - package build orchestrator
//!
//! Entry point for the forestbuild command-line application.

use std::fs::{File, OpenOptions};
use std::sync::Mutex;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use forestbuild::cli::output::display_error;
use forestbuild::cli::Cli;
use forestbuild::config::defaults;
use forestbuild::infra::dirs::WorkDirs;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.run().await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!("{e:?}");
            display_error(&e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let ansi = std::env::var_os("NO_COLOR").is_none();

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(ansi);
    let file = open_log_file().map(|f| {
        fmt::layer()
            .with_writer(Mutex::new(f))
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
}

/// The persistent log, skipped when the log directory is not writable
fn open_log_file() -> Option<File> {
    let dir = WorkDirs::new().log_dir().to_path_buf();
    std::fs::create_dir_all(&dir).ok()?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(defaults::LOG_FILE))
        .ok()
}
