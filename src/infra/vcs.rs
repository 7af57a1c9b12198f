//! Version control operations
//!
//! Every VCS source is mirrored into the source cache first and then
//! checked out into the build directory at the pinned revision. Git
//! mirrors are maintained with gix; checkouts and the other systems go
//! through their command line tools.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::core::package::{SourceDescriptor, SourceKind, SubmodulePolicy};
use crate::error::FetchError;
use crate::infra::filesystem;

/// Helper sourced by the build tool so recipes can copy the git mirror
pub const HELPER_SCRIPT: &str = ".acbs-script";

/// One external tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub program: &'static str,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl ExternalCommand {
    pub fn new(program: &'static str) -> Self {
        Self {
            program,
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Human readable form for logs and errors
    pub fn display(&self) -> String {
        let mut line = self.program.to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    pub fn run(&self) -> Result<(), FetchError> {
        debug!("Running {}", self.display());
        let mut command = Command::new(self.program);
        command.args(&self.args).stdin(Stdio::null());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        let status = command.status().map_err(|e| FetchError::Command {
            command: self.display(),
            error: e.to_string(),
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(FetchError::Command {
                command: self.display(),
                error: status.to_string(),
            })
        }
    }
}

/// Location of the cache mirror for a source cached as `name`
pub fn mirror_path(kind: SourceKind, cache_dir: &Path, name: &str) -> PathBuf {
    match kind {
        SourceKind::Fossil => cache_dir.join(format!("{name}.fossil")),
        _ => cache_dir.join(name),
    }
}

fn require_revision(source: &SourceDescriptor) -> Result<&str, FetchError> {
    source
        .revision
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| FetchError::MissingRevision {
            kind: source.kind.to_string(),
            url: source.url.clone(),
        })
}

/// Commands that create or refresh the mirror of a non-git VCS source
pub fn mirror_commands(source: &SourceDescriptor, mirror: &Path) -> Result<Vec<ExternalCommand>, FetchError> {
    let exists = mirror.exists();
    let commands = match source.kind {
        SourceKind::Svn => {
            let revision = require_revision(source)?;
            info!("Checking out subversion repository at r{revision}");
            if exists {
                vec![ExternalCommand::new("svn")
                    .arg("up")
                    .arg("--force")
                    .arg("-r")
                    .arg(revision)
                    .current_dir(mirror)]
            } else {
                vec![ExternalCommand::new("svn")
                    .arg("co")
                    .arg("--force")
                    .arg("-r")
                    .arg(revision)
                    .arg(&source.url)
                    .arg(mirror)]
            }
        }
        SourceKind::Hg if exists => vec![ExternalCommand::new("hg").arg("pull").current_dir(mirror)],
        SourceKind::Hg => vec![ExternalCommand::new("hg")
            .arg("clone")
            .arg("-U")
            .arg(&source.url)
            .arg(mirror)],
        SourceKind::Bzr if exists => vec![ExternalCommand::new("bzr").arg("pull").current_dir(mirror)],
        SourceKind::Bzr => vec![ExternalCommand::new("bzr")
            .arg("branch")
            .arg("--no-tree")
            .arg(&source.url)
            .arg(mirror)],
        SourceKind::Fossil if exists => vec![ExternalCommand::new("fossil")
            .arg("pull")
            .arg("-R")
            .arg(mirror)],
        SourceKind::Fossil => vec![ExternalCommand::new("fossil")
            .arg("clone")
            .arg(&source.url)
            .arg(mirror)],
        other => {
            return Err(FetchError::Command {
                command: format!("mirror {other}"),
                error: "not a command line VCS".to_string(),
            })
        }
    };
    if exists {
        info!("Updating repository...");
    }
    Ok(commands)
}

fn git_error(url: &str) -> impl Fn(&dyn std::fmt::Display) -> FetchError + '_ {
    move |e| FetchError::Git {
        url: url.to_string(),
        error: e.to_string(),
    }
}

/// Create or refresh a bare mirror of a git repository
pub fn git_mirror(url: &str, mirror: &Path) -> Result<(), FetchError> {
    let fail = git_error(url);
    if mirror.exists() {
        info!("Updating repository...");
        let repo = gix::open(mirror).map_err(|e| fail(&e))?;
        let remote = repo
            .find_default_remote(gix::remote::Direction::Fetch)
            .ok_or_else(|| fail(&"no remote configured"))?
            .map_err(|e| fail(&e))?;
        remote
            .connect(gix::remote::Direction::Fetch)
            .map_err(|e| fail(&e))?
            .prepare_fetch(gix::progress::Discard, Default::default())
            .map_err(|e| fail(&e))?
            .receive(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
            .map_err(|e| fail(&e))?;
        return Ok(());
    }

    info!("Cloning {url}");
    let mut prepare = gix::prepare_clone_bare(url, mirror).map_err(|e| fail(&e))?;
    prepare
        .fetch_only(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
        .map_err(|e| fail(&e))?;
    Ok(())
}

/// Check out a git mirror into `build_dir/dest_name`
pub fn git_checkout(
    source: &SourceDescriptor,
    mirror: &Path,
    build_dir: &Path,
    dest_name: &str,
) -> Result<(), FetchError> {
    let revision = require_revision(source)?;
    let checkout = build_dir.join(dest_name);
    filesystem::create_dir_all(&checkout)?;

    info!("Checking out git repository at {revision}");
    git_in(mirror, &checkout)
        .arg("checkout")
        .arg("-f")
        .arg(revision)
        .run()?;

    if source.submodules != SubmodulePolicy::Off {
        info!("Fetching submodules (if any)...");
        let mut update = git_in(mirror, &checkout)
            .arg("submodule")
            .arg("update")
            .arg("--init")
            .current_dir(&checkout);
        if source.submodules == SubmodulePolicy::Recursive {
            update = update.arg("--recursive");
        }
        update.run()?;
    }

    if source.copy_repo {
        info!("Copying git folder...");
        let git_dir = checkout.join(".git");
        filesystem::copy_dir(mirror, &git_dir)?;
        let config = git_dir.join("config");
        let content = filesystem::read_file(&config)?;
        filesystem::write_file(&config, &content.replace("bare = true", "bare = false"))?;
        return Ok(());
    }

    filesystem::write_file(&build_dir.join(HELPER_SCRIPT), &helper_script(mirror))?;
    Ok(())
}

fn git_in(git_dir: &Path, work_tree: &Path) -> ExternalCommand {
    ExternalCommand::new("git")
        .arg("--git-dir")
        .arg(git_dir)
        .arg("--work-tree")
        .arg(work_tree)
}

/// Shell snippet defining `acbs_copy_git` for recipes that need the history
pub fn helper_script(mirror: &Path) -> String {
    format!(
        "ACBS_SRC='{}';acbs_copy_git(){{ abinfo 'Copying git folder...'; cp -ar \"${{ACBS_SRC}}\" .git/; sed -i 's|bare = true|bare = false|' '.git/config'; }}",
        mirror.display()
    )
}

/// Copy a subversion working copy into the build directory
pub fn svn_checkout(mirror: &Path, build_dir: &Path, dest_name: &str) -> Result<(), FetchError> {
    info!("Copying subversion repository...");
    filesystem::copy_dir(mirror, &build_dir.join(dest_name))?;
    Ok(())
}

/// Copy a mercurial mirror into the build directory and update it to the revision
pub fn hg_checkout(
    source: &SourceDescriptor,
    mirror: &Path,
    build_dir: &Path,
    dest_name: &str,
) -> Result<(), FetchError> {
    let revision = require_revision(source)?;
    let checkout = build_dir.join(dest_name);
    info!("Copying hg repository...");
    filesystem::copy_dir(mirror, &checkout)?;
    info!("Checking out hg repository at {revision}");
    ExternalCommand::new("hg")
        .arg("update")
        .arg("-C")
        .arg("-r")
        .arg(revision)
        .arg("-R")
        .arg(&checkout)
        .run()?;
    settle_hg_repository(source, mirror, &checkout)
}

/// Leave `.hg` in the checkout only for copy-repo sources, like git
fn settle_hg_repository(source: &SourceDescriptor, mirror: &Path, checkout: &Path) -> Result<(), FetchError> {
    let hg_dir = checkout.join(".hg");
    if !source.copy_repo {
        filesystem::remove_dir_all(&hg_dir)?;
        return Ok(());
    }
    if !hg_dir.is_dir() {
        info!("Copying hg repository...");
        filesystem::copy_dir(&mirror.join(".hg"), &hg_dir)?;
    }
    Ok(())
}

/// Copy a bazaar branch into the build directory and check out the revision
pub fn bzr_checkout(
    source: &SourceDescriptor,
    mirror: &Path,
    build_dir: &Path,
    dest_name: &str,
) -> Result<(), FetchError> {
    let revision = require_revision(source)?;
    let checkout = build_dir.join(dest_name);
    info!("Copying bzr repository...");
    filesystem::copy_dir(mirror, &checkout)?;
    info!("Checking out bzr repository at {revision}");
    ExternalCommand::new("bzr")
        .arg("co")
        .arg("-r")
        .arg(revision)
        .current_dir(&checkout)
        .run()
}

/// Open a fossil repository in the build directory at the revision
pub fn fossil_checkout(
    source: &SourceDescriptor,
    mirror: &Path,
    build_dir: &Path,
    dest_name: &str,
) -> Result<(), FetchError> {
    let revision = require_revision(source)?;
    let checkout = build_dir.join(dest_name);
    filesystem::create_dir_all(&checkout)?;
    info!("Opening up the fossil repository...");
    ExternalCommand::new("fossil")
        .arg("open")
        .arg(mirror)
        .current_dir(&checkout)
        .run()?;
    info!("Checking out fossil repository at {revision}");
    ExternalCommand::new("fossil")
        .arg("update")
        .arg(revision)
        .current_dir(&checkout)
        .run()
}
