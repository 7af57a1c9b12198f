//! CLI command implementations
//!
//! forestbuild has a single command; [`Session`] gathers what every run
//! needs before the orchestrator is assembled.

pub mod build;

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::core::autobuild::is_in_stage2;
use crate::core::builder::{BuildCore, BuildOptions};
use crate::core::fetch::SourceFetcher;
use crate::core::find::Locator;
use crate::core::forest::get_tree_by_name;
use crate::core::parser::ParseContext;
use crate::core::pm::Gate;
use crate::infra::dirs::WorkDirs;
use crate::infra::invoke::AutobuildInvoker;
use crate::infra::pm::{detect_arch, DpkgBackend};

/// The orchestrator as assembled for a real run
pub type SystemCore = BuildCore<DpkgBackend, SourceFetcher, AutobuildInvoker>;

/// Environment of one forestbuild run
#[derive(Debug, Clone)]
pub struct Session {
    pub dirs: WorkDirs,
    pub tree_dir: PathBuf,
    pub arch: String,
    /// Stage 2 mode detected from the autobuild configuration
    pub stage2: bool,
}

impl Session {
    /// Prepare working directories and look up `tree` in `forest.conf`
    pub fn open(tree: &str) -> Result<Self> {
        Self::open_in(WorkDirs::new(), tree)
    }

    pub fn open_in(dirs: WorkDirs, tree: &str) -> Result<Self> {
        dirs.ensure().context("Failed to prepare working directories")?;
        let tree_dir = get_tree_by_name(dirs.conf_dir(), tree)?;
        let arch = detect_arch().context(
            "Unable to determine the build architecture, set ARCH or install dpkg",
        )?;
        let stage2 = is_in_stage2(dirs.autobuild_conf_dir())?;
        tracing::debug!(
            "Tree {} at {}, arch {arch}, stage2 {stage2}",
            tree,
            tree_dir.display()
        );
        Ok(Self {
            dirs,
            tree_dir,
            arch,
            stage2,
        })
    }

    /// Assemble the orchestrator for this session
    pub fn core(&self, mut options: BuildOptions) -> SystemCore {
        options.stage2 |= self.stage2;
        let ctx = ParseContext {
            arch: self.arch.clone(),
            stage2: options.stage2,
            generate: options.generate,
        };
        let build_dir = self.dirs.build_dir().to_path_buf();
        let locator = Locator::new(self.tree_dir.clone(), ctx, build_dir.clone());
        let gate = Gate::new(
            DpkgBackend::new(self.dirs.dpkg_dir().to_path_buf()),
            options.reorder,
        );
        let fetcher = SourceFetcher::new(self.dirs.cache_dir().to_path_buf(), options.generate);
        let invoker = AutobuildInvoker::new(options.stage2);
        BuildCore::new(locator, gate, fetcher, invoker, options, build_dir)
    }
}
