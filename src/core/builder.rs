//! Build orchestration
//!
//! Drives one build request: finds the requested recipes, resolves the
//! build order, then fetches, prepares and builds each package in turn.
//! When a package fails, the queue is checkpointed so that the build can
//! be resumed once the problem is sorted out.
//!
//! Packages are built strictly one at a time. A package whose in-tree
//! dependencies are neither built nor installed gets them built first,
//! through an explicit work stack.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::core::autobuild;
use crate::core::checkpoint::{checkpoint_to_group, BuildTiming, CheckpointState};
use crate::core::fetch::SourceProvider;
use crate::core::find::Locator;
use crate::core::package::{package_names, PackageDescriptor};
use crate::core::parser::validate_package_name;
use crate::core::pm::{Gate, PackageManager};
use crate::core::resolver::{ResolveOptions, Resolver};
use crate::core::resume::{plan_resume, ResumeAction};
use crate::error::{BuildError, CheckpointError, ForestbuildError, ResolverError};
use crate::infra::filesystem;

/// Runs the external build tool for one package
pub trait BuildInvoker {
    /// Build `package` whose sources are unpacked in `build_dir`
    fn invoke(&self, package: &PackageDescriptor, build_dir: &Path) -> Result<(), BuildError>;
}

/// Switches for one build request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Build the request as given, without dependency resolution
    pub no_deps: bool,
    /// Only fetch sources
    pub download_only: bool,
    /// Write checksums of fetched sources back into `spec` (with `download_only`)
    pub generate: bool,
    pub reorder: bool,
    /// Save the resolved queue as a group file instead of building
    pub save_list: bool,
    /// Stage 2 mode is active for the whole run
    pub stage2: bool,
}

/// Timings so far, and what was left when a build failed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildSummary {
    pub timings: Vec<BuildTiming>,
    /// The failed package first, then the ones after it
    pub unbuilt: Vec<String>,
}

impl BuildSummary {
    pub fn is_success(&self) -> bool {
        self.unbuilt.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// Every requested package was filtered out
    NothingToDo,
    /// The resolved queue was written to a group file
    QueueSaved { group: String, queue: Vec<String> },
    Built(BuildSummary),
}

struct Pending {
    package: PackageDescriptor,
    expanded: bool,
}

/// The build orchestrator
pub struct BuildCore<P, S, B> {
    locator: Locator,
    gate: Gate<P>,
    fetcher: S,
    invoker: B,
    options: BuildOptions,
    build_root: PathBuf,
    checkpoint_dir: PathBuf,
    /// 1-based position in the current queue
    cursor: usize,
    timings: Vec<BuildTiming>,
    built: HashSet<String>,
    unbuilt: Vec<String>,
}

impl<P: PackageManager, S: SourceProvider, B: BuildInvoker> BuildCore<P, S, B> {
    /// `build_root` receives one scratch directory per package or group
    pub fn new(
        locator: Locator,
        gate: Gate<P>,
        fetcher: S,
        invoker: B,
        options: BuildOptions,
        build_root: PathBuf,
    ) -> Self {
        Self {
            locator,
            gate,
            fetcher,
            invoker,
            options,
            build_root,
            checkpoint_dir: PathBuf::from("."),
            cursor: 0,
            timings: Vec::new(),
            built: HashSet::new(),
            unbuilt: Vec::new(),
        }
    }

    /// Write checkpoints to `dir` instead of the current directory
    #[must_use]
    pub fn with_checkpoint_dir(mut self, dir: PathBuf) -> Self {
        self.checkpoint_dir = dir;
        self
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn gate(&self) -> &Gate<P> {
        &self.gate
    }

    pub fn fetcher(&self) -> &S {
        &self.fetcher
    }

    pub fn invoker(&self) -> &B {
        &self.invoker
    }

    pub fn summary(&self) -> BuildSummary {
        BuildSummary {
            timings: self.timings.clone(),
            unbuilt: self.unbuilt.clone(),
        }
    }

    /// Look up every requested name (or group file) in the tree
    pub fn find_requested(&self, requests: &[String]) -> Result<Vec<PackageDescriptor>, ForestbuildError> {
        let mut packages = Vec::new();
        for (n, request) in requests.iter().enumerate() {
            if !validate_package_name(request) {
                return Err(ResolverError::InvalidName {
                    name: request.clone(),
                }
                .into());
            }
            debug!("Finding {request} ({}/{})...", n + 1, requests.len());
            packages.extend(self.locator.find_package(request)?);
        }
        Ok(packages)
    }

    /// Order `packages` for building
    pub fn resolve_deps(&self, packages: Vec<PackageDescriptor>) -> Result<Vec<PackageDescriptor>, ForestbuildError> {
        if self.options.no_deps {
            warn!("Warning: Dependency resolution disabled!");
            return Ok(packages);
        }
        let mut resolver = Resolver::new(&self.locator, &self.gate);
        let options = ResolveOptions {
            reorder: self.options.reorder,
            save_list: self.options.save_list,
        };
        Ok(resolver.resolve(packages, options)?)
    }

    /// Build the requested packages
    pub async fn build(&mut self, requests: &[String]) -> Result<BuildOutcome, ForestbuildError> {
        if self.options.stage2 {
            info!("Life-cycle: currently running in stage2 mode.");
        }
        info!("Searching and resolving dependencies...");
        let packages = self.find_requested(requests)?;
        let queue = self.resolve_deps(packages)?;
        if queue.is_empty() {
            info!("Nothing to do after dependency resolution");
            return Ok(BuildOutcome::NothingToDo);
        }
        info!("Dependencies resolved, {} packages in the queue", queue.len());
        info!("Packages to be built: {}", package_names(&queue, Some(5)));

        if self.options.save_list {
            let group = checkpoint_to_group(&queue, self.locator.tree())?;
            info!("Build queue saved to {group}");
            return Ok(BuildOutcome::QueueSaved {
                group,
                queue: queue.into_iter().map(|p| p.name).collect(),
            });
        }
        self.run_queue(queue).await
    }

    /// Continue the build saved in the checkpoint at `path`
    pub async fn resume(&mut self, path: &Path) -> Result<BuildOutcome, ForestbuildError> {
        info!("Resuming from {}", path.display());
        let state = CheckpointState::load(path)?;
        let plan = plan_resume(&state, &self.locator, &self.gate, &self.build_root)?;
        self.options.no_deps = state.no_deps;

        let queue = match plan.action {
            ResumeAction::Continue => plan.packages,
            ResumeAction::Reresolve => {
                let resolved = self.resolve_deps(plan.packages)?;
                info!("Dependencies resolved, {} packages in the queue", resolved.len());
                resolved
            }
        };
        if queue.is_empty() {
            info!("Nothing left to build");
            return Ok(BuildOutcome::NothingToDo);
        }
        info!("Resumed. {} packages to go.", queue.len());
        info!("Packages to be resumed: {}", package_names(&queue, Some(5)));
        self.timings = state.timings;
        self.run_queue(queue).await
    }

    async fn run_queue(&mut self, queue: Vec<PackageDescriptor>) -> Result<BuildOutcome, ForestbuildError> {
        self.cursor = 0;
        self.unbuilt.clear();
        match self.build_sequential(&queue).await {
            Ok(()) => Ok(BuildOutcome::Built(self.summary())),
            Err(error) => {
                let checkpoint = self.save_checkpoint(&queue);
                if let Err(e) = &checkpoint {
                    error!("Failed to save build status: {e}");
                }
                Err(ForestbuildError::Interrupted {
                    error: Box::new(error),
                    checkpoint,
                })
            }
        }
    }

    /// Build `queue` in order, stopping at the first failure
    pub async fn build_sequential(&mut self, queue: &[PackageDescriptor]) -> Result<(), ForestbuildError> {
        let total = queue.len();
        for (index, package) in queue.iter().enumerate() {
            self.cursor += 1;
            if self.built.contains(&package.name) {
                info!("{} was already built as a dependency, skipping", package.name);
                continue;
            }
            info!("Building {} ({}/{total})...", package.name, self.cursor);
            if let Err(e) = self.build_with_deps(package.clone()).await {
                self.unbuilt = queue[index..].iter().map(|p| p.name.clone()).collect();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Build `package`, building its missing in-tree dependencies first
    async fn build_with_deps(&mut self, package: PackageDescriptor) -> Result<(), ForestbuildError> {
        let mut stack = vec![Pending {
            package,
            expanded: false,
        }];
        while let Some(top) = stack.last_mut() {
            if !top.expanded {
                top.expanded = true;
                let missing = self.missing_dependencies(&mut top.package)?;
                if missing.is_empty() {
                    continue;
                }
                let active: Vec<String> = stack
                    .iter()
                    .filter(|p| p.expanded)
                    .map(|p| p.package.name.clone())
                    .collect();
                let mut secondary = Vec::new();
                for dep in missing {
                    if active.contains(&dep) {
                        let mut chain = active.clone();
                        chain.push(dep.clone());
                        return Err(BuildError::DependencyLoop { package: dep, chain }.into());
                    }
                    info!(
                        "{} requires {dep}, which has not been built yet",
                        active.last().map_or("", String::as_str)
                    );
                    secondary.extend(self.locator.find_package(&dep)?);
                }
                stack.extend(secondary.into_iter().rev().map(|package| Pending {
                    package,
                    expanded: false,
                }));
                continue;
            }

            let Some(Pending { package, .. }) = stack.pop() else {
                break;
            };
            if !self.built.contains(&package.name) {
                self.build_one(package).await?;
            }
        }
        Ok(())
    }

    /// In-tree dependencies of `package` that are neither built nor installed
    fn missing_dependencies(&self, package: &mut PackageDescriptor) -> Result<Vec<String>, ForestbuildError> {
        if self.options.no_deps {
            return Ok(Vec::new());
        }
        self.gate.filter_dependencies(package)?;
        let mut missing = Vec::new();
        for dep in &package.deps {
            if self.built.contains(dep) || self.gate.is_installed(dep)? {
                continue;
            }
            missing.push(dep.clone());
        }
        Ok(missing)
    }

    async fn build_one(&mut self, mut task: PackageDescriptor) -> Result<(), ForestbuildError> {
        let stamped = task.build_location.as_deref().is_some_and(filesystem::has_stamp);
        if !stamped {
            self.fetcher.fetch(&mut task).await?;
        }

        if self.options.download_only {
            if self.options.generate {
                autobuild::update_checksums(&task)?;
                info!("Updated checksum for {}", task.name);
            }
            self.timings.push(BuildTiming::downloaded(task.name.clone()));
            self.built.insert(task.name);
            return Ok(());
        }

        let root = match task.build_location.clone() {
            None => {
                let dir = filesystem::make_build_dir(&self.build_root)?;
                self.fetcher.process(&task, &dir).await?;
                task.build_location = Some(dir.clone());
                dir
            }
            Some(dir) => {
                // first member of a group
                if !stamped {
                    self.fetcher.process(&task, &dir).await?;
                    filesystem::write_stamp(&dir)?;
                }
                dir
            }
        };
        let subdir = match &task.subdir {
            Some(subdir) => subdir.clone(),
            None => filesystem::guess_subdir(&root)?
                .ok_or_else(|| BuildError::UnknownSubdir { build_dir: root.clone() })?,
        };
        let build_dir = root.join(subdir);

        if !task.installables.is_empty() {
            info!("Installing dependencies from repository...");
            self.gate.install(&task.installables)?;
        }

        let start = Instant::now();
        if let Err(e) = self.invoker.invoke(&task, &build_dir) {
            error!("Build directory of the failed package: {}", build_dir.display());
            return Err(e.into());
        }
        self.timings.push(BuildTiming::built(
            task.timing_label(),
            start.elapsed().as_secs_f64(),
        ));
        self.built.insert(task.name);
        Ok(())
    }

    fn save_checkpoint(&self, queue: &[PackageDescriptor]) -> Result<PathBuf, CheckpointError> {
        info!("Trying to save your build status...");
        let mut state = CheckpointState::new(
            self.cursor,
            self.timings.clone(),
            queue.to_vec(),
            self.options.no_deps,
        );
        let dpkg_state = self.gate.backend().state_fingerprint().unwrap_or_else(|e| {
            warn!("Could not fingerprint package database: {e}");
            String::new()
        });
        state.stamp(dpkg_state)?;
        let path = state.save_to(&self.checkpoint_dir)?;
        info!("... saved to {}", path.display());
        Ok(path)
    }
}
