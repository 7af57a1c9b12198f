//! Integration tests for the build orchestrator
//!
//! Drives `BuildCore` over a real recipe tree with the real source
//! fetcher. The package database and the build tool are simulated by a
//! shared in-memory system where every successful build installs the
//! package, as autobuild does.

mod common;

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::Path;
use std::rc::Rc;

use common::TestProject;
use forestbuild::core::builder::{BuildCore, BuildInvoker, BuildOptions, BuildOutcome};
use forestbuild::core::checkpoint::CheckpointState;
use forestbuild::core::fetch::SourceFetcher;
use forestbuild::core::find::Locator;
use forestbuild::core::package::PackageDescriptor;
use forestbuild::core::parser::ParseContext;
use forestbuild::core::pm::{Gate, PackageManager};
use forestbuild::error::{BuildError, ForestbuildError, PackageManagerError};

#[derive(Default)]
struct System {
    installed: HashSet<String>,
    available: HashSet<String>,
    installs: Vec<Vec<String>>,
    builds: Vec<String>,
}

type Shared = Rc<RefCell<System>>;

struct SimulatedDpkg(Shared);

impl PackageManager for SimulatedDpkg {
    fn is_installed(&self, name: &str) -> Result<bool, PackageManagerError> {
        Ok(self.0.borrow().installed.contains(name))
    }

    fn is_available(&self, name: &str) -> Result<bool, PackageManagerError> {
        Ok(self.0.borrow().available.contains(name))
    }

    fn install(&self, names: &[String]) -> Result<(), PackageManagerError> {
        let mut system = self.0.borrow_mut();
        system.installed.extend(names.iter().cloned());
        system.installs.push(names.to_vec());
        Ok(())
    }

    fn state_fingerprint(&self) -> Result<String, PackageManagerError> {
        let mut names: Vec<_> = self.0.borrow().installed.iter().cloned().collect();
        names.sort();
        Ok(names.join(","))
    }

    fn repair(&self) -> Result<(), PackageManagerError> {
        Ok(())
    }
}

struct SimulatedAutobuild {
    system: Shared,
    failing: HashSet<String>,
}

impl BuildInvoker for SimulatedAutobuild {
    fn invoke(&self, package: &PackageDescriptor, build_dir: &Path) -> Result<(), BuildError> {
        assert!(build_dir.is_dir());
        if self.failing.contains(&package.name) {
            return Err(BuildError::BuildFailed {
                package: package.name.clone(),
                error: "exit status 1".to_string(),
            });
        }
        let mut system = self.system.borrow_mut();
        system.builds.push(package.name.clone());
        system.installed.insert(package.name.clone());
        Ok(())
    }
}

type Core = BuildCore<SimulatedDpkg, SourceFetcher, SimulatedAutobuild>;

fn core(project: &TestProject, system: &Shared, failing: &[&str], options: BuildOptions) -> Core {
    let locator = Locator::new(project.tree(), ParseContext::new("amd64"), project.build_dir());
    let gate = Gate::new(SimulatedDpkg(Rc::clone(system)), options.reorder);
    let fetcher = SourceFetcher::new(project.cache_dir(), options.generate);
    let invoker = SimulatedAutobuild {
        system: Rc::clone(system),
        failing: failing.iter().map(|s| (*s).to_string()).collect(),
    };
    std::fs::create_dir_all(project.build_dir()).unwrap();
    BuildCore::new(locator, gate, fetcher, invoker, options, project.build_dir())
        .with_checkpoint_dir(project.path())
}

fn requests(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

fn stack(project: &TestProject) {
    project.add_package("app-web", "app", "libhttp libfoo-runtime");
    project.add_package("lang-libs", "libhttp", "libtls");
    project.add_package("lang-libs", "libtls", "");
}

// ============================================
// Building
// ============================================

#[tokio::test]
async fn test_builds_in_dependency_order() {
    let project = TestProject::new();
    stack(&project);
    let system = Shared::default();
    system.borrow_mut().available.insert("libfoo-runtime".to_string());

    let mut core = core(&project, &system, &[], BuildOptions::default());
    let BuildOutcome::Built(summary) = core.build(&requests(&["app"])).await.unwrap() else {
        panic!("expected a build");
    };

    assert!(summary.is_success());
    assert_eq!(system.borrow().builds, vec!["libtls", "libhttp", "app"]);
    assert_eq!(system.borrow().installs, vec![vec!["libfoo-runtime".to_string()]]);
    assert_eq!(summary.timings.len(), 3);
    assert!(summary.timings[2].name.starts_with("app (amd64 @ 1.0"));
}

#[tokio::test]
async fn test_installed_dependencies_are_not_rebuilt() {
    let project = TestProject::new();
    stack(&project);
    let system = Shared::default();
    {
        let mut s = system.borrow_mut();
        s.available.insert("libfoo-runtime".to_string());
        s.installed.insert("libtls".to_string());
    }

    let mut core = core(&project, &system, &[], BuildOptions::default());
    core.build(&requests(&["app"])).await.unwrap();
    assert_eq!(system.borrow().builds, vec!["libhttp", "app"]);
}

#[tokio::test]
async fn test_group_request() {
    let project = TestProject::new();
    stack(&project);
    project.create_file("tree/groups/web-stack", "# the web stack\nlibtls\nlibhttp\n");
    let system = Shared::default();

    let options = BuildOptions {
        no_deps: true,
        ..BuildOptions::default()
    };
    let mut core = core(&project, &system, &[], options);
    core.build(&requests(&["groups/web-stack"])).await.unwrap();
    assert_eq!(system.borrow().builds, vec!["libtls", "libhttp"]);
}

// ============================================
// Checkpoint and resume
// ============================================

#[tokio::test]
async fn test_failed_build_can_be_resumed() {
    let project = TestProject::new();
    stack(&project);
    let system = Shared::default();
    system.borrow_mut().available.insert("libfoo-runtime".to_string());

    let mut failing = core(&project, &system, &["libhttp"], BuildOptions::default());
    let err = failing.build(&requests(&["app"])).await.unwrap_err();
    let ForestbuildError::Interrupted { checkpoint, .. } = &err else {
        panic!("expected an interrupted build, got {err}");
    };
    let path = checkpoint.as_ref().unwrap().clone();
    assert!(path.starts_with(project.path()));
    assert!(path.to_string_lossy().ends_with(".acbs-ckpt"));
    assert!(err.to_string().contains("--resume"));

    let summary = failing.summary();
    assert_eq!(summary.unbuilt, vec!["libhttp", "app"]);
    assert_eq!(summary.timings.len(), 1);

    let state = CheckpointState::load(&path).unwrap();
    assert_eq!(state.cursor, 2);
    assert_eq!(state.packages.len(), 3);

    let mut resumed = core(&project, &system, &[], BuildOptions::default());
    let BuildOutcome::Built(summary) = resumed.resume(&path).await.unwrap() else {
        panic!("expected a build");
    };
    assert_eq!(system.borrow().builds, vec!["libtls", "libhttp", "app"]);
    assert_eq!(summary.timings.len(), 3);
    assert!(summary.timings[0].name.starts_with("libtls "));
}

#[tokio::test]
async fn test_resume_picks_up_fixed_recipe() {
    let project = TestProject::new();
    stack(&project);
    let system = Shared::default();
    system.borrow_mut().available.insert("libfoo-runtime".to_string());

    let mut failing = core(&project, &system, &["libhttp"], BuildOptions::default());
    let Err(ForestbuildError::Interrupted { checkpoint, .. }) = failing.build(&requests(&["app"])).await
    else {
        panic!("expected an interrupted build");
    };
    let path = checkpoint.unwrap();

    project.create_file("tree/lang-libs/libhttp/spec", "VER=1.1\nDUMMYSRC=1\n");

    let mut resumed = core(&project, &system, &[], BuildOptions::default());
    let BuildOutcome::Built(summary) = resumed.resume(&path).await.unwrap() else {
        panic!("expected a build");
    };
    assert_eq!(system.borrow().builds, vec!["libtls", "libhttp", "app"]);
    assert!(summary.timings[1].name.starts_with("libhttp (amd64 @ 1.1"));
}

#[tokio::test]
async fn test_resume_without_dependency_resolution() {
    let project = TestProject::new();
    stack(&project);
    let system = Shared::default();

    let options = BuildOptions {
        no_deps: true,
        ..BuildOptions::default()
    };
    let mut failing = core(&project, &system, &["libhttp"], options);
    let Err(ForestbuildError::Interrupted { checkpoint, .. }) =
        failing.build(&requests(&["libtls", "libhttp", "app"])).await
    else {
        panic!("expected an interrupted build");
    };
    let path = checkpoint.unwrap();

    let mut resumed = core(&project, &system, &[], BuildOptions::default());
    resumed.resume(&path).await.unwrap();
    assert!(resumed.options().no_deps);
    assert_eq!(system.borrow().builds, vec!["libtls", "libhttp", "app"]);
}

// ============================================
// Saving the queue
// ============================================

#[tokio::test]
async fn test_save_list_records_resolved_order() {
    let project = TestProject::new();
    stack(&project);
    let system = Shared::default();
    system.borrow_mut().available.insert("libfoo-runtime".to_string());

    let options = BuildOptions {
        save_list: true,
        ..BuildOptions::default()
    };
    let mut core = core(&project, &system, &[], options);
    let BuildOutcome::QueueSaved { group, queue } = core.build(&requests(&["app"])).await.unwrap()
    else {
        panic!("expected a saved queue");
    };
    assert_eq!(queue, vec!["libtls", "libhttp", "app"]);
    assert!(system.borrow().builds.is_empty());
    let content = std::fs::read_to_string(project.tree().join(&group)).unwrap();
    assert_eq!(content, "libtls\nlibhttp\napp\n");
}
