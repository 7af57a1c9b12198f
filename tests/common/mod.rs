//! Common test utilities and helpers
//!
//! This module provides shared utilities for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use forestbuild::infra::dirs;
use tempfile::TempDir;

/// Test project context
///
/// A temporary root holding a recipe tree under `tree/`, a registry in
/// `conf/forest.conf` and every working directory forestbuild writes to.
pub struct TestProject {
    /// Temporary directory for the test project
    pub dir: TempDir,
}

impl TestProject {
    /// Create a new test project with a `default` tree registered
    pub fn new() -> Self {
        let project = Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        };
        project.create_dir("tree");
        project.create_file(
            "conf/forest.conf",
            &format!("[default]\nlocation = {}\n", project.tree().display()),
        );
        project
    }

    /// Get the path to the test project directory
    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Root of the recipe tree
    pub fn tree(&self) -> PathBuf {
        self.dir.path().join("tree")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.dir.path().join("build")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    /// Create a file in the test project
    pub fn create_file(&self, name: &str, content: &str) {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        std::fs::write(path, content).expect("Failed to write file");
    }

    /// Create a directory in the test project
    pub fn create_dir(&self, name: &str) {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(path).expect("Failed to create directory");
    }

    /// Check if a file exists in the test project
    pub fn file_exists(&self, name: &str) -> bool {
        self.dir.path().join(name).exists()
    }

    /// Read a file from the test project
    pub fn read_file(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).expect("Failed to read file")
    }

    /// Add a recipe without sources at `tree/<section>/<name>`
    pub fn add_package(&self, section: &str, name: &str, deps: &str) {
        self.add_recipe(section, name, "VER=1.0\nDUMMYSRC=1\n", &format!("PKGDEP=\"{deps}\"\n"));
    }

    /// Add a recipe with the given `spec` and extra `defines` lines
    pub fn add_recipe(&self, section: &str, name: &str, spec: &str, defines: &str) {
        let root = format!("tree/{section}/{name}");
        self.create_file(&format!("{root}/spec"), spec);
        self.create_file(
            &format!("{root}/autobuild/defines"),
            &format!("PKGNAME={name}\nPKGSEC=utils\nPKGDES=\"Test package {name}\"\n{defines}"),
        );
    }

    /// Command running the forestbuild binary inside this project
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_forestbuild"));
        cmd.current_dir(self.dir.path())
            .env(dirs::ENV_CONF_DIR, self.dir.path().join("conf"))
            .env(dirs::ENV_CACHE_DIR, self.cache_dir())
            .env(dirs::ENV_BUILD_DIR, self.build_dir())
            .env(dirs::ENV_LOG_DIR, self.dir.path().join("log"))
            .env(dirs::ENV_DPKG_DIR, self.dir.path().join("dpkg"))
            .env(dirs::ENV_AUTOBUILD_DIR, self.dir.path().join("autobuild"))
            .env("ARCH", "amd64")
            .env_remove("CROSS")
            .env_remove("ABSTAGE2")
            .env_remove("RUST_LOG")
            .env("NO_COLOR", "1");
        cmd
    }

    /// Run forestbuild with `args`
    pub fn run(&self, args: &[&str]) -> Output {
        self.command()
            .args(args)
            .output()
            .expect("Failed to execute forestbuild")
    }

    /// Single entry of `dir`, for directories holding one generated file
    pub fn only_entry(dir: &Path) -> PathBuf {
        let entries: Vec<_> = std::fs::read_dir(dir)
            .expect("Failed to read directory")
            .map(|e| e.expect("Failed to read entry").path())
            .collect();
        assert_eq!(entries.len(), 1, "expected one entry in {}", dir.display());
        entries.into_iter().next().expect("one entry")
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
