//! Package manager gate
//!
//! Decides, for every dependency of a recipe, whether it is already
//! satisfied, can be installed from the binary repository, or has to be
//! built from the tree. Answers are memoized for the whole run.

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::defaults;
use crate::core::package::PackageDescriptor;
use crate::error::{PackageManagerError, ResolverError};

/// System package manager queries and actions
pub trait PackageManager {
    /// Whether `name` is installed on the build host
    fn is_installed(&self, name: &str) -> Result<bool, PackageManagerError>;

    /// Whether `name` can be installed from the repository
    fn is_available(&self, name: &str) -> Result<bool, PackageManagerError>;

    /// Install `names` from the repository
    fn install(&self, names: &[String]) -> Result<(), PackageManagerError>;

    /// Digest of the package database, used to detect outside changes
    fn state_fingerprint(&self) -> Result<String, PackageManagerError>;

    /// Try to bring the package database back into a consistent state
    fn repair(&self) -> Result<(), PackageManagerError>;
}

/// Memoizing front of a [`PackageManager`]
pub struct Gate<P> {
    backend: P,
    reorder: bool,
    installed: RefCell<HashMap<String, bool>>,
    available: RefCell<HashMap<String, bool>>,
}

impl<P: PackageManager> Gate<P> {
    /// In `reorder` mode installed dependencies are reported as installables
    /// so that the resolver can turn them back into edges.
    pub fn new(backend: P, reorder: bool) -> Self {
        Self {
            backend,
            reorder,
            installed: RefCell::new(HashMap::new()),
            available: RefCell::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &P {
        &self.backend
    }

    pub fn reorder(&self) -> bool {
        self.reorder
    }

    /// Run `query`, repairing the package database and retrying on failure
    fn query_with_repair(
        &self,
        name: &str,
        query: impl Fn(&P, &str) -> Result<bool, PackageManagerError>,
    ) -> Result<bool, PackageManagerError> {
        let mut attempts = 0;
        loop {
            match query(&self.backend, name) {
                Ok(answer) => return Ok(answer),
                Err(e) if attempts < defaults::PM_REPAIR_ATTEMPTS => {
                    attempts += 1;
                    warn!("{e}, attempting to correct package manager state...");
                    self.backend.repair()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn is_installed(&self, name: &str) -> Result<bool, PackageManagerError> {
        if let Some(&cached) = self.installed.borrow().get(name) {
            return Ok(cached);
        }
        debug!("Checking if {name} is installed");
        let answer = self.query_with_repair(name, P::is_installed)?;
        self.installed.borrow_mut().insert(name.to_string(), answer);
        Ok(answer)
    }

    pub fn is_available(&self, name: &str) -> Result<bool, PackageManagerError> {
        if let Some(&cached) = self.available.borrow().get(name) {
            return Ok(cached);
        }
        debug!("Checking if {name} is available");
        let answer = self.query_with_repair(name, P::is_available)?;
        self.available.borrow_mut().insert(name.to_string(), answer);
        Ok(answer)
    }

    /// Install `names`, repairing the database between failed attempts
    pub fn install(&self, names: &[String]) -> Result<(), PackageManagerError> {
        if names.is_empty() {
            return Ok(());
        }
        let Err(first) = self.backend.install(names) else {
            self.mark_installed(names);
            return Ok(());
        };
        warn!("Failed to install dependencies ({first}), attempting to correct issues...");
        for attempt in 1..=defaults::PM_REPAIR_ATTEMPTS {
            let result = self
                .backend
                .repair()
                .and_then(|()| self.backend.install(names));
            match result {
                Ok(()) => {
                    self.mark_installed(names);
                    return Ok(());
                }
                Err(e) => debug!("Install attempt {attempt} failed: {e}"),
            }
        }
        Err(PackageManagerError::Install {
            packages: names.to_vec(),
            attempts: defaults::PM_REPAIR_ATTEMPTS + 1,
        })
    }

    fn mark_installed(&self, names: &[String]) {
        let mut installed = self.installed.borrow_mut();
        for name in names {
            installed.insert(name.clone(), true);
        }
    }

    /// Split `package.deps` into in-tree builds and repository installables
    ///
    /// Runs once per package; later calls are no-ops.
    pub fn filter_dependencies(&self, package: &mut PackageDescriptor) -> Result<(), ResolverError> {
        if package.partitioned {
            return Ok(());
        }
        let mut deps = Vec::new();
        let mut installables = Vec::new();
        for dep in std::mem::take(&mut package.deps) {
            if self.is_installed(&dep)? {
                if self.reorder {
                    installables.push(dep);
                }
                continue;
            }
            if self.is_available(&dep)? {
                installables.push(dep);
                continue;
            }
            if dep == package.name {
                return Err(ResolverError::SelfDependency {
                    package: package.name.clone(),
                });
            }
            deps.push(dep);
        }
        debug!(
            "{}: build {:?}, install {:?}",
            package.name, deps, installables
        );
        package.deps = deps;
        package.installables = installables;
        package.partitioned = true;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakePackageManager;
    use super::*;
    use std::path::PathBuf;

    fn package(name: &str, deps: &[&str]) -> PackageDescriptor {
        let mut p = PackageDescriptor::new(name, "1", PathBuf::from(name));
        p.deps = deps.iter().map(|d| (*d).to_string()).collect();
        p
    }

    #[test]
    fn test_partition() {
        let gate = Gate::new(FakePackageManager::with(&["glibc"], &["zlib"]), false);
        let mut p = package("foo", &["glibc", "zlib", "bar"]);
        gate.filter_dependencies(&mut p).unwrap();
        assert_eq!(p.deps, vec!["bar"]);
        assert_eq!(p.installables, vec!["zlib"]);
        assert!(p.partitioned);
    }

    #[test]
    fn test_partition_runs_once() {
        let gate = Gate::new(FakePackageManager::with(&[], &["zlib"]), false);
        let mut p = package("foo", &["zlib"]);
        gate.filter_dependencies(&mut p).unwrap();
        p.deps.push("zlib".to_string());
        gate.filter_dependencies(&mut p).unwrap();
        assert_eq!(p.deps, vec!["zlib"]);
    }

    #[test]
    fn test_reorder_reports_installed_as_installable() {
        let gate = Gate::new(FakePackageManager::with(&["glibc"], &[]), true);
        let mut p = package("foo", &["glibc"]);
        gate.filter_dependencies(&mut p).unwrap();
        assert!(p.deps.is_empty());
        assert_eq!(p.installables, vec!["glibc"]);
    }

    #[test]
    fn test_self_dependency() {
        let gate = Gate::new(FakePackageManager::with(&[], &["rustc"]), false);
        let mut p = package("rustc", &["rustc"]);
        gate.filter_dependencies(&mut p).unwrap();
        assert!(p.deps.is_empty());
        assert_eq!(p.installables, vec!["rustc"]);

        let gate = Gate::new(FakePackageManager::with(&[], &[]), false);
        let mut p = package("rustc", &["rustc"]);
        assert!(matches!(
            gate.filter_dependencies(&mut p),
            Err(ResolverError::SelfDependency { .. })
        ));
    }

    #[test]
    fn test_queries_are_memoized() {
        let gate = Gate::new(FakePackageManager::with(&["a"], &[]), false);
        assert!(gate.is_installed("a").unwrap());
        assert!(gate.is_installed("a").unwrap());
        assert!(!gate.is_available("b").unwrap());
        assert!(!gate.is_available("b").unwrap());
        assert_eq!(gate.backend().queries.get(), 2);
    }

    #[test]
    fn test_query_failure_repairs_then_requeries() {
        let backend = FakePackageManager::with(&["a"], &[]);
        backend.broken_queries.set(2);
        let gate = Gate::new(backend, false);
        assert!(gate.is_installed("a").unwrap());
        assert_eq!(gate.backend().repairs.get(), 2);
    }

    #[test]
    fn test_query_failure_is_bounded() {
        let backend = FakePackageManager::with(&["a"], &[]);
        backend.broken_queries.set(100);
        let gate = Gate::new(backend, false);
        assert!(gate.is_installed("a").is_err());
        assert_eq!(gate.backend().repairs.get(), defaults::PM_REPAIR_ATTEMPTS);
    }

    #[test]
    fn test_install_retries_after_repair() {
        let backend = FakePackageManager::with(&[], &["zlib"]);
        backend.failing_installs.set(1);
        let gate = Gate::new(backend, false);
        gate.install(&["zlib".to_string()]).unwrap();
        assert_eq!(gate.backend().repairs.get(), 1);
        assert!(gate.is_installed("zlib").unwrap());
    }

    #[test]
    fn test_install_gives_up() {
        let backend = FakePackageManager::with(&[], &["zlib"]);
        backend.failing_installs.set(100);
        let gate = Gate::new(backend, false);
        let err = gate.install(&["zlib".to_string()]).unwrap_err();
        assert!(matches!(err, PackageManagerError::Install { .. }));
    }
}
