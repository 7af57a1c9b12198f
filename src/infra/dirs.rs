//! Work directory layout
//!
//! Every directory has a fixed system default and can be overridden from
//! the environment:
//! - `FORESTBUILD_CONF_DIR` - tree registry (`forest.conf`)
//! - `FORESTBUILD_CACHE_DIR` - downloaded tarballs and VCS mirrors
//! - `FORESTBUILD_BUILD_DIR` - scratch build directories
//! - `FORESTBUILD_LOG_DIR` - log file
//! - `FORESTBUILD_DPKG_DIR` - package database state
//! - `FORESTBUILD_AUTOBUILD_DIR` - autobuild configuration

use std::env;
use std::path::{Path, PathBuf};

use crate::config::defaults;
use crate::error::FilesystemError;
use crate::infra::filesystem;

/// Environment variable names for directory overrides
pub const ENV_CONF_DIR: &str = "FORESTBUILD_CONF_DIR";
pub const ENV_CACHE_DIR: &str = "FORESTBUILD_CACHE_DIR";
pub const ENV_BUILD_DIR: &str = "FORESTBUILD_BUILD_DIR";
pub const ENV_LOG_DIR: &str = "FORESTBUILD_LOG_DIR";
pub const ENV_DPKG_DIR: &str = "FORESTBUILD_DPKG_DIR";
pub const ENV_AUTOBUILD_DIR: &str = "FORESTBUILD_AUTOBUILD_DIR";

/// Directory provider for forestbuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDirs {
    conf_dir: PathBuf,
    cache_dir: PathBuf,
    build_dir: PathBuf,
    log_dir: PathBuf,
    dpkg_dir: PathBuf,
    autobuild_conf_dir: PathBuf,
}

impl WorkDirs {
    /// Resolve every directory from the environment or its default
    #[must_use]
    pub fn new() -> Self {
        Self {
            conf_dir: resolve(ENV_CONF_DIR, defaults::CONF_DIR),
            cache_dir: resolve(ENV_CACHE_DIR, defaults::CACHE_DIR),
            build_dir: resolve(ENV_BUILD_DIR, defaults::BUILD_DIR),
            log_dir: resolve(ENV_LOG_DIR, defaults::LOG_DIR),
            dpkg_dir: resolve(ENV_DPKG_DIR, defaults::DPKG_DIR),
            autobuild_conf_dir: resolve(ENV_AUTOBUILD_DIR, defaults::AUTOBUILD_CONF_DIR),
        }
    }

    /// Every directory under `root`, for tests and sandboxed runs
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self {
            conf_dir: root.join("conf"),
            cache_dir: root.join("cache"),
            build_dir: root.join("build"),
            log_dir: root.join("log"),
            dpkg_dir: root.join("dpkg"),
            autobuild_conf_dir: root.join("autobuild"),
        }
    }

    #[must_use]
    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    #[must_use]
    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    #[must_use]
    pub fn dpkg_dir(&self) -> &Path {
        &self.dpkg_dir
    }

    #[must_use]
    pub fn autobuild_conf_dir(&self) -> &Path {
        &self.autobuild_conf_dir
    }

    /// Path of the tree registry
    #[must_use]
    pub fn forest_conf(&self) -> PathBuf {
        self.conf_dir.join(defaults::FOREST_CONF)
    }

    /// Create the directories forestbuild writes to
    pub fn ensure(&self) -> Result<(), FilesystemError> {
        for dir in [&self.cache_dir, &self.build_dir, &self.conf_dir, &self.log_dir] {
            filesystem::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl Default for WorkDirs {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve(var: &str, default: &str) -> PathBuf {
    env::var_os(var)
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from(default), PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_falls_back_to_default() {
        assert_eq!(
            resolve("FORESTBUILD_TEST_UNSET_VARIABLE", "/var/cache/acbs"),
            PathBuf::from("/var/cache/acbs")
        );
    }

    #[test]
    fn test_under_root() {
        let dirs = WorkDirs::under(Path::new("/tmp/fb"));
        assert_eq!(dirs.forest_conf(), PathBuf::from("/tmp/fb/conf/forest.conf"));
        assert!(dirs.build_dir().starts_with("/tmp/fb"));
    }

    #[test]
    fn test_ensure_creates_directories() {
        let root = tempfile::TempDir::new().unwrap();
        let dirs = WorkDirs::under(root.path());
        dirs.ensure().unwrap();
        assert!(dirs.cache_dir().is_dir());
        assert!(dirs.build_dir().is_dir());
        assert!(dirs.log_dir().is_dir());
    }
}
