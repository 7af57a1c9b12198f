//! dpkg/apt package manager backend
//!
//! Queries go through `dpkg` and `apt`; installation prefers `oma` when it
//! is on `PATH` and falls back to `apt-get`.

use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::pm::PackageManager;
use crate::error::PackageManagerError;

/// Escape apt pattern characters in a package name
pub fn escape_package_name(name: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"([+*?])").expect("escape pattern is valid"))
        .replace_all(name, r"\$1")
        .into_owned()
}

/// Escape a package name for `apt-get install`
///
/// A trailing `+` or `-` would be read as an install/remove suffix, so one
/// more `+` is appended.
pub fn escape_package_name_install(name: &str) -> String {
    let escaped = escape_package_name(name);
    if escaped.ends_with('+') || escaped.ends_with('-') {
        format!("{escaped}+")
    } else {
        escaped
    }
}

/// Pick the build architecture from `CROSS`, `ARCH` and the host's answer
pub fn select_arch(cross: Option<String>, arch: Option<String>, host: impl FnOnce() -> Option<String>) -> Option<String> {
    cross
        .filter(|a| !a.is_empty())
        .or_else(|| arch.filter(|a| !a.is_empty()))
        .or_else(host)
}

/// Build architecture of this host
pub fn detect_arch() -> Option<String> {
    select_arch(
        std::env::var("CROSS").ok(),
        std::env::var("ARCH").ok(),
        || {
            let output = Command::new("dpkg")
                .arg("--print-architecture")
                .stderr(Stdio::null())
                .output()
                .ok()?;
            output
                .status
                .success()
                .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
                .filter(|a| !a.is_empty())
        },
    )
}

/// [`PackageManager`] backed by the system's dpkg database
#[derive(Debug, Clone)]
pub struct DpkgBackend {
    dpkg_dir: PathBuf,
}

impl DpkgBackend {
    pub fn new(dpkg_dir: PathBuf) -> Self {
        Self { dpkg_dir }
    }

    fn output(program: &str, args: &[&str]) -> Result<Output, PackageManagerError> {
        debug!("Running {program} {}", args.join(" "));
        Command::new(program)
            .args(args)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| PackageManagerError::Command {
                command: format!("{program} {}", args.join(" ")),
                error: e.to_string(),
            })
    }

    fn check(program: &str, args: &[&str]) -> Result<(), PackageManagerError> {
        let status = Command::new(program)
            .args(args)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .stdin(Stdio::null())
            .status()
            .map_err(|e| PackageManagerError::Command {
                command: format!("{program} {}", args.join(" ")),
                error: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(PackageManagerError::Command {
                command: format!("{program} {}", args.join(" ")),
                error: status.to_string(),
            })
        }
    }

    fn install_with_oma(names: &[String]) -> bool {
        if which::which("oma").is_err() {
            return false;
        }
        debug!("Installing {names:?} with oma");
        let mut args = vec!["install", "-y", "--force-confnew", "--no-progress"];
        args.extend(names.iter().map(String::as_str));
        match Self::check("oma", &args) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to use oma to install dependencies ({e}), falling back to apt...");
                false
            }
        }
    }
}

impl PackageManager for DpkgBackend {
    fn is_installed(&self, name: &str) -> Result<bool, PackageManagerError> {
        Ok(Self::output("dpkg", &["-s", name])?.status.success())
    }

    fn is_available(&self, name: &str) -> Result<bool, PackageManagerError> {
        let escaped = escape_package_name(name);
        if !Self::output("apt-cache", &["show", &escaped])?.status.success() {
            return Ok(false);
        }
        debug!("Checking if {name} can be installed");
        Ok(Self::output("apt-get", &["install", "-s", name])?.status.success())
    }

    fn install(&self, names: &[String]) -> Result<(), PackageManagerError> {
        if Self::install_with_oma(names) {
            return Ok(());
        }
        debug!("Installing {names:?} with apt-get");
        let escaped: Vec<String> = names.iter().map(|n| escape_package_name_install(n)).collect();
        let mut args = vec!["install", "-y", "-o", "Dpkg::Options::=--force-confnew"];
        args.extend(escaped.iter().map(String::as_str));
        Self::check("apt-get", &args)
    }

    fn state_fingerprint(&self) -> Result<String, PackageManagerError> {
        let status = self.dpkg_dir.join("status");
        let content = std::fs::read(&status).map_err(|e| PackageManagerError::IoError {
            path: status,
            error: e.to_string(),
        })?;
        Ok(hex::encode(Sha256::digest(content)))
    }

    fn repair(&self) -> Result<(), PackageManagerError> {
        if let Err(e) = Self::check("dpkg", &["--configure", "-a"]) {
            debug!("{e}");
        }
        Self::check("apt-get", &["install", "-yf"])
    }
}
