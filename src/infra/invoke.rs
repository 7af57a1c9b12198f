//! External build tool invocation
//!
//! Copies the recipe into the build directory, injects the package
//! definitions, runs `autobuild` and captures its output into a log file
//! next to the sources.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Mutex;

use tracing::{error, info, warn};

use crate::core::builder::BuildInvoker;
use crate::core::package::PackageDescriptor;
use crate::error::BuildError;
use crate::infra::filesystem;
use crate::infra::vcs::HELPER_SCRIPT;

/// Default build tool
pub const AUTOBUILD: &str = "autobuild";

/// Runs the autobuild tool for one package
#[derive(Debug, Clone)]
pub struct AutobuildInvoker {
    program: String,
    stage2: bool,
}

impl AutobuildInvoker {
    pub fn new(stage2: bool) -> Self {
        Self::with_program(AUTOBUILD, stage2)
    }

    /// Use `program` instead of `autobuild`
    pub fn with_program(program: impl Into<String>, stage2: bool) -> Self {
        Self {
            program: program.into(),
            stage2,
        }
    }

    /// Copy the recipe to `build_dir/autobuild` and inject definitions
    pub fn prepare(&self, package: &PackageDescriptor, build_dir: &Path) -> Result<(), BuildError> {
        let dst = build_dir.join("autobuild");
        if dst.exists() {
            filesystem::remove_dir_all(&dst)?;
        }
        filesystem::copy_dir(&package.recipe_location, &dst)?;

        let helper = package
            .build_location
            .as_deref()
            .unwrap_or(build_dir)
            .join(HELPER_SCRIPT);
        let stage2_defines = dst.join("defines.stage2");
        let defines = if (self.stage2 || package.in_stage2()) && stage2_defines.is_file() {
            stage2_defines
        } else {
            dst.join("defines")
        };
        let mut content = if defines.exists() {
            filesystem::read_file(&defines)?
        } else {
            String::new()
        };
        content.push_str(&defines_injection(package, &helper));
        filesystem::write_file(&defines, &content)?;

        filesystem::write_file(
            &dst.join("extra-dpkg-control"),
            &control_metadata(&tree_commit(&package.recipe_location)),
        )?;
        Ok(())
    }

    /// Variables added to the build tool's environment
    pub fn environment(package: &PackageDescriptor) -> Vec<(String, String)> {
        let mut env = vec![
            ("PKGREL".to_string(), package.release.clone()),
            ("PKGVER".to_string(), package.version.clone()),
            (
                "PKGEPOCH".to_string(),
                package.epoch.clone().unwrap_or_else(|| "0".to_string()),
            ),
        ];
        env.extend(package.exported.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    fn run_captured(&self, package: &PackageDescriptor, build_dir: &Path) -> Result<(), BuildError> {
        let program = which::which(&self.program).map_err(|_| BuildError::ToolNotFound {
            tool: self.program.clone(),
        })?;
        let (log, log_path) = open_log(build_dir)?;
        info!("Build log: {}", log_path.display());
        let log = Mutex::new(log);

        let mut child = Command::new(program)
            .current_dir(build_dir)
            .envs(Self::environment(package))
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BuildError::BuildFailed {
                package: package.name.clone(),
                error: e.to_string(),
            })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let status = std::thread::scope(|scope| {
            if let Some(out) = stdout {
                scope.spawn(|| tee(out, io::stdout(), &log));
            }
            if let Some(err) = stderr {
                scope.spawn(|| tee(err, io::stderr(), &log));
            }
            child.wait()
        })
        .map_err(|e| BuildError::BuildFailed {
            package: package.name.clone(),
            error: e.to_string(),
        })?;

        let footer = log_footer(status);
        if let Ok(mut file) = log.lock() {
            if let Err(e) = file.write_all(footer.as_bytes()) {
                warn!("Could not finish build log {}: {e}", log_path.display());
            }
        }
        if status.success() {
            Ok(())
        } else {
            Err(BuildError::BuildFailed {
                package: package.name.clone(),
                error: format!("{} did not exit successfully ({status})", self.program),
            })
        }
    }
}

impl BuildInvoker for AutobuildInvoker {
    fn invoke(&self, package: &PackageDescriptor, build_dir: &Path) -> Result<(), BuildError> {
        self.prepare(package, build_dir)?;
        self.run_captured(package, build_dir)?;
        check_artifact(&package.name, build_dir)
    }
}

/// Lines appended to `defines` so the build sees the recipe's version
pub fn defines_injection(package: &PackageDescriptor, helper: &Path) -> String {
    let helper = helper.display();
    let mut text = format!(
        "\nPKGREL='{}'\nPKGVER='{}'\nif [ -f '{helper}' ];then source '{helper}' && abinfo \"Injected ACBS definitions\";fi\n",
        package.release, package.version
    );
    if let Some(epoch) = package.epoch.as_deref().filter(|e| !e.is_empty()) {
        text.push_str(&format!("PKGEPOCH='{epoch}'"));
    }
    text
}

/// Extra control fields recorded in the produced package
pub fn control_metadata(commit: &str) -> String {
    format!(
        "X-AOSC-ACBS-Version: {}\nX-AOSC-Commit: {commit}",
        env!("CARGO_PKG_VERSION")
    )
}

/// `git describe` of the tree holding the recipe, or `unknown`
pub fn tree_commit(recipe_location: &Path) -> String {
    let output = Command::new("git")
        .args(["describe", "--always", "--dirty"])
        .current_dir(recipe_location)
        .stderr(Stdio::null())
        .output();
    match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).trim().to_string(),
        Ok(o) => {
            warn!("Could not determine tree commit: git exited with {}", o.status);
            "unknown".to_string()
        }
        Err(e) => {
            warn!("Could not determine tree commit: {e}");
            "unknown".to_string()
        }
    }
}

/// Fail unless the build left a `<name>*.deb` in `build_dir`
pub fn check_artifact(name: &str, build_dir: &Path) -> Result<(), BuildError> {
    let entries = std::fs::read_dir(build_dir).map_err(|e| BuildError::IoError {
        path: build_dir.to_path_buf(),
        error: e.to_string(),
    })?;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with(name) && file_name.ends_with(".deb") {
            return Ok(());
        }
    }
    error!("Autobuild malfunction! Emergency drop!");
    Err(BuildError::NoArtifact {
        package: name.to_string(),
        build_dir: build_dir.to_path_buf(),
    })
}

fn open_log(build_dir: &Path) -> Result<(File, PathBuf), BuildError> {
    let io_error = |e: &dyn std::fmt::Display| BuildError::IoError {
        path: build_dir.to_path_buf(),
        error: e.to_string(),
    };
    let (mut file, path) = tempfile::Builder::new()
        .prefix("acbs-build_")
        .suffix(".log")
        .tempfile_in(build_dir)
        .map_err(|e| io_error(&e))?
        .keep()
        .map_err(|e| io_error(&e))?;
    let header = format!(
        "!!ACBS Build Log\n!!Build start: {}\n",
        chrono::Local::now().format("%a %b %e %H:%M:%S %Y")
    );
    file.write_all(header.as_bytes()).map_err(|e| io_error(&e))?;
    Ok((file, path))
}

fn log_footer(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("\n!!Build killed with signal {signal}"),
        None => format!("\n!!Build exited with {}", status.code().unwrap_or(-1)),
    }
}

/// Copy `from` to `to` and into the log until end of stream
fn tee(mut from: impl Read, mut to: impl Write, log: &Mutex<File>) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = from.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        to.write_all(&buf[..n])?;
        to.flush()?;
        if let Ok(mut file) = log.lock() {
            file.write_all(&buf[..n])?;
        }
    }
}
