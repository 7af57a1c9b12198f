//! Build checkpoints
//!
//! When a build fails, the queue is written to `<unix-seconds>.acbs-ckpt`
//! together with a fingerprint of every recipe and of the package
//! database, so that `--resume` can tell what changed in between.
//!
//! File layout: 8-byte magic, little-endian `u32` format revision, then the
//! bincode encoding of [`CheckpointState`].

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::defaults;
use crate::core::package::PackageDescriptor;
use crate::error::CheckpointError;

const MAGIC: &[u8; 8] = b"FBCKPT\0\0";
const FORMAT_REVISION: u32 = 1;

/// Time spent on one package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTiming {
    pub name: String,
    /// `None` when the package was only downloaded
    pub seconds: Option<f64>,
}

impl BuildTiming {
    pub fn built(name: impl Into<String>, seconds: f64) -> Self {
        Self {
            name: name.into(),
            seconds: Some(seconds),
        }
    }

    pub fn downloaded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seconds: None,
        }
    }
}

/// Snapshot of an interrupted build queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Number of packages started; the failed one is `packages[cursor - 1]`
    pub cursor: usize,
    pub timings: Vec<BuildTiming>,
    pub packages: Vec<PackageDescriptor>,
    /// Recipe fingerprints, one per package
    pub sps: Vec<String>,
    /// Package database fingerprint
    pub dpkg_state: String,
    pub no_deps: bool,
    /// Version of forestbuild that wrote the checkpoint
    pub version: String,
}

impl CheckpointState {
    pub fn new(
        cursor: usize,
        timings: Vec<BuildTiming>,
        packages: Vec<PackageDescriptor>,
        no_deps: bool,
    ) -> Self {
        Self {
            cursor,
            timings,
            packages,
            sps: Vec::new(),
            dpkg_state: String::new(),
            no_deps,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Record the fingerprints of every recipe and of the package database
    pub fn stamp(&mut self, dpkg_state: String) -> Result<(), CheckpointError> {
        self.sps = self
            .packages
            .iter()
            .map(fingerprint_recipe)
            .collect::<Result<_, _>>()?;
        self.dpkg_state = dpkg_state;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        let body = bincode::serialize(self).map_err(|e| CheckpointError::Encode(e.to_string()))?;
        let mut bytes = Vec::with_capacity(MAGIC.len() + 4 + body.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_REVISION.to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode checkpoint bytes; `path` is only used in errors
    pub fn from_bytes(bytes: &[u8], path: &Path) -> Result<Self, CheckpointError> {
        let header_len = MAGIC.len() + 4;
        if bytes.len() < header_len || &bytes[..MAGIC.len()] != MAGIC {
            return Err(CheckpointError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let mut revision = [0u8; 4];
        revision.copy_from_slice(&bytes[MAGIC.len()..header_len]);
        let revision = u32::from_le_bytes(revision);
        if revision != FORMAT_REVISION {
            warn!(
                "Checkpoint format revision {revision} differs from {FORMAT_REVISION}, decoding anyway"
            );
        }
        bincode::deserialize(&bytes[header_len..]).map_err(|e| CheckpointError::Decode {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Write to a new, uniquely named file in `dir`
    pub fn save_to(&self, dir: &Path) -> Result<PathBuf, CheckpointError> {
        let bytes = self.to_bytes()?;
        let (mut file, path) = create_unique(dir, &timestamp().to_string(), |stem| {
            format!("{stem}.{}", defaults::CHECKPOINT_SUFFIX)
        })?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| CheckpointError::Write {
                path: path.clone(),
                error: e.to_string(),
            })?;
        debug!("Checkpoint of {} package(s) written to {}", self.packages.len(), path.display());
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = std::fs::read(path).map_err(|e| CheckpointError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_bytes(&bytes, path)
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Create `dir/name(stem)`, trying `stem-1`, `stem-2`, ... when taken
fn create_unique(
    dir: &Path,
    stem: &str,
    name: impl Fn(&str) -> String,
) -> Result<(std::fs::File, PathBuf), CheckpointError> {
    let mut attempt = 0u32;
    loop {
        let candidate = if attempt == 0 {
            stem.to_string()
        } else {
            format!("{stem}-{attempt}")
        };
        let path = dir.join(name(&candidate));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 1000 => {
                attempt += 1;
            }
            Err(e) => {
                return Err(CheckpointError::Write {
                    path,
                    error: e.to_string(),
                })
            }
        }
    }
}

/// Digest over the recipe directory and its `spec`
///
/// The files are archived with fixed metadata, so only content, names,
/// symlink targets and the executable bit are covered.
pub fn fingerprint_recipe(package: &PackageDescriptor) -> Result<String, CheckpointError> {
    let recipe = &package.recipe_location;
    let fail = |path: &Path, error: &dyn std::fmt::Display| CheckpointError::Fingerprint {
        path: path.to_path_buf(),
        error: error.to_string(),
    };

    let mut archive = tar::Builder::new(Sha256::new());
    archive.mode(tar::HeaderMode::Deterministic);
    archive.follow_symlinks(false);

    let spec = package.spec_path();
    archive
        .append_path_with_name(&spec, "spec")
        .map_err(|e| fail(&spec, &e))?;
    for entry in WalkDir::new(recipe).sort_by_file_name().follow_links(false) {
        let entry = entry.map_err(|e| fail(recipe, &e))?;
        let relative = entry.path().strip_prefix(recipe).map_err(|e| fail(recipe, &e))?;
        let name = Path::new("recipe").join(relative);
        archive
            .append_path_with_name(entry.path(), &name)
            .map_err(|e| fail(entry.path(), &e))?;
    }

    let hasher = archive.into_inner().map_err(|e| fail(recipe, &e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Write the names of `packages` as a new group file under `<tree>/groups`
///
/// Returns the group's name relative to the tree, usable as a package
/// argument.
pub fn checkpoint_to_group(
    packages: &[PackageDescriptor],
    tree: &Path,
) -> Result<String, CheckpointError> {
    let groups = tree.join(defaults::GROUPS_DIR);
    std::fs::create_dir_all(&groups).map_err(|e| CheckpointError::Write {
        path: groups.clone(),
        error: e.to_string(),
    })?;

    let mut content = String::new();
    for package in packages {
        content.push_str(&package.name);
        content.push('\n');
    }
    let (mut file, path) = create_unique(&groups, &format!("acbs-{}", timestamp()), str::to_string)?;
    file.write_all(content.as_bytes())
        .map_err(|e| CheckpointError::Write {
            path: path.clone(),
            error: e.to_string(),
        })?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(format!("{}/{name}", defaults::GROUPS_DIR))
}
