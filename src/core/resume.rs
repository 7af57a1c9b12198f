//! Resuming from a checkpoint
//!
//! Compares the recipes of a checkpointed queue with the tree as it is
//! now. Unchanged packages keep their place; changed ones are looked up
//! again. A change before the cursor invalidates the saved order, so the
//! remaining queue must be resolved again.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::core::checkpoint::{checkpoint_to_group, fingerprint_recipe, CheckpointState};
use crate::core::find::Locator;
use crate::core::package::PackageDescriptor;
use crate::core::pm::{Gate, PackageManager};
use crate::error::{CheckpointError, ForestbuildError};
use crate::infra::filesystem;

/// What to do with the remaining queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    /// Build the queue as it is
    Continue,
    /// Resolve dependencies of the queue again first
    Reresolve,
}

#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub action: ResumeAction,
    /// Packages still to build, starting with the one that failed
    pub packages: Vec<PackageDescriptor>,
    /// Packages whose recipes changed since the checkpoint
    pub re_resolved: Vec<String>,
}

/// Give every group a fresh shared build directory and clear the others
pub fn reassign_build_dirs(
    packages: &mut [PackageDescriptor],
    build_root: &Path,
) -> Result<(), ForestbuildError> {
    let mut groups: HashMap<String, PathBuf> = HashMap::new();
    for package in packages {
        package.build_location = match &package.group_slug {
            Some(slug) => {
                if !groups.contains_key(slug) {
                    groups.insert(slug.clone(), filesystem::make_build_dir(build_root)?);
                }
                groups.get(slug).cloned()
            }
            None => None,
        };
    }
    Ok(())
}

fn start_index(state: &CheckpointState) -> Result<usize, CheckpointError> {
    if state.cursor > state.packages.len() {
        return Err(CheckpointError::CursorOutOfRange {
            cursor: state.cursor,
            len: state.packages.len(),
        });
    }
    Ok(state.cursor.saturating_sub(1))
}

/// Work out how to continue the queue saved in `state`
pub fn plan_resume<P: PackageManager>(
    state: &CheckpointState,
    locator: &Locator,
    gate: &Gate<P>,
    build_root: &Path,
) -> Result<ResumePlan, ForestbuildError> {
    if state.version != env!("CARGO_PKG_VERSION") {
        warn!(
            "The state was checkpointed with forestbuild {}, this is {}",
            state.version,
            env!("CARGO_PKG_VERSION")
        );
        warn!("Undefined behavior might occur!");
    }

    let original_cursor = start_index(state)?;
    if state.no_deps {
        warn!("Resuming without dependency resolution.");
        let mut packages = state.packages[original_cursor..].to_vec();
        reassign_build_dirs(&mut packages, build_root)?;
        return Ok(ResumePlan {
            action: ResumeAction::Continue,
            packages,
            re_resolved: Vec::new(),
        });
    }

    info!("Validating status...");
    if state.packages.len() != state.sps.len() {
        return Err(CheckpointError::FingerprintCountMismatch {
            packages: state.packages.len(),
            fingerprints: state.sps.len(),
        }
        .into());
    }

    let mut resumed: Vec<PackageDescriptor> = Vec::with_capacity(state.packages.len());
    let mut seen: HashSet<String> = HashSet::new();
    let mut re_resolved = Vec::new();
    let mut new_cursor = original_cursor;
    for (index, (package, saved)) in state.packages.iter().zip(&state.sps).enumerate() {
        let unchanged = match fingerprint_recipe(package) {
            Ok(current) => current == *saved,
            Err(e) => {
                debug!("{e}");
                false
            }
        };
        if unchanged {
            if seen.insert(package.name.clone()) {
                resumed.push(package.clone());
            }
            continue;
        }

        info!("Recipe of {} changed, looking it up again", package.name);
        if index < new_cursor {
            new_cursor = index;
        }
        re_resolved.push(package.name.clone());
        for found in locator.find_package(&package.name)? {
            if seen.insert(found.name.clone()) {
                resumed.push(found);
            }
        }
    }

    let live_state = gate.backend().state_fingerprint().unwrap_or_else(|e| {
        warn!("Could not fingerprint package database: {e}");
        String::new()
    });
    let new_cursor = new_cursor.min(resumed.len());
    if live_state != state.dpkg_state {
        warn!("DPKG state change detected. Re-checking dependencies...");
        let mut missing = Vec::new();
        for package in &resumed[..new_cursor] {
            if !gate.is_installed(&package.name)? {
                missing.push(package.name.clone());
            }
        }
        if !missing.is_empty() {
            let group = checkpoint_to_group(&resumed[new_cursor..], locator.tree())?;
            return Err(CheckpointError::PackageManagerRegression { missing, group }.into());
        }
    }

    let mut packages = resumed.split_off(new_cursor);
    reassign_build_dirs(&mut packages, build_root)?;
    let action = if new_cursor == original_cursor {
        ResumeAction::Continue
    } else {
        warn!("Scenario mismatch detected! Dependency resolution will be re-attempted.");
        ResumeAction::Reresolve
    };
    Ok(ResumePlan {
        action,
        packages,
        re_resolved,
    })
}
