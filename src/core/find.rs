//! Recipe lookup
//!
//! Resolves a package name to parsed recipes inside a tree. A tree is laid
//! out as `<category>/<package>/{spec,autobuild/}`; package groups replace
//! `autobuild/` with numbered member directories (`01-foo/`, `02-foo-doc/`)
//! that share the group's `spec`.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::package::{wants_stage2, PackageDescriptor};
use crate::core::parser::{parse_package, split_modifiers, ParseContext};
use crate::error::{RecipeError, ResolverError};
use crate::infra::filesystem;

/// Finds recipes in one tree
#[derive(Debug, Clone)]
pub struct Locator {
    tree: PathBuf,
    ctx: ParseContext,
    build_root: PathBuf,
}

impl Locator {
    /// `build_root` receives the shared build directories of package groups
    pub fn new(tree: PathBuf, ctx: ParseContext, build_root: PathBuf) -> Self {
        Self {
            tree,
            ctx,
            build_root,
        }
    }

    pub fn tree(&self) -> &Path {
        &self.tree
    }

    pub fn context(&self) -> &ParseContext {
        &self.ctx
    }

    /// This locator, switched to stage 2 definitions when `modifiers` ask for it
    fn scoped(&self, modifiers: &str) -> Cow<'_, Self> {
        if self.ctx.stage2 || !wants_stage2(modifiers) {
            return Cow::Borrowed(self);
        }
        let mut scoped = self.clone();
        scoped.ctx.stage2 = true;
        Cow::Owned(scoped)
    }

    /// Find `name`, which may also be a list file relative to the tree
    pub fn find_package(&self, name: &str) -> Result<Vec<PackageDescriptor>, ResolverError> {
        let list = self.tree.join(name);
        if list.is_file() {
            return self.find_listed(name, &list);
        }

        let (bare, modifiers) = split_modifiers(name);
        let mut found = self.scoped(modifiers).find_package_inner(bare, false)?;
        if found.is_empty() {
            return Err(ResolverError::NotFound {
                name: bare.to_string(),
            });
        }
        for package in &mut found {
            package.modifiers = modifiers.to_string();
        }
        Ok(found)
    }

    fn find_listed(&self, name: &str, list: &Path) -> Result<Vec<PackageDescriptor>, ResolverError> {
        let content = filesystem::read_file(list).map_err(|e| RecipeError::IoError {
            path: list.to_path_buf(),
            error: e.to_string(),
        })?;
        let mut found = Vec::new();
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (entry, modifiers) = split_modifiers(line);
            let mut packages = self.scoped(modifiers).find_package_inner(entry, false)?;
            if packages.is_empty() {
                return Err(ResolverError::NotFoundInList {
                    name: entry.to_string(),
                    list: name.to_string(),
                });
            }
            for package in &mut packages {
                package.modifiers = modifiers.to_string();
            }
            found.extend(packages);
        }
        debug!("Found {} package(s) in {name}", found.len());
        Ok(found)
    }

    fn find_package_inner(
        &self,
        name: &str,
        group: bool,
    ) -> Result<Vec<PackageDescriptor>, ResolverError> {
        let direct = self.tree.join(name);
        if direct.join("autobuild").is_dir() {
            return Ok(vec![parse_package(&direct.join("autobuild"), &self.ctx)?]);
        }
        if direct.is_dir() {
            if let Some(found) = self.check_package_group(name, name)? {
                return Ok(found);
            }
        }

        for category in sorted_subdirs(&self.tree)? {
            for entry in sorted_subdirs(&self.tree.join(&category))? {
                let slug = format!("{category}/{entry}");
                if entry == name && self.tree.join(&slug).join("autobuild").is_dir() {
                    let location = self.tree.join(&slug).join("autobuild");
                    return Ok(vec![parse_package(&location, &self.ctx)?]);
                }
                if group {
                    if let Some(found) = self.check_package_group(name, &slug)? {
                        return Ok(found);
                    }
                }
            }
        }

        if group {
            Ok(Vec::new())
        } else {
            self.find_package_inner(name, true)
        }
    }

    /// Expand the group at `slug` if `name` is the group or one of its members
    fn check_package_group(
        &self,
        name: &str,
        slug: &str,
    ) -> Result<Option<Vec<PackageDescriptor>>, ResolverError> {
        let dir = self.tree.join(slug);
        if dir.join("autobuild").exists() {
            return Ok(None);
        }
        if dir.file_name() == Path::new(name).file_name() && dir.join("spec").is_file() {
            return self.expand_package_group(slug).map(Some);
        }

        for member in sorted_subdirs(&dir)? {
            let member_dir = dir.join(&member);
            if !member_dir.join("defines").is_file() {
                continue;
            }
            match parse_package(&member_dir, &self.ctx) {
                Ok(package) if package.name == name => {
                    return self.expand_package_group(slug).map(Some);
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping group member {}: {e}", member_dir.display()),
            }
        }
        Ok(None)
    }

    /// All members of the group at `slug`, in sequence order, sharing one
    /// fresh build directory
    pub fn expand_package_group(&self, slug: &str) -> Result<Vec<PackageDescriptor>, ResolverError> {
        let dir = self.tree.join(slug);
        let mut members = Vec::new();
        for member in sorted_subdirs(&dir)? {
            let member_dir = dir.join(&member);
            let sequence = member
                .split_once('-')
                .and_then(|(seq, rest)| (!rest.is_empty()).then_some(seq))
                .and_then(|seq| seq.parse::<u32>().ok())
                .ok_or_else(|| RecipeError::MalformedGroupMember {
                    path: member_dir.clone(),
                })?;
            let mut package = parse_package(&member_dir, &self.ctx)?;
            package.group_slug = Some(slug.to_string());
            package.group_sequence = sequence;
            members.push(package);
        }
        members.sort_by_key(|p| p.group_sequence);

        if !members.is_empty() {
            let build_dir = filesystem::make_build_dir(&self.build_root)?;
            debug!(
                "Group {slug}: {} member(s) sharing {}",
                members.len(),
                build_dir.display()
            );
            for package in &mut members {
                package.build_location = Some(build_dir.clone());
            }
        }
        Ok(members)
    }
}

/// Visible subdirectory names of `dir`, sorted
fn sorted_subdirs(dir: &Path) -> Result<Vec<String>, RecipeError> {
    let entries = std::fs::read_dir(dir).map_err(|e| RecipeError::IoError {
        path: dir.to_path_buf(),
        error: e.to_string(),
    })?;
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| !n.starts_with('.') && n != "autobuild")
        .collect();
    names.sort();
    Ok(names)
}

/// Check that members of every group are built in increasing sequence
pub fn check_package_groups(packages: &[PackageDescriptor]) -> Result<(), ResolverError> {
    let mut last_seen: HashMap<&str, (u32, &str)> = HashMap::new();
    for package in packages {
        let Some(slug) = package.group_slug.as_deref() else {
            continue;
        };
        if let Some(&(sequence, name)) = last_seen.get(slug) {
            if package.group_sequence <= sequence {
                return Err(ResolverError::GroupOrder {
                    group: slug.to_string(),
                    earlier: package.name.clone(),
                    earlier_seq: package.group_sequence,
                    later: name.to_string(),
                    later_seq: sequence,
                });
            }
        }
        last_seen.insert(slug, (package.group_sequence, &package.name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Tree {
        dir: TempDir,
        build: TempDir,
    }

    impl Tree {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                build: TempDir::new().unwrap(),
            }
        }

        fn package(&self, slug: &str, name: &str) {
            let root = self.dir.path().join(slug);
            std::fs::create_dir_all(root.join("autobuild")).unwrap();
            std::fs::write(root.join("spec"), "VER=1\nDUMMYSRC=1\n").unwrap();
            std::fs::write(root.join("autobuild/defines"), format!("PKGNAME={name}\n")).unwrap();
        }

        fn group(&self, slug: &str, members: &[&str]) {
            let root = self.dir.path().join(slug);
            std::fs::create_dir_all(&root).unwrap();
            std::fs::write(root.join("spec"), "VER=2\nDUMMYSRC=1\n").unwrap();
            for member in members {
                let name = member.split_once('-').map_or(*member, |(_, n)| n);
                std::fs::create_dir_all(root.join(member)).unwrap();
                std::fs::write(root.join(member).join("defines"), format!("PKGNAME={name}\n"))
                    .unwrap();
            }
        }

        fn locator(&self) -> Locator {
            Locator::new(
                self.dir.path().to_path_buf(),
                ParseContext::new("amd64"),
                self.build.path().to_path_buf(),
            )
        }
    }

    fn names(packages: &[PackageDescriptor]) -> Vec<&str> {
        packages.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_find_by_directory_name() {
        let tree = Tree::new();
        tree.package("app-misc/foo", "foo");
        tree.package("app-misc/bar", "bar");
        let found = tree.locator().find_package("foo").unwrap();
        assert_eq!(names(&found), vec!["foo"]);
        assert_eq!(found[0].group_slug, None);
    }

    #[test]
    fn test_find_by_path() {
        let tree = Tree::new();
        tree.package("app-misc/foo", "foo");
        let found = tree.locator().find_package("app-misc/foo").unwrap();
        assert_eq!(names(&found), vec!["foo"]);
    }

    #[test]
    fn test_modifiers_are_kept() {
        let tree = Tree::new();
        tree.package("app-misc/foo", "foo");
        let found = tree.locator().find_package("foo:+stage2").unwrap();
        assert_eq!(found[0].modifiers, "+stage2");
    }

    #[test]
    fn test_stage2_modifier_uses_stage2_defines() {
        let tree = Tree::new();
        tree.package("app-misc/foo", "foo");
        std::fs::write(
            tree.dir.path().join("app-misc/foo/autobuild/defines.stage2"),
            "PKGNAME=foo\nPKGDEP=\"bootstrap-only\"\n",
        )
        .unwrap();

        let plain = tree.locator().find_package("foo").unwrap();
        assert!(plain[0].deps.is_empty());
        let staged = tree.locator().find_package("foo:+stage2").unwrap();
        assert_eq!(staged[0].deps, vec!["bootstrap-only"]);
        assert!(staged[0].in_stage2());
    }

    #[test]
    fn test_not_found() {
        let tree = Tree::new();
        tree.package("app-misc/foo", "foo");
        assert!(matches!(
            tree.locator().find_package("nope"),
            Err(ResolverError::NotFound { .. })
        ));
    }

    #[test]
    fn test_group_by_member_name() {
        let tree = Tree::new();
        tree.group("lang/llvm", &["02-clang", "01-llvm", "10-lld"]);
        let found = tree.locator().find_package("clang").unwrap();
        assert_eq!(names(&found), vec!["llvm", "clang", "lld"]);
        let sequences: Vec<u32> = found.iter().map(|p| p.group_sequence).collect();
        assert_eq!(sequences, vec![1, 2, 10]);
        assert!(found.iter().all(|p| p.group_slug.as_deref() == Some("lang/llvm")));
        let dir = found[0].build_location.clone().unwrap();
        assert!(dir.is_dir());
        assert!(found.iter().all(|p| p.build_location.as_ref() == Some(&dir)));
    }

    #[test]
    fn test_group_by_directory_name() {
        let tree = Tree::new();
        tree.group("lang/llvm-suite", &["01-llvm", "02-clang"]);
        let found = tree.locator().find_package("llvm-suite").unwrap();
        assert_eq!(names(&found), vec!["llvm", "clang"]);
    }

    #[test]
    fn test_malformed_group_member() {
        let tree = Tree::new();
        tree.group("lang/llvm", &["01-llvm", "clang"]);
        let err = tree.locator().find_package("llvm").unwrap_err();
        assert!(matches!(
            err,
            ResolverError::Recipe(RecipeError::MalformedGroupMember { .. })
        ));
    }

    #[test]
    fn test_list_file() {
        let tree = Tree::new();
        tree.package("app-misc/foo", "foo");
        tree.package("app-misc/bar", "bar");
        std::fs::create_dir_all(tree.dir.path().join("groups")).unwrap();
        std::fs::write(
            tree.dir.path().join("groups/base"),
            "# base set\nbar\n\nfoo:+stage2\n",
        )
        .unwrap();
        let found = tree.locator().find_package("groups/base").unwrap();
        assert_eq!(names(&found), vec!["bar", "foo"]);
        assert_eq!(found[1].modifiers, "+stage2");
    }

    #[test]
    fn test_list_file_with_missing_entry() {
        let tree = Tree::new();
        tree.package("app-misc/foo", "foo");
        std::fs::create_dir_all(tree.dir.path().join("groups")).unwrap();
        std::fs::write(tree.dir.path().join("groups/base"), "foo\nghost\n").unwrap();
        let err = tree.locator().find_package("groups/base").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Package 'ghost' requested in 'groups/base' was not found"
        );
    }

    fn member(name: &str, slug: &str, seq: u32) -> PackageDescriptor {
        let mut p = PackageDescriptor::new(name, "1", PathBuf::from(name));
        p.group_slug = Some(slug.to_string());
        p.group_sequence = seq;
        p
    }

    #[test]
    fn test_check_package_groups_in_order() {
        let packages = vec![
            member("a", "g/x", 1),
            PackageDescriptor::new("other", "1", PathBuf::from("o")),
            member("b", "g/x", 2),
            member("c", "g/y", 1),
            member("d", "g/x", 5),
        ];
        assert!(check_package_groups(&packages).is_ok());
    }

    #[test]
    fn test_check_package_groups_violation_names_both() {
        let packages = vec![member("b", "g/x", 2), member("a", "g/x", 1)];
        let err = check_package_groups(&packages).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'a'"));
        assert!(msg.contains("'b'"));
    }

    #[test]
    fn test_check_package_groups_rejects_repeated_sequence() {
        let packages = vec![member("a", "g/x", 1), member("b", "g/x", 1)];
        assert!(check_package_groups(&packages).is_err());
    }
}
