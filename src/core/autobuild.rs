//! Autobuild integration
//!
//! Stage 2 detection from the autobuild configuration, and checksum
//! generation for `spec` files.

use std::path::Path;
use std::sync::OnceLock;

use regex::{NoExpand, Regex};
use tracing::{debug, info};

use crate::core::bashvar;
use crate::core::package::{PackageDescriptor, SourceKind};
use crate::error::{FetchError, RecipeError};
use crate::infra::download::file_digest;
use crate::infra::filesystem;

/// Environment variable forcing stage 2 mode
pub const STAGE2_ENV: &str = "ABSTAGE2";

/// Continuation used between entries of a multi-line `CHKSUMS`
const CHECKSUM_SEPARATOR: &str = " \\\n         ";

fn checksum_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?s)CHKSUM(?:S)?=['"].*?['"]"#).expect("checksum pattern is valid")
    })
}

/// Whether the build host is in stage 2 bootstrap mode
///
/// `ABSTAGE2=1` in the environment wins; otherwise `ab3cfg.sh` (or
/// `ab4cfg.sh` when the former is absent) in `conf_dir` is consulted.
pub fn is_in_stage2(conf_dir: &Path) -> Result<bool, RecipeError> {
    if std::env::var(STAGE2_ENV).is_ok_and(|v| v == "1") {
        return Ok(true);
    }
    let mut config = conf_dir.join("ab3cfg.sh");
    if !config.exists() {
        config = conf_dir.join("ab4cfg.sh");
    }
    if !config.exists() {
        debug!("No autobuild configuration in {}", conf_dir.display());
        return Ok(false);
    }
    is_in_stage2_file(&config)
}

/// Whether the autobuild configuration at `path` sets `ABSTAGE2=1`
pub fn is_in_stage2_file(path: &Path) -> Result<bool, RecipeError> {
    let source = std::fs::read_to_string(path).map_err(|e| RecipeError::IoError {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;
    let vars = bashvar::parse_assignments(&source, &path.display().to_string()).map_err(|source| {
        RecipeError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(vars.get(STAGE2_ENV).is_some_and(|v| v == "1"))
}

/// A `spec` written before `SRCS` existed
pub fn is_spec_legacy(spec: &str) -> bool {
    !spec.contains("SRCS=")
}

/// Render the checksum assignment for the fetched sources of `package`
///
/// Tarballs and files get a sha256 digest, every other kind `SKIP`. A
/// legacy spec whose first source is a tarball gets a single `CHKSUM`.
pub fn generate_checksums(package: &PackageDescriptor, legacy: bool) -> Result<String, FetchError> {
    let digest = |index: usize| -> Result<String, FetchError> {
        let source = &package.sources[index];
        let location = source.source_location().ok_or_else(|| FetchError::NotFetched {
            url: source.url.clone(),
        })?;
        let value = file_digest(location, "sha256")?.ok_or_else(|| FetchError::IoError {
            path: location.to_path_buf(),
            error: "unable to calculate checksum".to_string(),
        })?;
        Ok(format!("sha256::{value}"))
    };

    if legacy && package.sources.first().is_some_and(|s| s.kind == SourceKind::Tarball) {
        return Ok(format!("CHKSUM=\"{}\"", digest(0)?));
    }

    let mut sums = Vec::with_capacity(package.sources.len());
    for (index, source) in package.sources.iter().enumerate() {
        if matches!(source.kind, SourceKind::Tarball | SourceKind::File) {
            sums.push(digest(index)?);
        } else {
            sums.push("SKIP".to_string());
        }
    }
    let separator = if sums.len() < 2 { " " } else { CHECKSUM_SEPARATOR };
    Ok(format!("CHKSUMS=\"{}\"", sums.join(separator)))
}

/// Replace the checksum assignment in `spec_path`, appending one if missing
pub fn write_checksums(spec_path: &Path, checksums: &str) -> Result<(), FetchError> {
    let content = filesystem::read_file(spec_path)?;
    let pattern = checksum_pattern();
    let updated = if pattern.is_match(&content) {
        pattern.replace_all(&content, NoExpand(checksums)).into_owned()
    } else {
        format!("{}\n{checksums}\n", content.trim_end())
    };
    filesystem::write_file(spec_path, &updated)?;
    Ok(())
}

/// Generate checksums for `package` and write them into its `spec`
pub fn update_checksums(package: &PackageDescriptor) -> Result<(), FetchError> {
    let spec_path = package.spec_path();
    let legacy = is_spec_legacy(&filesystem::read_file(&spec_path)?);
    let checksums = generate_checksums(package, legacy)?;
    info!("Writing checksums for {}...", package.name);
    write_checksums(&spec_path, &checksums)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::package::SourceDescriptor;
    use crate::infra::download::compute_checksum;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn fetched(dir: &Path, kind: SourceKind, name: &str, content: &[u8]) -> SourceDescriptor {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        SourceDescriptor::new(kind, format!("https://x.org/{name}")).with_location(path)
    }

    // ============================================
    // Unit Tests - Stage 2
    // ============================================

    #[test]
    fn test_stage2_from_config_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ab4cfg.sh"), "ABSTAGE2=1\nABMK=make\n").unwrap();
        assert!(is_in_stage2_file(&dir.path().join("ab4cfg.sh")).unwrap());

        std::fs::write(dir.path().join("ab3cfg.sh"), "ABSTAGE2=0\n").unwrap();
        assert!(!is_in_stage2_file(&dir.path().join("ab3cfg.sh")).unwrap());
    }

    #[test]
    fn test_stage2_prefers_ab3cfg() {
        if std::env::var(STAGE2_ENV).is_ok() {
            return;
        }
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ab4cfg.sh"), "ABSTAGE2=1\n").unwrap();
        assert!(is_in_stage2(dir.path()).unwrap());

        std::fs::write(dir.path().join("ab3cfg.sh"), "ABSTAGE2=\n").unwrap();
        assert!(!is_in_stage2(dir.path()).unwrap());
    }

    #[test]
    fn test_stage2_without_config() {
        if std::env::var(STAGE2_ENV).is_ok() {
            return;
        }
        let dir = TempDir::new().unwrap();
        assert!(!is_in_stage2(dir.path()).unwrap());
    }

    // ============================================
    // Unit Tests - Checksums
    // ============================================

    #[test]
    fn test_is_spec_legacy() {
        assert!(is_spec_legacy("VER=1\nSRCTBL=https://x.org/a.tar.gz\n"));
        assert!(!is_spec_legacy("VER=1\nSRCS=\"tbl::https://x.org/a.tar.gz\"\n"));
    }

    #[test]
    fn test_generate_single_checksum() {
        let dir = TempDir::new().unwrap();
        let mut package = PackageDescriptor::new("foo", "1", PathBuf::from("/t/foo/autobuild"));
        package.sources = vec![fetched(dir.path(), SourceKind::Tarball, "a.tar.gz", b"a")];

        let expected = format!("CHKSUMS=\"sha256::{}\"", compute_checksum(b"a"));
        assert_eq!(generate_checksums(&package, false).unwrap(), expected);

        let legacy = format!("CHKSUM=\"sha256::{}\"", compute_checksum(b"a"));
        assert_eq!(generate_checksums(&package, true).unwrap(), legacy);
    }

    #[test]
    fn test_generate_multiple_checksums() {
        let dir = TempDir::new().unwrap();
        let mut package = PackageDescriptor::new("foo", "1", PathBuf::from("/t/foo/autobuild"));
        package.sources = vec![
            SourceDescriptor::new(SourceKind::Git, "https://x.org/foo.git"),
            fetched(dir.path(), SourceKind::File, "fix.patch", b"p"),
        ];

        let expected = format!(
            "CHKSUMS=\"SKIP \\\n         sha256::{}\"",
            compute_checksum(b"p")
        );
        // legacy only applies when the first source is a tarball
        assert_eq!(generate_checksums(&package, true).unwrap(), expected);
    }

    #[test]
    fn test_generate_requires_fetched_sources() {
        let mut package = PackageDescriptor::new("foo", "1", PathBuf::from("/t/foo/autobuild"));
        package.sources = vec![SourceDescriptor::new(SourceKind::File, "https://x.org/a")];
        assert!(matches!(
            generate_checksums(&package, false),
            Err(FetchError::NotFetched { .. })
        ));
    }

    #[test]
    fn test_write_checksums_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let spec = dir.path().join("spec");
        std::fs::write(
            &spec,
            "VER=1\nSRCS=\"tbl::a b\"\nCHKSUMS=\"sha256::old \\\n         SKIP\"\nREL=2\n",
        )
        .unwrap();

        write_checksums(&spec, "CHKSUMS=\"sha256::new\"").unwrap();
        assert_eq!(
            std::fs::read_to_string(&spec).unwrap(),
            "VER=1\nSRCS=\"tbl::a b\"\nCHKSUMS=\"sha256::new\"\nREL=2\n"
        );
    }

    #[test]
    fn test_write_checksums_appends_when_missing() {
        let dir = TempDir::new().unwrap();
        let spec = dir.path().join("spec");
        std::fs::write(&spec, "VER=1\nSRCS=\"tbl::a\"\n\n").unwrap();

        write_checksums(&spec, "CHKSUMS=\"sha256::$x\"").unwrap();
        assert_eq!(
            std::fs::read_to_string(&spec).unwrap(),
            "VER=1\nSRCS=\"tbl::a\"\nCHKSUMS=\"sha256::$x\"\n"
        );
    }

    #[test]
    fn test_update_checksums_writes_spec() {
        let dir = TempDir::new().unwrap();
        let recipe = dir.path().join("foo/autobuild");
        std::fs::create_dir_all(&recipe).unwrap();
        std::fs::write(dir.path().join("foo/spec"), "VER=1\nSRCS=\"file::https://x.org/a\"\n").unwrap();

        let mut package = PackageDescriptor::new("foo", "1", recipe);
        package.sources = vec![fetched(dir.path(), SourceKind::File, "a", b"data")];
        update_checksums(&package).unwrap();

        let spec = std::fs::read_to_string(dir.path().join("foo/spec")).unwrap();
        assert!(spec.ends_with(&format!("CHKSUMS=\"sha256::{}\"\n", compute_checksum(b"data"))));
    }
}
