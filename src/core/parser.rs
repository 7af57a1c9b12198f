//! Recipe parsing
//!
//! Turns a recipe directory (`defines`, and the `spec` next to it) into a
//! [`PackageDescriptor`].

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::core::bashvar::{self, Variables};
use crate::core::package::{
    url_basename, ArchPattern, Checksum, PackageDescriptor, SourceDescriptor, SourceKind,
    SubmodulePolicy,
};
use crate::error::RecipeError;

/// Settings shared by every recipe parsed in one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseContext {
    /// Build architecture
    pub arch: String,
    /// Prefer `defines.stage2` when present
    pub stage2: bool,
    /// Checksums are being generated, so they may be missing
    pub generate: bool,
}

impl ParseContext {
    pub fn new(arch: impl Into<String>) -> Self {
        Self {
            arch: arch.into(),
            stage2: false,
            generate: false,
        }
    }
}

/// `spec` variables that are interpreted rather than exported
const SPEC_KEYS: &[&str] = &[
    "VER", "REL", "SRCS", "CHKSUMS", "SUBDIR", "DUMMYSRC", "SRCTBL", "CHKSUM", "GITSRC", "GITCO",
    "GITBRANCH", "SVNSRC", "SVNCO", "HGSRC", "HGCO", "BZRSRC", "BZRCO", "BKSRC", "BKCO",
];

fn read_assignments(path: &Path) -> Result<Variables, RecipeError> {
    let source = std::fs::read_to_string(path).map_err(|e| RecipeError::IoError {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;
    bashvar::parse_assignments(&source, &path.display().to_string()).map_err(|source| {
        RecipeError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Look up `name`, preferring `name__ARCH`
///
/// An empty `name__ARCH` still wins over `name`.
pub fn arch_lookup<'a>(vars: &'a Variables, name: &str, arch: &str) -> Option<&'a str> {
    let suffixed = format!("{name}__{}", arch.to_ascii_uppercase().replace('-', "_"));
    vars.get(&suffixed)
        .or_else(|| vars.get(name))
        .map(String::as_str)
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_ascii_lowercase).as_deref(),
        Some("y" | "yes" | "1" | "true")
    )
}

/// Parse the recipe rooted at `location`
pub fn parse_package(location: &Path, ctx: &ParseContext) -> Result<PackageDescriptor, RecipeError> {
    let stage2_defines = location.join("defines.stage2");
    let defines_path = if ctx.stage2 && stage2_defines.is_file() {
        debug!("Using stage 2 defines for {}", location.display());
        stage2_defines
    } else {
        location.join("defines")
    };
    let spec_path = location
        .parent()
        .map_or_else(|| PathBuf::from("spec"), |p| p.join("spec"));

    let defines = read_assignments(&defines_path)?;
    let spec = read_assignments(&spec_path)?;

    let name = defines
        .get("PKGNAME")
        .filter(|n| !n.is_empty())
        .cloned()
        .ok_or_else(|| RecipeError::MissingField {
            path: defines_path.clone(),
            field: "PKGNAME".to_string(),
        })?;
    let version = spec
        .get("VER")
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| RecipeError::MissingField {
            path: spec_path.clone(),
            field: "VER".to_string(),
        })?;

    let mut deps: Vec<String> = Vec::new();
    for key in ["PKGDEP", "BUILDDEP"] {
        for dep in arch_lookup(&defines, key, &ctx.arch)
            .unwrap_or_default()
            .split_whitespace()
        {
            if !deps.iter().any(|d| d == dep) {
                deps.push(dep.to_string());
            }
        }
    }

    let fail_arch = match defines.get("FAIL_ARCH").filter(|p| !p.is_empty()) {
        Some(expr) => Some(ArchPattern::compile(expr)?),
        None => None,
    };
    let noarch = is_truthy(defines.get("NOARCH").map(String::as_str))
        || defines.get("ABHOST").is_some_and(|h| h == "noarch");

    let mut package = PackageDescriptor::new(name, version, location.to_path_buf());
    package.release = spec
        .get("REL")
        .filter(|r| !r.is_empty())
        .cloned()
        .unwrap_or_else(|| "0".to_string());
    package.epoch = defines.get("PKGEPOCH").filter(|e| !e.is_empty()).cloned();
    package.deps = deps;
    package.sources = parse_sources(&spec, &spec_path, ctx)?;
    package.fail_arch = fail_arch;
    package.bin_arch = if noarch {
        "noarch".to_string()
    } else {
        ctx.arch.clone()
    };
    package.subdir = spec.get("SUBDIR").filter(|s| !s.is_empty()).cloned();
    package.exported = spec
        .iter()
        .filter(|(k, _)| !SPEC_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    debug!(
        "Parsed {} {} from {}",
        package.name,
        package.full_version(),
        location.display()
    );
    Ok(package)
}

/// Sources from `SRCS`/`CHKSUMS`, or from the legacy fields
pub fn parse_sources(
    spec: &Variables,
    spec_path: &Path,
    ctx: &ParseContext,
) -> Result<Vec<SourceDescriptor>, RecipeError> {
    if is_truthy(spec.get("DUMMYSRC").map(String::as_str)) {
        return Ok(vec![SourceDescriptor::none()]);
    }

    if let Some(srcs) = arch_lookup(spec, "SRCS", &ctx.arch).filter(|s| !s.trim().is_empty()) {
        let entries: Vec<&str> = srcs.split_whitespace().collect();
        let checksums: Vec<&str> = arch_lookup(spec, "CHKSUMS", &ctx.arch)
            .unwrap_or_default()
            .split_whitespace()
            .collect();
        if !ctx.generate && checksums.len() != entries.len() {
            return Err(RecipeError::ChecksumCountMismatch {
                path: spec_path.to_path_buf(),
                sources: entries.len(),
                checksums: checksums.len(),
            });
        }
        return entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                parse_url_schema(entry, checksums.get(i).copied(), spec_path, ctx.generate)
            })
            .collect();
    }

    parse_legacy_sources(spec, spec_path, ctx)
}

fn parse_legacy_sources(
    spec: &Variables,
    spec_path: &Path,
    ctx: &ParseContext,
) -> Result<Vec<SourceDescriptor>, RecipeError> {
    if let Some(url) = spec.get("SRCTBL").filter(|s| !s.is_empty()) {
        let mut source = SourceDescriptor::new(SourceKind::Tarball, url.clone());
        source.checksum = match spec.get("CHKSUM").filter(|c| !c.is_empty()) {
            Some(checksum) => Some(parse_checksum(checksum, spec_path)?),
            None if ctx.generate => None,
            None => {
                return Err(RecipeError::MissingChecksum {
                    path: spec_path.to_path_buf(),
                    url: url.clone(),
                })
            }
        };
        if matches!(source.checksum, Some(Checksum::Skip)) {
            return Err(RecipeError::SkipNotAllowed {
                path: spec_path.to_path_buf(),
                url: url.clone(),
            });
        }
        return Ok(vec![source]);
    }

    for (prefix, kind) in [
        ("GIT", SourceKind::Git),
        ("BZR", SourceKind::Bzr),
        ("SVN", SourceKind::Svn),
        ("HG", SourceKind::Hg),
    ] {
        let Some(url) = spec.get(&format!("{prefix}SRC")).filter(|s| !s.is_empty()) else {
            continue;
        };
        let mut source = SourceDescriptor::new(kind, url.clone());
        source.revision = spec.get(&format!("{prefix}CO")).filter(|s| !s.is_empty()).cloned();
        source.branch = spec
            .get(&format!("{prefix}BRANCH"))
            .filter(|s| !s.is_empty())
            .cloned();
        source.checksum = Some(Checksum::Skip);
        return Ok(vec![source]);
    }

    if spec.get("BKSRC").is_some_and(|s| !s.is_empty()) {
        return Err(RecipeError::UnknownScheme {
            path: spec_path.to_path_buf(),
            scheme: "bk".to_string(),
        });
    }

    Err(RecipeError::NoSources {
        path: spec_path.to_path_buf(),
    })
}

fn archive_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\.(tar(\.[a-z0-9]+)?|tgz|tbz2?|txz|tlz|tzst|zip|7z|rar|cpio(\.[a-z0-9]+)?|gem|crate|xpi)$")
            .expect("archive pattern is valid")
    })
}

/// Archive extension of a file name: `.tar.gz`, `.zip`, ... or `""`
pub fn guess_extension_name(file_name: &str) -> String {
    static TARBALL: OnceLock<Regex> = OnceLock::new();
    let tarball = TARBALL.get_or_init(|| {
        Regex::new(r"\.(tar\..+|cpio\..+)$").expect("tarball pattern is valid")
    });
    if let Some(m) = tarball.find(file_name) {
        return m.as_str().to_string();
    }
    Path::new(file_name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

fn infer_kind(location: &str) -> Option<SourceKind> {
    let path = &location[..location.find(['?', '#']).unwrap_or(location.len())];
    if location.starts_with("git://") || path.ends_with(".git") {
        Some(SourceKind::Git)
    } else if archive_pattern().is_match(&path.to_ascii_lowercase()) {
        Some(SourceKind::Tarball)
    } else {
        None
    }
}

/// Parse `algorithm::digest` or `SKIP`
pub fn parse_checksum(text: &str, spec_path: &Path) -> Result<Checksum, RecipeError> {
    if text == "SKIP" {
        return Ok(Checksum::Skip);
    }
    let malformed = || RecipeError::MalformedChecksum {
        path: spec_path.to_path_buf(),
        checksum: text.to_string(),
    };
    let (algorithm, value) = text.split_once("::").ok_or_else(malformed)?;
    if algorithm.is_empty()
        || value.is_empty()
        || !value.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(malformed());
    }
    Ok(Checksum::Digest {
        algorithm: algorithm.to_ascii_lowercase(),
        value: value.to_ascii_lowercase(),
    })
}

/// Parse one `[scheme[::options]::]location` entry with its checksum
pub fn parse_url_schema(
    entry: &str,
    checksum: Option<&str>,
    spec_path: &Path,
    generate: bool,
) -> Result<SourceDescriptor, RecipeError> {
    let malformed = |reason: &str| RecipeError::MalformedSource {
        path: spec_path.to_path_buf(),
        source_entry: entry.to_string(),
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = entry.splitn(3, "::").collect();
    let (scheme, options, location) = match parts.as_slice() {
        [location] => (None, None, *location),
        [scheme, location] => (Some(*scheme), None, *location),
        [scheme, options, location] => (Some(*scheme), Some(*options), *location),
        _ => return Err(malformed("empty entry")),
    };

    let kind = match scheme {
        Some(scheme) => {
            SourceKind::from_scheme(scheme).ok_or_else(|| RecipeError::UnknownScheme {
                path: spec_path.to_path_buf(),
                scheme: scheme.to_string(),
            })?
        }
        None => infer_kind(location)
            .ok_or_else(|| malformed("cannot infer source type, please specify one"))?,
    };
    if kind != SourceKind::None && location.is_empty() {
        return Err(malformed("missing location"));
    }

    let mut source = SourceDescriptor::new(kind, location);
    for option in options
        .unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|o| !o.is_empty())
    {
        let (key, value) = option
            .split_once('=')
            .ok_or_else(|| malformed(&format!("option '{option}' is not key=value")))?;
        let value = value.trim();
        match key.trim() {
            "branch" => source.branch = Some(value.to_string()),
            "commit" => source.revision = Some(value.to_string()),
            "rename" => source.rename = Some(value.to_string()),
            "copy-repo" => source.copy_repo = is_truthy(Some(value)),
            "submodule" => {
                source.submodules = match value.to_ascii_lowercase().as_str() {
                    "false" | "0" | "off" | "no" => SubmodulePolicy::Off,
                    "true" | "1" | "shallow" | "yes" => SubmodulePolicy::Shallow,
                    "recursive" | "2" => SubmodulePolicy::Recursive,
                    other => return Err(malformed(&format!("unknown submodule policy '{other}'"))),
                }
            }
            "use-url-name" | "use-url-basename" => {
                if is_truthy(Some(value)) {
                    source.rename = Some(url_basename(location));
                }
            }
            other => warn!("Ignoring unknown source option '{other}' in {}", spec_path.display()),
        }
    }

    source.checksum = match checksum.filter(|c| !c.is_empty()) {
        Some(text) => Some(parse_checksum(text, spec_path)?),
        None if !kind.requires_checksum() => Some(Checksum::Skip),
        None => None,
    };
    if kind.requires_checksum() {
        match source.checksum {
            Some(Checksum::Skip) => {
                return Err(RecipeError::SkipNotAllowed {
                    path: spec_path.to_path_buf(),
                    url: location.to_string(),
                })
            }
            None if !generate => {
                return Err(RecipeError::MissingChecksum {
                    path: spec_path.to_path_buf(),
                    url: location.to_string(),
                })
            }
            _ => {}
        }
    }

    Ok(source)
}

/// Names accepted on the command line and in group files
pub fn validate_package_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9+.\-/:]*$").expect("name pattern is valid"))
        .is_match(name)
}

/// Split `name:modifiers`
pub fn split_modifiers(request: &str) -> (&str, &str) {
    match request.split_once(':') {
        Some((name, modifiers)) => (name, modifiers),
        None => (request, ""),
    }
}
