//! Package and source descriptors
//!
//! Plain data shared by the parser, resolver, orchestrator and checkpoint
//! file. Everything here is serializable so a build queue can be written
//! to disk as-is.

use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RecipeError;

/// Kind of a fetchable source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Tarball,
    Git,
    Svn,
    Hg,
    Bzr,
    Fossil,
    File,
    None,
}

impl SourceKind {
    /// Parse the scheme part of a source entry
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "tbl" | "tarball" => Some(Self::Tarball),
            "git" => Some(Self::Git),
            "svn" => Some(Self::Svn),
            "hg" => Some(Self::Hg),
            "bzr" => Some(Self::Bzr),
            "fossil" => Some(Self::Fossil),
            "file" => Some(Self::File),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tarball => "tarball",
            Self::Git => "git",
            Self::Svn => "svn",
            Self::Hg => "hg",
            Self::Bzr => "bzr",
            Self::Fossil => "fossil",
            Self::File => "file",
            Self::None => "none",
        }
    }

    /// Version control kinds, which are mirrored rather than downloaded
    pub fn is_vcs(self) -> bool {
        matches!(
            self,
            Self::Git | Self::Svn | Self::Hg | Self::Bzr | Self::Fossil
        )
    }

    /// Kinds whose content must be verified against a checksum
    pub fn requires_checksum(self) -> bool {
        matches!(self, Self::Tarball | Self::File)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected content of a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checksum {
    /// Verification deliberately skipped (VCS sources)
    Skip,
    /// `algorithm::hex-digest`
    Digest { algorithm: String, value: String },
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => f.write_str("SKIP"),
            Self::Digest { algorithm, value } => write!(f, "{algorithm}::{value}"),
        }
    }
}

/// How git submodules are fetched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmodulePolicy {
    Off,
    Shallow,
    #[default]
    Recursive,
}

/// One fetchable source unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    pub url: String,
    pub revision: Option<String>,
    pub branch: Option<String>,
    pub checksum: Option<Checksum>,
    pub rename: Option<String>,
    pub submodules: SubmodulePolicy,
    pub copy_repo: bool,
    source_location: Option<PathBuf>,
}

impl SourceDescriptor {
    pub fn new(kind: SourceKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            revision: None,
            branch: None,
            checksum: None,
            rename: None,
            submodules: SubmodulePolicy::default(),
            copy_repo: false,
            source_location: None,
        }
    }

    /// Placeholder for recipes that declare no source
    pub fn none() -> Self {
        Self::new(SourceKind::None, "")
    }

    /// Local copy of the source, once fetched
    pub fn source_location(&self) -> Option<&Path> {
        self.source_location.as_deref()
    }

    /// Record where the fetch step put the source
    #[must_use]
    pub fn with_location(mut self, location: PathBuf) -> Self {
        self.source_location = Some(location);
        self
    }

    /// Name the source is known by in the build directory
    pub fn file_name(&self) -> String {
        if let Some(rename) = &self.rename {
            return rename.clone();
        }
        url_basename(&self.url)
    }
}

/// Last path component of a URL, ignoring `;params`, `?query` and `#fragment`
pub fn url_basename(url: &str) -> String {
    let end = url.find(['?', '#', ';']).unwrap_or(url.len());
    url[..end]
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Compiled `FAIL_ARCH` expression
///
/// `amd64`, `(amd64|arm64)` match architectures by prefix; a leading `!`
/// inverts the match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArchPattern {
    expr: String,
    negated: bool,
    regex: Regex,
}

impl ArchPattern {
    pub fn compile(expr: &str) -> Result<Self, RecipeError> {
        if expr.len() < 3 {
            return Err(RecipeError::InvalidArchPattern {
                pattern: expr.to_string(),
                error: "pattern too short".to_string(),
            });
        }
        let (negated, body) = match expr.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, expr),
        };
        let regex =
            Regex::new(&format!("^(?:{body})")).map_err(|e| RecipeError::InvalidArchPattern {
                pattern: expr.to_string(),
                error: e.to_string(),
            })?;
        Ok(Self {
            expr: expr.to_string(),
            negated,
            regex,
        })
    }

    /// Whether building on `arch` is excluded
    pub fn excludes(&self, arch: &str) -> bool {
        self.regex.is_match(arch) != self.negated
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }
}

impl PartialEq for ArchPattern {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl TryFrom<String> for ArchPattern {
    type Error = RecipeError;

    fn try_from(expr: String) -> Result<Self, Self::Error> {
        Self::compile(&expr)
    }
}

impl From<ArchPattern> for String {
    fn from(pattern: ArchPattern) -> Self {
        pattern.expr
    }
}

/// One buildable unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    pub release: String,
    pub epoch: Option<String>,
    /// Dependencies that still need an in-tree build
    pub deps: Vec<String>,
    /// Dependencies satisfiable from the binary repository
    pub installables: Vec<String>,
    pub sources: Vec<SourceDescriptor>,
    /// Directory holding `defines` (its parent holds `spec`)
    pub recipe_location: PathBuf,
    /// `category/group` for members of a package group
    pub group_slug: Option<String>,
    /// Position inside the group, 0 outside of groups
    pub group_sequence: u32,
    pub fail_arch: Option<ArchPattern>,
    pub bin_arch: String,
    pub subdir: Option<String>,
    /// Shared by all members of a group
    pub build_location: Option<PathBuf>,
    /// Extra variables passed to the build environment
    pub exported: IndexMap<String, String>,
    /// Per-request modifiers such as `+stage2`
    pub modifiers: String,
    /// Set once the package manager gate has split `deps`
    pub partitioned: bool,
}

impl PackageDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>, recipe_location: PathBuf) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            release: "0".to_string(),
            epoch: None,
            deps: Vec::new(),
            installables: Vec::new(),
            sources: Vec::new(),
            recipe_location,
            group_slug: None,
            group_sequence: 0,
            fail_arch: None,
            bin_arch: String::new(),
            subdir: None,
            build_location: None,
            exported: IndexMap::new(),
            modifiers: String::new(),
            partitioned: false,
        }
    }

    /// `[epoch:]version-release`
    pub fn full_version(&self) -> String {
        match &self.epoch {
            Some(epoch) if !epoch.is_empty() => {
                format!("{epoch}:{}-{}", self.version, self.release)
            }
            _ => format!("{}-{}", self.version, self.release),
        }
    }

    pub fn is_buildable_on(&self, arch: &str) -> bool {
        self.fail_arch.as_ref().map_or(true, |p| !p.excludes(arch))
    }

    /// The `spec` file next to the recipe directory
    pub fn spec_path(&self) -> PathBuf {
        self.recipe_location
            .parent()
            .map_or_else(|| PathBuf::from("spec"), |p| p.join("spec"))
    }

    /// Name under which sources are cached: the group name for group members
    pub fn source_name(&self) -> &str {
        self.group_slug
            .as_deref()
            .and_then(|slug| slug.rsplit('/').next())
            .unwrap_or(&self.name)
    }

    /// Label used in build timing reports
    pub fn timing_label(&self) -> String {
        format!("{} ({} @ {})", self.name, self.bin_arch, self.full_version())
    }

    /// Requested with the `+stage2` modifier
    pub fn in_stage2(&self) -> bool {
        wants_stage2(&self.modifiers)
    }
}

/// `a, b, c ... and N more` when there are more than `limit` packages
pub fn package_names(packages: &[PackageDescriptor], limit: Option<usize>) -> String {
    let shown = limit.map_or(packages.len(), |l| l.min(packages.len()));
    let names: Vec<&str> = packages[..shown].iter().map(|p| p.name.as_str()).collect();
    let mut out = names.join(", ");
    if shown < packages.len() {
        out.push_str(&format!(" ... and {} more", packages.len() - shown));
    }
    out
}

/// Whether request modifiers ask for stage 2 definitions
pub fn wants_stage2(modifiers: &str) -> bool {
    modifiers.to_ascii_lowercase().contains("+stage2")
}
