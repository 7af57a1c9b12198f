//! Error types for forestbuild
//!
//! Domain-specific error types using thiserror.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading shell-assignment files
#[derive(Error, Debug)]
pub enum BashVarError {
    /// The input is outside the supported assignment grammar
    #[error("{file}:{line}:{column}: {message}")]
    Syntax {
        file: String,
        line: usize,
        column: usize,
        message: String,
    },

    /// The shell used for evaluating unsupported syntax could not be run
    #[error("Failed to evaluate '{file}' with the shell: {error}")]
    Shell { file: String, error: String },

    /// The shell produced more output than allowed
    #[error("Shell output for '{file}' exceeded {limit} bytes")]
    OutputTooLarge { file: String, limit: usize },
}

impl BashVarError {
    /// Whether another evaluation strategy may still succeed on the same input
    pub fn is_syntax(&self) -> bool {
        matches!(self, Self::Syntax { .. })
    }
}

/// Recipe configuration errors
#[derive(Error, Debug)]
pub enum RecipeError {
    /// IO error while reading a recipe
    #[error("IO error for '{path}': {error}")]
    IoError { path: PathBuf, error: String },

    /// The recipe could not be parsed
    #[error("Failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: BashVarError,
    },

    /// A mandatory variable is missing
    #[error("'{path}' is missing required field '{field}'")]
    MissingField { path: PathBuf, field: String },

    /// No sources were declared
    #[error("No sources specified in '{path}', if this is intended, please set `DUMMYSRC=1`")]
    NoSources { path: PathBuf },

    /// Checksum is not in `algorithm::digest` form
    #[error("Malformed checksum '{checksum}' in '{path}'")]
    MalformedChecksum { path: PathBuf, checksum: String },

    /// SKIP used for a source that must be verified
    #[error("Checksum of '{url}' in '{path}' cannot be SKIP: only VCS sources may skip verification")]
    SkipNotAllowed { path: PathBuf, url: String },

    /// Tarball or file source without a checksum
    #[error("Source '{url}' in '{path}' has no checksum (generate one with --get --write-checksums)")]
    MissingChecksum { path: PathBuf, url: String },

    /// `SRCS` and `CHKSUMS` do not pair up
    #[error("'{path}' declares {sources} source(s) but {checksums} checksum(s)")]
    ChecksumCountMismatch {
        path: PathBuf,
        sources: usize,
        checksums: usize,
    },

    /// Unknown source scheme
    #[error("Unknown source type '{scheme}' in '{path}'")]
    UnknownScheme { path: PathBuf, scheme: String },

    /// Source entry that cannot be understood
    #[error("Malformed source '{source_entry}' in '{path}': {reason}")]
    MalformedSource {
        path: PathBuf,
        source_entry: String,
        reason: String,
    },

    /// Group member directory without `NN-` prefix
    #[error("Malformed sub-package name: '{path}'")]
    MalformedGroupMember { path: PathBuf },

    /// `FAIL_ARCH` pattern could not be compiled
    #[error("Invalid architecture pattern '{pattern}': {error}")]
    InvalidArchPattern { pattern: String, error: String },
}

/// Dependency resolution errors
#[derive(Error, Debug)]
pub enum ResolverError {
    /// Request does not look like a package name
    #[error("Invalid package name: `{name}`")]
    InvalidName { name: String },

    /// Package not found in the tree
    #[error("Package '{name}' not found")]
    NotFound { name: String },

    /// Entry of a package list not found
    #[error("Package '{name}' requested in '{list}' was not found")]
    NotFoundInList { name: String, list: String },

    /// One or more dependency cycles
    #[error("Dependencies NOT resolved, found {} loop(s): {}", .cycles.len(), format_cycles(.cycles))]
    CircularDependency { cycles: Vec<Vec<String>> },

    /// Group members out of sequence
    #[error(
        "Package group '{group}' is out of order: '{later}' (#{later_seq}) would be built before '{earlier}' (#{earlier_seq})"
    )]
    GroupOrder {
        group: String,
        earlier: String,
        earlier_seq: u32,
        later: String,
        later_seq: u32,
    },

    /// Dependency excluded on the build architecture
    #[error("Package '{package}' is not buildable on {arch}, but '{required_by}' depends on it")]
    Unbuildable {
        package: String,
        required_by: String,
        arch: String,
    },

    /// Self-dependency without a binary to satisfy it
    #[error("Package '{package}' depends on itself and no binary package can satisfy it")]
    SelfDependency { package: String },

    /// Recipe error while loading a dependency
    #[error(transparent)]
    Recipe(#[from] RecipeError),

    /// Package manager error while classifying dependencies
    #[error(transparent)]
    PackageManager(#[from] PackageManagerError),

    /// Build directory for a package group could not be created
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|c| format!("[{}]", c.join(", ")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Package manager errors
#[derive(Error, Debug)]
pub enum PackageManagerError {
    /// A query could not be answered
    #[error("Failed to query package manager for '{name}': {error}")]
    Query { name: String, error: String },

    /// Installation failed even after repairs
    #[error("Failed to install {} after {attempts} attempt(s)", .packages.join(" "))]
    Install { packages: Vec<String>, attempts: u32 },

    /// Package manager command could not be started
    #[error("Failed to run '{command}': {error}")]
    Command { command: String, error: String },

    /// Package database could not be read
    #[error("IO error for '{path}': {error}")]
    IoError { path: PathBuf, error: String },
}

/// Download errors
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Network error
    #[error("Network error downloading '{url}': {error}")]
    NetworkError { url: String, error: String },

    /// IO error
    #[error("IO error for '{path}': {error}")]
    IoError { path: PathBuf, error: String },

    /// Max retries exceeded
    #[error("Download failed after {retries} retries: {url}")]
    MaxRetriesExceeded { url: String, retries: u32 },
}

/// Source fetching and processing errors
#[derive(Error, Debug)]
pub enum FetchError {
    /// Download error
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Checksum mismatch
    #[error("Checksum mismatch for '{file}': expected {algorithm}:{expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        algorithm: String,
        expected: String,
        actual: String,
    },

    /// No checksum available outside of generation mode
    #[error("No checksum found for '{url}'")]
    MissingChecksum { url: String },

    /// Checksum algorithm this build cannot compute
    #[error("Unsupported checksum algorithm '{algorithm}' for '{url}'")]
    UnsupportedAlgorithm { algorithm: String, url: String },

    /// VCS or archive command failed
    #[error("Command '{command}' failed: {error}")]
    Command { command: String, error: String },

    /// Source was never fetched
    #[error("Source '{url}' has not been fetched")]
    NotFetched { url: String },

    /// VCS source without a pinned revision
    #[error("Please specify a specific {kind} revision for '{url}'")]
    MissingRevision { kind: String, url: String },

    /// Git operation error
    #[error("Git operation on '{url}' failed: {error}")]
    Git { url: String, error: String },

    /// Build directory preparation failed
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    /// IO error
    #[error("IO error for '{path}': {error}")]
    IoError { path: PathBuf, error: String },
}

/// Build errors
#[derive(Error, Debug)]
pub enum BuildError {
    /// Build tool exited unsuccessfully
    #[error("Build failed for package '{package}': {error}")]
    BuildFailed { package: String, error: String },

    /// No artifact produced
    #[error("Build tool produced no package for '{package}' in '{build_dir}'")]
    NoArtifact { package: String, build_dir: PathBuf },

    /// Source directory inside the build directory could not be determined
    #[error("Could not determine source directory in '{build_dir}', set SUBDIR in spec")]
    UnknownSubdir { build_dir: PathBuf },

    /// Tool missing from PATH
    #[error("Build tool '{tool}' not found in PATH")]
    ToolNotFound { tool: String },

    /// Build directory preparation failed
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    /// Dependency needed while its own build is still in progress
    #[error("Package '{package}' transitively requires itself through {}", .chain.join(" -> "))]
    DependencyLoop { package: String, chain: Vec<String> },

    /// IO error
    #[error("IO error for '{path}': {error}")]
    IoError { path: PathBuf, error: String },
}

/// Checkpoint and resume errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Failed to write checkpoint
    #[error("Failed to write checkpoint '{path}': {error}")]
    Write { path: PathBuf, error: String },

    /// Failed to read checkpoint
    #[error("Failed to read checkpoint '{path}': {error}")]
    Read { path: PathBuf, error: String },

    /// Not a checkpoint file
    #[error("'{path}' is not a checkpoint file")]
    BadMagic { path: PathBuf },

    /// Serialization failed
    #[error("Failed to encode checkpoint: {0}")]
    Encode(String),

    /// Deserialization failed
    #[error("Failed to decode checkpoint '{path}': {error}")]
    Decode { path: PathBuf, error: String },

    /// Recipe fingerprint could not be computed
    #[error("Failed to fingerprint recipe '{path}': {error}")]
    Fingerprint { path: PathBuf, error: String },

    /// Package and fingerprint lists differ in length
    #[error("Checkpoint is corrupted: {packages} package(s) but {fingerprints} fingerprint(s)")]
    FingerprintCountMismatch { packages: usize, fingerprints: usize },

    /// Cursor outside the package list
    #[error("Checkpoint cursor {cursor} is out of range for {len} package(s)")]
    CursorOutOfRange { cursor: usize, len: usize },

    /// Previously built packages are no longer installed
    #[error(
        "DPKG state mismatch: {} no longer installed. Remaining packages written to group '{group}', please start a new build with it",
        .missing.join(", ")
    )]
    PackageManagerRegression { missing: Vec<String>, group: String },
}

/// Tree registry errors
#[derive(Error, Debug)]
pub enum ForestError {
    /// Registry file missing
    #[error("Tree registry not found at '{path}'")]
    NotFound { path: PathBuf },

    /// Registry file unreadable
    #[error("Failed to read '{path}': {error}")]
    ReadFile { path: PathBuf, error: String },

    /// Syntax error
    #[error("{path}:{line}: {message}")]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Unknown tree
    #[error("Tree not found: {tree}, defined trees: {}", .defined.join(" "))]
    TreeNotFound { tree: String, defined: Vec<String> },

    /// Tree without location
    #[error("Malformed tree '{tree}': missing `location`")]
    MissingLocation { tree: String },

    /// Interpolation failed
    #[error("Bad interpolation in '{section}.{key}': {message}")]
    Interpolation {
        section: String,
        key: String,
        message: String,
    },
}

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Failed to create directory
    #[error("Failed to create directory '{path}': {error}")]
    CreateDir { path: PathBuf, error: String },

    /// Failed to remove directory
    #[error("Failed to remove directory '{path}': {error}")]
    RemoveDir { path: PathBuf, error: String },

    /// Failed to write file
    #[error("Failed to write file '{path}': {error}")]
    WriteFile { path: PathBuf, error: String },

    /// Failed to read file
    #[error("Failed to read file '{path}': {error}")]
    ReadFile { path: PathBuf, error: String },

    /// Failed to copy
    #[error("Failed to copy '{from}' to '{to}': {error}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        error: String,
    },
}

/// Top-level forestbuild error type
#[derive(Error, Debug)]
pub enum ForestbuildError {
    /// Recipe error
    #[error("Recipe error: {0}")]
    Recipe(#[from] RecipeError),

    /// Resolver error
    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    /// Package manager error
    #[error("Package manager error: {0}")]
    PackageManager(#[from] PackageManagerError),

    /// Fetch error
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Build error
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Tree registry error
    #[error("Tree registry error: {0}")]
    Forest(#[from] ForestError),

    /// Filesystem error
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] FilesystemError),

    /// Build failed and the queue was checkpointed (or checkpointing failed too)
    #[error("{}", interrupted_message(.error, .checkpoint))]
    Interrupted {
        error: Box<ForestbuildError>,
        checkpoint: Result<PathBuf, CheckpointError>,
    },
}

fn interrupted_message(
    error: &ForestbuildError,
    checkpoint: &Result<PathBuf, CheckpointError>,
) -> String {
    match checkpoint {
        Ok(path) => format!(
            "{error}\nBuild state saved, resume with `forestbuild --resume {}`",
            path.display()
        ),
        Err(e) => format!("{error}\nAdditionally, the build state could not be saved: {e}"),
    }
}
