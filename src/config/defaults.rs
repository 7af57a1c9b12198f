//! Default configuration values

/// Configuration directory holding `forest.conf`
pub const CONF_DIR: &str = "/etc/acbs";

/// Source cache directory (tarballs and VCS mirrors)
pub const CACHE_DIR: &str = "/var/cache/acbs/tarballs";

/// Scratch directory for build directories
pub const BUILD_DIR: &str = "/var/cache/acbs/build";

/// Log directory
pub const LOG_DIR: &str = "/var/log/acbs";

/// dpkg database directory
pub const DPKG_DIR: &str = "/var/lib/dpkg";

/// Autobuild configuration directory
pub const AUTOBUILD_CONF_DIR: &str = "/etc/autobuild";

/// Tree registry file name inside the configuration directory
pub const FOREST_CONF: &str = "forest.conf";

/// Tree used when none is given
pub const DEFAULT_TREE: &str = "default";

/// Log file name inside the log directory
pub const LOG_FILE: &str = "forestbuild.log";

/// Suffix of checkpoint files
pub const CHECKPOINT_SUFFIX: &str = "acbs-ckpt";

/// Prefix of build directories created in the scratch directory
pub const BUILD_DIR_PREFIX: &str = "acbs.";

/// Stamp file marking a build directory whose sources are in place
pub const STAMP_FILE: &str = ".acbs-stamp";

/// Suffix of the flag file marking an incomplete download
pub const DOWNLOAD_FLAG_SUFFIX: &str = ".dl";

/// Group file directory inside a tree
pub const GROUPS_DIR: &str = "groups";

/// Maximum number of attempts for fetching a single source
pub const MAX_FETCH_ATTEMPTS: u32 = 5;

/// Maximum number of HTTP retries inside one fetch attempt
pub const MAX_DOWNLOAD_RETRIES: u32 = 3;

/// Maximum number of package manager repair attempts
pub const PM_REPAIR_ATTEMPTS: u32 = 3;

/// Recursion limit for `forest.conf` interpolation
pub const MAX_INTERPOLATION_DEPTH: usize = 10;

/// Upper bound on what the fallback shell may print
pub const SHELL_OUTPUT_LIMIT: usize = 4 * 1024 * 1024;

/// Minimum proptest iterations
pub const MIN_PROPTEST_ITERATIONS: u32 = 100;
