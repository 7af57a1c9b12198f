//! Source fetch logic
//!
//! Fetching puts every source of a package into the source cache: tarballs
//! and plain files are downloaded, VCS repositories are mirrored.
//! Processing then verifies what was fetched and lays it out in the
//! package's build directory.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::defaults;
use crate::core::package::{url_basename, Checksum, PackageDescriptor, SourceDescriptor, SourceKind};
use crate::core::parser::guess_extension_name;
use crate::error::FetchError;
use crate::infra::download::{file_digest, hash_url, DownloadManager};
use crate::infra::filesystem;
use crate::infra::vcs::{self, ExternalCommand};

/// Source acquisition used by the build orchestrator
#[allow(async_fn_in_trait)]
pub trait SourceProvider {
    /// Fetch every source of `package` into the cache, recording where each landed
    async fn fetch(&self, package: &mut PackageDescriptor) -> Result<(), FetchError>;

    /// Lay out the fetched sources of `package` in `build_dir`
    async fn process(&self, package: &PackageDescriptor, build_dir: &Path) -> Result<(), FetchError>;
}

/// Fetches sources over HTTP and through the VCS tools
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    downloader: DownloadManager,
    cache_dir: PathBuf,
    generate: bool,
    max_attempts: u32,
}

impl SourceFetcher {
    /// In `generate` mode tarballs without checksums are accepted
    pub fn new(cache_dir: PathBuf, generate: bool) -> Self {
        Self::with_downloader(DownloadManager::new(), cache_dir, generate)
    }

    pub fn with_downloader(downloader: DownloadManager, cache_dir: PathBuf, generate: bool) -> Self {
        Self {
            downloader,
            cache_dir,
            generate,
            max_attempts: defaults::MAX_FETCH_ATTEMPTS,
        }
    }

    /// Override the number of attempts per source
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Fetch one source, retrying transient failures
    pub async fn fetch_source(&self, source: &SourceDescriptor) -> Result<SourceDescriptor, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_once(source).await {
                Ok(fetched) => return Ok(fetched),
                Err(e @ (FetchError::MissingChecksum { .. } | FetchError::MissingRevision { .. })) => {
                    return Err(e)
                }
                Err(e) if attempt < self.max_attempts => {
                    warn!("{e}");
                    warn!("Retrying ({attempt}/{})...", self.max_attempts);
                }
                Err(e) => {
                    warn!(
                        "Unable to fetch source files, failed {} times in a row.",
                        self.max_attempts
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_once(&self, source: &SourceDescriptor) -> Result<SourceDescriptor, FetchError> {
        let name = hash_url(&source.url);
        match source.kind {
            SourceKind::None => {
                info!("Not fetching any source as requested");
                Ok(source.clone())
            }
            SourceKind::Tarball | SourceKind::File => {
                if source.checksum.is_none() && !self.generate {
                    return Err(FetchError::MissingChecksum {
                        url: source.url.clone(),
                    });
                }
                let path = self
                    .downloader
                    .fetch_to_cache(&source.url, &self.cache_dir, None)
                    .await?;
                Ok(source.clone().with_location(path))
            }
            SourceKind::Git => {
                let mirror = vcs::mirror_path(source.kind, &self.cache_dir, &name);
                let url = source.url.clone();
                let target = mirror.clone();
                blocking("git mirror", move || vcs::git_mirror(&url, &target)).await?;
                Ok(source.clone().with_location(mirror))
            }
            SourceKind::Svn | SourceKind::Hg | SourceKind::Bzr | SourceKind::Fossil => {
                let mirror = vcs::mirror_path(source.kind, &self.cache_dir, &name);
                filesystem::create_dir_all(&self.cache_dir)?;
                let commands = vcs::mirror_commands(source, &mirror)?;
                blocking("vcs mirror", move || commands.iter().try_for_each(ExternalCommand::run)).await?;
                Ok(source.clone().with_location(mirror))
            }
        }
    }

    /// Verify and place source `index` of `package` into `build_dir`
    pub async fn process_source(
        &self,
        package: &PackageDescriptor,
        index: usize,
        build_dir: &Path,
    ) -> Result<(), FetchError> {
        let source = &package.sources[index];
        if source.kind == SourceKind::None {
            return Ok(());
        }
        let location = source
            .source_location()
            .ok_or_else(|| FetchError::NotFetched {
                url: source.url.clone(),
            })?
            .to_path_buf();
        let dest_name = source
            .rename
            .clone()
            .unwrap_or_else(|| package.source_name().to_string());
        let build_dir = build_dir.to_path_buf();
        let source = source.clone();

        match source.kind {
            SourceKind::None => Ok(()),
            SourceKind::Tarball | SourceKind::File => {
                verify_source(&source, &location, self.generate)?;
                let facade = facade_name(&source, index, package.source_name(), &package.version);
                filesystem::symlink(&location, &build_dir.join(&facade))?;
                if source.kind == SourceKind::Tarball {
                    info!("Extracting {facade}...");
                    blocking("extract", move || {
                        ExternalCommand::new("bsdtar")
                            .arg("-xf")
                            .arg(&facade)
                            .current_dir(&build_dir)
                            .run()
                    })
                    .await?;
                }
                Ok(())
            }
            SourceKind::Git => {
                blocking("git checkout", move || {
                    vcs::git_checkout(&source, &location, &build_dir, &dest_name)
                })
                .await
            }
            SourceKind::Svn => {
                blocking("svn checkout", move || vcs::svn_checkout(&location, &build_dir, &dest_name)).await
            }
            SourceKind::Hg => {
                blocking("hg checkout", move || {
                    vcs::hg_checkout(&source, &location, &build_dir, &dest_name)
                })
                .await
            }
            SourceKind::Bzr => {
                blocking("bzr checkout", move || {
                    vcs::bzr_checkout(&source, &location, &build_dir, &dest_name)
                })
                .await
            }
            SourceKind::Fossil => {
                blocking("fossil checkout", move || {
                    vcs::fossil_checkout(&source, &location, &build_dir, &dest_name)
                })
                .await
            }
        }
    }
}

impl SourceProvider for SourceFetcher {
    async fn fetch(&self, package: &mut PackageDescriptor) -> Result<(), FetchError> {
        info!("Fetching required source files...");
        let total = package.sources.len();
        for index in 0..total {
            info!("Fetching source ({}/{total})...", index + 1);
            let fetched = self.fetch_source(&package.sources[index]).await?;
            package.sources[index] = fetched;
        }
        Ok(())
    }

    async fn process(&self, package: &PackageDescriptor, build_dir: &Path) -> Result<(), FetchError> {
        for index in 0..package.sources.len() {
            self.process_source(package, index, build_dir).await?;
        }
        Ok(())
    }
}

/// Name a downloaded source is linked under in the build directory
///
/// `rename` wins; otherwise `{source_name}-{version}[-{index}]{extension}`.
pub fn facade_name(source: &SourceDescriptor, index: usize, source_name: &str, version: &str) -> String {
    if let Some(rename) = &source.rename {
        return rename.clone();
    }
    let extension = guess_extension_name(&url_basename(&source.url));
    if index == 0 {
        format!("{source_name}-{version}{extension}")
    } else {
        format!("{source_name}-{version}-{index}{extension}")
    }
}

/// Check a downloaded file against the source's checksum
pub fn verify_source(source: &SourceDescriptor, location: &Path, generate: bool) -> Result<(), FetchError> {
    match &source.checksum {
        Some(Checksum::Digest { algorithm, value }) => {
            info!("Computing {algorithm} checksum for {}...", location.display());
            let Some(actual) = file_digest(location, algorithm)? else {
                return Err(FetchError::UnsupportedAlgorithm {
                    algorithm: algorithm.clone(),
                    url: source.url.clone(),
                });
            };
            if actual.eq_ignore_ascii_case(value) {
                Ok(())
            } else {
                Err(FetchError::ChecksumMismatch {
                    file: location.display().to_string(),
                    algorithm: algorithm.clone(),
                    expected: value.clone(),
                    actual,
                })
            }
        }
        Some(Checksum::Skip) => Ok(()),
        None if generate => Ok(()),
        None => Err(FetchError::MissingChecksum {
            url: source.url.clone(),
        }),
    }
}

async fn blocking<F>(what: &str, f: F) -> Result<(), FetchError>
where
    F: FnOnce() -> Result<(), FetchError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FetchError::Command {
            command: what.to_string(),
            error: e.to_string(),
        })?
}
