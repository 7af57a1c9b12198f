//! HTTP download functionality
//!
//! Handles downloading tarball and file sources into the source cache with
//! progress reporting, retry with exponential backoff and content digests.

use blake2::{Blake2b512, Blake2s256};
use futures::StreamExt;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use sha3::{Sha3_224, Sha3_256, Sha3_384, Sha3_512};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::defaults;
use crate::error::DownloadError;

/// Progress callback type for download progress reporting
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Download result containing file path and metadata
#[derive(Debug)]
pub struct DownloadResult {
    /// Path to the downloaded file
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// SHA256 checksum of the downloaded content
    pub checksum: String,
}

/// Download manager for fetching files with retry
#[derive(Debug, Clone)]
pub struct DownloadManager {
    /// HTTP client
    client: reqwest::Client,
    /// Maximum retry attempts
    max_retries: u32,
    /// Base delay for exponential backoff (in milliseconds)
    base_delay_ms: u64,
}

impl DownloadManager {
    /// Create a new download manager
    pub fn new() -> Self {
        Self::with_config(defaults::MAX_DOWNLOAD_RETRIES, 1000)
    }

    /// Create a download manager with custom settings
    pub fn with_config(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("forestbuild/", env!("CARGO_PKG_VERSION")))
                .timeout(Duration::from_secs(300))
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            max_retries,
            base_delay_ms,
        }
    }

    /// Get max retries
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Download a file with retry logic
    ///
    /// # Arguments
    /// * `url` - URL to download from
    /// * `dest` - Destination path
    /// * `progress` - Optional progress callback (`bytes_downloaded`, `total_bytes`)
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadResult, DownloadError> {
        let mut attempts = 0;
        let mut last_error = None;
        let mut delay_ms = self.base_delay_ms;

        while attempts < self.max_retries {
            attempts += 1;

            match self.download_once(url, dest, progress).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    debug!("Download attempt {attempts} of {url} failed: {e}");
                    last_error = Some(e);

                    if attempts < self.max_retries {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        delay_ms = (delay_ms * 2).min(30_000);
                    }
                }
            }
        }

        let _ = tokio::fs::remove_file(dest).await;

        Err(last_error.unwrap_or_else(|| DownloadError::MaxRetriesExceeded {
            url: url.to_string(),
            retries: self.max_retries,
        }))
    }

    /// Single download attempt without retry
    async fn download_once(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadResult, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::NetworkError {
                url: url.to_string(),
                error: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(DownloadError::NetworkError {
                url: url.to_string(),
                error: format!("HTTP {}", response.status()),
            });
        }

        let total_size = response.content_length().unwrap_or(0);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::IoError {
                    path: parent.to_path_buf(),
                    error: e.to_string(),
                })?;
        }

        let mut file = File::create(dest)
            .await
            .map_err(|e| DownloadError::IoError {
                path: dest.to_path_buf(),
                error: e.to_string(),
            })?;

        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| DownloadError::NetworkError {
                url: url.to_string(),
                error: e.to_string(),
            })?;

            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::IoError {
                    path: dest.to_path_buf(),
                    error: e.to_string(),
                })?;

            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            if let Some(cb) = progress {
                cb(downloaded, total_size);
            }
        }

        file.flush().await.map_err(|e| DownloadError::IoError {
            path: dest.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(DownloadResult {
            path: dest.to_path_buf(),
            size: downloaded,
            checksum: hex::encode(hasher.finalize()),
        })
    }

    /// Download `url` into `cache_dir`, reusing a completed earlier download
    ///
    /// The cache entry is named after the digest of the URL. A `.dl` flag file
    /// sits next to it while the transfer is in progress, so an interrupted
    /// download is never mistaken for a complete one.
    pub async fn fetch_to_cache(
        &self,
        url: &str,
        cache_dir: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<PathBuf, DownloadError> {
        let name = hash_url(url);
        let dest = cache_dir.join(&name);
        let flag = cache_dir.join(format!("{name}{}", defaults::DOWNLOAD_FLAG_SUFFIX));

        if dest.is_file() && !flag.exists() {
            info!("Source already downloaded: {url}");
            return Ok(dest);
        }

        tokio::fs::create_dir_all(cache_dir)
            .await
            .map_err(|e| DownloadError::IoError {
                path: cache_dir.to_path_buf(),
                error: e.to_string(),
            })?;
        tokio::fs::write(&flag, b"")
            .await
            .map_err(|e| DownloadError::IoError {
                path: flag.clone(),
                error: e.to_string(),
            })?;

        info!("Downloading {url}");
        let result = self.download(url, &dest, progress).await?;
        debug!("Downloaded {} bytes to {}", result.size, result.path.display());

        tokio::fs::remove_file(&flag)
            .await
            .map_err(|e| DownloadError::IoError {
                path: flag,
                error: e.to_string(),
            })?;
        Ok(dest)
    }
}

impl Default for DownloadManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache file name for `url`
pub fn hash_url(url: &str) -> String {
    compute_checksum(url.as_bytes())
}

/// Compute SHA256 checksum of data
pub fn compute_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex digest of the file at `path` using `algorithm`
///
/// Algorithm names follow the recipe convention (`sha256`, `sha3_256`,
/// `blake2b`, ...). Returns `None` for algorithms this build does not know.
pub fn file_digest(path: &Path, algorithm: &str) -> Result<Option<String>, DownloadError> {
    let digest = match algorithm.to_ascii_lowercase().as_str() {
        "md5" => digest_file::<Md5>(path)?,
        "sha1" => digest_file::<Sha1>(path)?,
        "sha224" => digest_file::<Sha224>(path)?,
        "sha256" => digest_file::<Sha256>(path)?,
        "sha384" => digest_file::<Sha384>(path)?,
        "sha512" => digest_file::<Sha512>(path)?,
        "sha3_224" => digest_file::<Sha3_224>(path)?,
        "sha3_256" => digest_file::<Sha3_256>(path)?,
        "sha3_384" => digest_file::<Sha3_384>(path)?,
        "sha3_512" => digest_file::<Sha3_512>(path)?,
        "blake2b" => digest_file::<Blake2b512>(path)?,
        "blake2s" => digest_file::<Blake2s256>(path)?,
        _ => return Ok(None),
    };
    Ok(Some(digest))
}

fn digest_file<D: Digest + io::Write>(path: &Path) -> Result<String, DownloadError> {
    let io_error = |e: io::Error| DownloadError::IoError {
        path: path.to_path_buf(),
        error: e.to_string(),
    };
    let mut file = std::fs::File::open(path).map_err(io_error)?;
    let mut hasher = D::new();
    io::copy(&mut file, &mut hasher).map_err(io_error)?;
    Ok(hex::encode(hasher.finalize()))
}
