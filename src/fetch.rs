//! Artifact retrieval with a local content-addressed cache.
//!
//! Artifacts are cached as `<sha256>.apk`. A hit is served on the size
//! floor alone, with no network traffic and no re-hashing; a miss is
//! downloaded to a `.part` file, validated, and renamed into place so the
//! cache never holds half-written entries.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::MIN_ARTIFACT_BYTES;
use crate::model::Release;
use crate::pipeline::ArtifactFetcher;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("download request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("download for {sha256} returned HTTP {status}")]
    Status { sha256: String, status: u16 },
    #[error("artifact {sha256} is only {bytes} bytes, which is an error page, not an app")]
    TooSmall { sha256: String, bytes: u64 },
    #[error("digest mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("i/o while caching artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// Downloads release artifacts over HTTP, one GET per release.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    cache_dir: PathBuf,
    verify_checksums: bool,
}

impl HttpFetcher {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
        verify_checksums: bool,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            api_key: api_key.into(),
            cache_dir: cache_dir.into(),
            verify_checksums,
        }
    }

    pub fn cached_path(&self, sha256: &str) -> PathBuf {
        self.cache_dir.join(format!("{sha256}.apk"))
    }

    async fn download(&self, release: &Release, target: &Path) -> Result<(), FetchError> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        // The key stays out of the logs; only the digest identifies the request.
        debug!(sha256 = %release.sha256, package = %release.package_id, "downloading artifact");
        let url = format!(
            "{}/api/download?apikey={}&sha256={}",
            self.base_url, self.api_key, release.sha256
        );
        let mut response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                sha256: release.sha256.clone(),
                status: response.status().as_u16(),
            });
        }

        let part = target.with_extension("apk.part");
        let mut file = tokio::fs::File::create(&part).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if let Err(error) = validate_artifact(&part, &release.sha256, self.verify_checksums) {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(error);
        }
        tokio::fs::rename(&part, target).await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, release: &Release) -> Result<PathBuf, FetchError> {
        let path = self.cached_path(&release.sha256);
        if is_valid_cache_entry(&path) {
            debug!(sha256 = %release.sha256, "artifact cache hit");
            return Ok(path);
        }
        self.download(release, &path).await?;
        Ok(path)
    }

    fn prepare(&self) {
        if let Err(error) = sweep_cache(&self.cache_dir, &self.cache_dir.join("trash")) {
            warn!(%error, "cache sweep failed; continuing with the cache as is");
        }
    }
}

/// A hit only has to clear the size floor. Digests are checked once, on
/// the download path; replays trust the cache.
fn is_valid_cache_entry(path: &Path) -> bool {
    matches!(std::fs::metadata(path), Ok(meta) if meta.len() >= MIN_ARTIFACT_BYTES)
}

/// Size floor first, digest second. Tiny responses are the dataset's way of
/// saying "no" while still returning 200.
fn validate_artifact(path: &Path, expected_sha256: &str, verify: bool) -> Result<(), FetchError> {
    let bytes = std::fs::metadata(path)?.len();
    if bytes < MIN_ARTIFACT_BYTES {
        return Err(FetchError::TooSmall {
            sha256: expected_sha256.to_string(),
            bytes,
        });
    }
    if verify {
        let actual = hash_artifact(path)?;
        if !actual.eq_ignore_ascii_case(expected_sha256) {
            return Err(FetchError::ChecksumMismatch {
                expected: expected_sha256.to_ascii_lowercase(),
                actual,
            });
        }
    }
    Ok(())
}

/// Streaming SHA-256 of a file, as lowercase hex.
pub fn hash_artifact(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Moves stale cache entries into `trash_dir`: `.apk` files that no longer
/// open as archives and `.part` leftovers from interrupted downloads. Runs
/// before fetching so a previously interrupted run cannot poison this one
/// with truncated artifacts.
pub fn sweep_cache(cache_dir: &Path, trash_dir: &Path) -> io::Result<usize> {
    if !cache_dir.exists() {
        return Ok(0);
    }
    let mut moved = 0usize;
    for entry in std::fs::read_dir(cache_dir)? {
        let entry = entry?;
        let path = entry.path();
        let stale = match path.extension().and_then(|e| e.to_str()) {
            // A `.part` never survives a completed download; any left on
            // disk is an interrupted one.
            Some("part") => true,
            Some("apk") => !is_readable_archive(&path),
            _ => false,
        };
        if !stale {
            continue;
        }
        std::fs::create_dir_all(trash_dir)?;
        std::fs::rename(&path, trash_dir.join(entry.file_name()))?;
        warn!(path = %path.display(), "moved stale entry out of the cache");
        moved += 1;
    }
    if moved > 0 {
        info!(moved, "cache sweep finished");
    }
    Ok(moved)
}

fn is_readable_archive(path: &Path) -> bool {
    match File::open(path) {
        Ok(file) => zip::ZipArchive::new(file).is_ok(),
        Err(_) => false,
    }
}

// ===== Tests =====
