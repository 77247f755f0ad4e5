//! Endpoint extraction from downloaded artifacts.
//!
//! An artifact is a zip archive. Every `*.dex` entry goes through the string
//! pool reader; every other file entry is scanned as text after a lenient
//! UTF-8 decode. The result is the deduplicated set of endpoints the
//! artifact mentions, with occurrence counts.

mod classify;
pub mod dex;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{Endpoint, EndpointCount, Extraction};
use dex::{DexError, DexFile};

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("failed to read artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact is not a readable archive: {0}")]
    BadArchive(#[from] zip::result::ZipError),
    #[error("malformed dex entry '{entry}': {source}")]
    Dex { entry: String, source: DexError },
    #[error("extraction task failed: {0}")]
    Task(String),
}

/// Walks artifacts and recovers the endpoints they mention.
///
/// With `reuse_sidecars` set, each extraction is persisted as a JSON file
/// next to the artifact and replayed on later runs instead of re-reading
/// the archive.
#[derive(Debug, Clone)]
pub struct EndpointExtractor {
    reuse_sidecars: bool,
}

impl EndpointExtractor {
    pub fn new(reuse_sidecars: bool) -> Self {
        Self { reuse_sidecars }
    }

    pub fn extract(&self, artifact: &Path) -> Result<Extraction, ExtractionError> {
        if self.reuse_sidecars {
            if let Some(cached) = load_sidecar(artifact) {
                debug!(path = %artifact.display(), "reusing extraction sidecar");
                return Ok(cached);
            }
        }

        let file = File::open(artifact)?;
        let mut archive = zip::ZipArchive::new(file)?;
        let mut acc: BTreeMap<Endpoint, u32> = BTreeMap::new();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if !entry.is_file() {
                continue;
            }
            let name = entry.name().to_string();
            let mut raw = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut raw)?;
            if name.ends_with(".dex") {
                let dex = DexFile::parse(&raw)
                    .map_err(|source| ExtractionError::Dex { entry: name, source })?;
                for s in dex.strings() {
                    scan_sanitized(s, &mut acc);
                }
            } else {
                scan_sanitized(&String::from_utf8_lossy(&raw), &mut acc);
            }
        }

        let extraction = Extraction {
            endpoints: acc
                .into_iter()
                .map(|(endpoint, count)| EndpointCount { endpoint, count })
                .collect(),
        };
        if self.reuse_sidecars {
            if let Err(error) = store_sidecar(artifact, &extraction) {
                warn!(path = %artifact.display(), %error, "could not persist extraction sidecar");
            }
        }
        Ok(extraction)
    }
}

impl crate::pipeline::ArtifactExtractor for EndpointExtractor {
    fn extract(&self, artifact: &Path) -> Result<Extraction, ExtractionError> {
        EndpointExtractor::extract(self, artifact)
    }
}

/// NUL bytes act as separators so fragments on either side stay apart.
fn scan_sanitized(text: &str, acc: &mut BTreeMap<Endpoint, u32>) {
    if text.contains('\0') {
        classify::scan(&text.replace('\0', " "), acc);
    } else {
        classify::scan(text, acc);
    }
}

/// Sidecar location for an artifact: `<sha>.apk` pairs with
/// `<sha>.endpoints.json`.
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    artifact.with_extension("endpoints.json")
}

fn load_sidecar(artifact: &Path) -> Option<Extraction> {
    let path = sidecar_path(artifact);
    let raw = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(extraction) => Some(extraction),
        Err(error) => {
            debug!(path = %path.display(), %error, "ignoring unreadable sidecar");
            None
        }
    }
}

fn store_sidecar(artifact: &Path, extraction: &Extraction) -> std::io::Result<()> {
    let file = File::create(sidecar_path(artifact))?;
    serde_json::to_writer_pretty(file, extraction).map_err(std::io::Error::from)
}

// ===== Tests =====
