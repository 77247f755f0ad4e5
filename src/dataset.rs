//! The release index: one row per known artifact with the date it entered
//! the dataset.
//!
//! The index is loaded into memory exactly once per process and handed to
//! the pipeline by reference; lookups never touch the file again.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use flate2::read::GzDecoder;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::model::Release;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("dataset index not found at {}", .path.display())]
    Missing { path: PathBuf },
    #[error("could not read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("index rows could not be read: {0}")]
    Csv(#[from] csv::Error),
    #[error("dataset download failed: {0}")]
    Http(reqwest::Error),
    #[error("dataset download returned HTTP {status}")]
    Download { status: u16 },
    #[error("dataset bootstrap failed: {0}")]
    Bootstrap(String),
}

/// The columns this tool cares about. The index carries several more
/// (digests, scan results, sizes); serde drops them by name.
#[derive(Debug, Deserialize)]
struct IndexRow {
    sha256: String,
    pkg_name: String,
    #[serde(default)]
    vercode: String,
    added: String,
}

#[derive(Debug, Clone)]
struct IndexRecord {
    sha256: String,
    pkg_name: String,
    vercode: String,
    added: NaiveDateTime,
}

/// In-memory copy of the release index.
#[derive(Debug)]
pub struct DatasetIndex {
    records: Vec<IndexRecord>,
}

impl DatasetIndex {
    /// Reads the index CSV from disk. A missing file is its own error so the
    /// caller can suggest bootstrapping.
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let file = File::open(path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => IndexError::Missing {
                path: path.to_path_buf(),
            },
            _ => IndexError::Io {
                path: path.to_path_buf(),
                source,
            },
        })?;
        let index = Self::from_reader(BufReader::new(file))?;
        info!(rows = index.len(), path = %path.display(), "dataset index loaded");
        Ok(index)
    }

    /// Parses index rows from any reader. Rows with unusable dates or
    /// shapes are dropped, not fatal; the dataset has historically carried
    /// a handful of malformed lines.
    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, IndexError> {
        let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let mut records = Vec::new();
        let mut dropped = 0usize;
        for row in csv_reader.deserialize::<IndexRow>() {
            let row = match row {
                Ok(row) => row,
                Err(error) => {
                    if matches!(error.kind(), csv::ErrorKind::Io(_)) {
                        return Err(error.into());
                    }
                    dropped += 1;
                    continue;
                }
            };
            let Some(added) = parse_added(&row.added) else {
                dropped += 1;
                continue;
            };
            if row.sha256.is_empty() || row.pkg_name.is_empty() {
                dropped += 1;
                continue;
            }
            records.push(IndexRecord {
                sha256: row.sha256.to_ascii_lowercase(),
                pkg_name: row.pkg_name,
                vercode: row.vercode,
                added,
            });
        }
        if dropped > 0 {
            debug!(dropped, "index rows without usable fields were dropped");
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All releases of `package_id` whose added date falls inside the
    /// inclusive range, ordered by date (sha256 breaks ties) and numbered
    /// from zero.
    pub fn releases_between(
        &self,
        package_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<Release> {
        let mut hits: Vec<&IndexRecord> = self
            .records
            .iter()
            .filter(|r| r.pkg_name == package_id)
            .filter(|r| {
                let day = r.added.date();
                day >= start && day <= end
            })
            .collect();
        hits.sort_by(|a, b| a.added.cmp(&b.added).then_with(|| a.sha256.cmp(&b.sha256)));
        hits.into_iter()
            .enumerate()
            .map(|(sequence_index, r)| Release {
                package_id: package_id.to_string(),
                sha256: r.sha256.clone(),
                version_code: r.vercode.clone(),
                date_added: r.added,
                sequence_index,
            })
            .collect()
    }
}

/// Thins a chronological selection down to roughly `max_versions` releases
/// by keeping every step-th one. The integer step can overshoot the target
/// by a few entries; order is preserved and indices are renumbered.
pub fn sample_releases(releases: Vec<Release>, max_versions: usize) -> Vec<Release> {
    if max_versions == 0 || releases.len() <= max_versions {
        return releases;
    }
    let step = releases.len() / max_versions;
    let mut sampled: Vec<Release> = releases.into_iter().step_by(step).collect();
    for (sequence_index, release) in sampled.iter_mut().enumerate() {
        release.sequence_index = sequence_index;
    }
    sampled
}

/// Downloads and unpacks the gzipped index if `path` is not already
/// present. An existing non-empty file wins; there is no freshness check.
pub async fn ensure_local_copy(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
) -> Result<(), IndexError> {
    if matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.len() > 0) {
        debug!(path = %path.display(), "dataset index already present");
        return Ok(());
    }

    info!(url, path = %path.display(), "downloading dataset index");
    let mut response = client.get(url).send().await.map_err(IndexError::Http)?;
    if !response.status().is_success() {
        return Err(IndexError::Download {
            status: response.status().as_u16(),
        });
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| IndexError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
    }

    let gz_path = path.with_extension("csv.gz");
    let mut gz_file =
        tokio::fs::File::create(&gz_path)
            .await
            .map_err(|source| IndexError::Io {
                path: gz_path.clone(),
                source,
            })?;
    while let Some(chunk) = response.chunk().await.map_err(IndexError::Http)? {
        gz_file
            .write_all(&chunk)
            .await
            .map_err(|source| IndexError::Io {
                path: gz_path.clone(),
                source,
            })?;
    }
    gz_file.flush().await.map_err(|source| IndexError::Io {
        path: gz_path.clone(),
        source,
    })?;
    drop(gz_file);

    let gz = gz_path.clone();
    let out = path.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_gz(&gz, &out))
        .await
        .map_err(|e| IndexError::Bootstrap(format!("decompression task failed: {e}")))??;
    let _ = tokio::fs::remove_file(&gz_path).await;
    info!(path = %path.display(), "dataset index ready");
    Ok(())
}

fn unpack_gz(gz_path: &Path, out_path: &Path) -> Result<(), IndexError> {
    let input = File::open(gz_path).map_err(|source| IndexError::Io {
        path: gz_path.to_path_buf(),
        source,
    })?;
    let mut decoder = GzDecoder::new(BufReader::new(input));
    let mut output = File::create(out_path).map_err(|source| IndexError::Io {
        path: out_path.to_path_buf(),
        source,
    })?;
    io::copy(&mut decoder, &mut output).map_err(|source| IndexError::Io {
        path: out_path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Added dates come as `YYYY-MM-DD HH:MM:SS` with an optional fractional
/// part on some rows.
fn parse_added(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S%.f").ok()
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "sha256,sha1,md5,dex_date,apk_size,pkg_name,vercode,vt_detection,vt_scan_date,dex_size,added";

    fn index_from(rows: &[&str]) -> DatasetIndex {
        let mut text = String::from(HEADER);
        for row in rows {
            text.push('\n');
            text.push_str(row);
        }
        DatasetIndex::from_reader(text.as_bytes()).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn filters_by_package_and_inclusive_date_range() {
        let index = index_from(&[
            "AAA,,,,,com.a,3,,,,2020-03-01 08:00:00",
            "BBB,,,,,com.a,1,,,,2020-01-01 00:00:00",
            "CCC,,,,,com.a,2,,,,2020-02-10 12:30:00.123456",
            "DDD,,,,,com.b,9,,,,2020-02-11 09:00:00",
            "EEE,,,,,com.a,4,,,,2021-01-01 00:00:00",
        ]);
        let releases = index.releases_between("com.a", day(2020, 1, 1), day(2020, 3, 1));
        let shas: Vec<&str> = releases.iter().map(|r| r.sha256.as_str()).collect();
        assert_eq!(shas, vec!["bbb", "ccc", "aaa"]);
        let indices: Vec<usize> = releases.iter().map(|r| r.sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn an_empty_window_yields_no_releases() {
        let index = index_from(&["AAA,,,,,com.a,1,,,,2020-03-01 08:00:00"]);
        assert!(index
            .releases_between("com.a", day(2019, 1, 1), day(2019, 12, 31))
            .is_empty());
    }

    #[test]
    fn rows_with_unusable_dates_or_fields_are_dropped() {
        let index = index_from(&[
            "AAA,,,,,com.a,1,,,,not a date",
            ",,,,,com.a,1,,,,2020-01-01 00:00:00",
            "BBB,,,,,com.a,2,,,,2020-01-02 00:00:00",
        ]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn same_timestamp_rows_order_by_digest() {
        let index = index_from(&[
            "FFF,,,,,com.a,2,,,,2020-01-01 00:00:00",
            "AAA,,,,,com.a,1,,,,2020-01-01 00:00:00",
        ]);
        let releases = index.releases_between("com.a", day(2020, 1, 1), day(2020, 1, 1));
        let shas: Vec<&str> = releases.iter().map(|r| r.sha256.as_str()).collect();
        assert_eq!(shas, vec!["aaa", "fff"]);
    }

    #[test]
    fn load_reports_a_missing_index_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        let err = DatasetIndex::load(&dir.path().join("nope.csv")).unwrap_err();
        assert!(matches!(err, IndexError::Missing { .. }));
    }

    #[test]
    fn sampling_keeps_small_selections_intact() {
        let releases = releases_numbered(7);
        let sampled = sample_releases(releases.clone(), 10);
        assert_eq!(sampled, releases);
    }

    #[test]
    fn sampling_takes_every_step_th_release_and_renumbers() {
        let sampled = sample_releases(releases_numbered(25), 10);
        // step = 25 / 10 = 2, so 13 survive
        assert_eq!(sampled.len(), 13);
        assert_eq!(sampled[0].version_code, "v0");
        assert_eq!(sampled[1].version_code, "v2");
        assert_eq!(sampled[12].version_code, "v24");
        let indices: Vec<usize> = sampled.iter().map(|r| r.sequence_index).collect();
        assert_eq!(indices, (0..13).collect::<Vec<_>>());
    }

    #[test]
    fn sampling_with_zero_means_no_limit() {
        assert_eq!(sample_releases(releases_numbered(25), 0).len(), 25);
    }

    #[test]
    fn unpacks_a_gzipped_index() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("index.csv.gz");
        let out_path = dir.path().join("index.csv");
        let mut encoder = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::fast());
        encoder.write_all(HEADER.as_bytes()).unwrap();
        encoder
            .write_all(b"\nAAA,,,,,com.a,1,,,,2020-01-01 00:00:00\n")
            .unwrap();
        encoder.finish().unwrap();

        unpack_gz(&gz_path, &out_path).unwrap();
        let index = DatasetIndex::load(&out_path).unwrap();
        assert_eq!(index.len(), 1);
    }

    fn releases_numbered(n: usize) -> Vec<Release> {
        (0..n)
            .map(|i| Release {
                package_id: "com.a".to_string(),
                sha256: format!("{i:064x}"),
                version_code: format!("v{i}"),
                date_added: day(2020, 1, 1).and_hms_opt(0, 0, 0).unwrap() + chrono::Duration::days(i as i64),
                sequence_index: i,
            })
            .collect()
    }
}
