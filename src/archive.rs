//! Run packaging: the plain-text manifest and the final `results.zip`.
//!
//! The manifest names every requested package with either its output
//! figures or the reason it was skipped, so the archive is self-describing
//! without the JSON summary.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::model::RunReport;

#[derive(Error, Debug)]
pub enum PackagingError {
    #[error("could not write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("archive write failed: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("'{}' lies outside the run directory and cannot be bundled", .path.display())]
    OutsideRunDir { path: PathBuf },
}

/// Renders the run manifest. Line order is stable: run header, successful
/// packages, then skips with reasons.
pub fn manifest_text(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("apk-endpoints run {}\n", report.run_id));
    out.push_str(&format!(
        "window: {} to {}\n",
        report.start_date, report.end_date
    ));
    out.push_str(&format!(
        "generated: {}\n\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    out.push_str("packages:\n");
    if report.packages.is_empty() {
        out.push_str("  none\n");
    }
    for pkg in &report.packages {
        out.push_str(&format!(
            "  {}: {} releases, {} endpoints",
            pkg.package_id, pkg.releases_used, pkg.endpoints
        ));
        if pkg.releases_skipped > 0 {
            out.push_str(&format!(" ({} releases skipped)", pkg.releases_skipped));
        }
        out.push('\n');
    }

    out.push_str("skipped:\n");
    if report.skipped.is_empty() {
        out.push_str("  none\n");
    }
    for skip in &report.skipped {
        out.push_str(&format!("  {}: {}\n", skip.package_id, skip.reason));
    }
    out
}

pub fn write_manifest(report: &RunReport, path: &Path) -> Result<(), PackagingError> {
    std::fs::write(path, manifest_text(report)).map_err(|source| PackagingError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Zips the given files into `out`. Entry names are the paths relative to
/// `run_dir` with forward slashes, so the archive unpacks into the same
/// shape as the run directory.
pub fn bundle(run_dir: &Path, files: &[PathBuf], out: &Path) -> Result<(), PackagingError> {
    let file = File::create(out).map_err(|source| PackagingError::Io {
        path: out.to_path_buf(),
        source,
    })?;
    let mut archive = ZipWriter::new(file);
    let options: FileOptions<'_, ()> =
        FileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in files {
        let name = entry_name(run_dir, path)?;
        archive.start_file(name, options)?;
        let mut input = File::open(path).map_err(|source| PackagingError::Io {
            path: path.clone(),
            source,
        })?;
        io::copy(&mut input, &mut archive).map_err(|source| PackagingError::Io {
            path: path.clone(),
            source,
        })?;
    }
    archive.finish()?;
    Ok(())
}

fn entry_name(run_dir: &Path, file: &Path) -> Result<String, PackagingError> {
    let rel = file
        .strip_prefix(run_dir)
        .map_err(|_| PackagingError::OutsideRunDir {
            path: file.to_path_buf(),
        })?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PackageOutput, RunState, SkippedPackage};
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::collections::BTreeSet;
    use std::io::Read;

    fn report() -> RunReport {
        RunReport {
            run_id: "000102".to_string(),
            state: RunState::Done,
            generated_at: Utc.with_ymd_and_hms(2021, 7, 1, 12, 0, 0).unwrap(),
            start_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2020, 12, 31).unwrap(),
            output_dir: PathBuf::from("runs/run-000102"),
            archive: None,
            packages: vec![PackageOutput {
                package_id: "com.a".to_string(),
                releases_used: 4,
                releases_skipped: 1,
                endpoints: 17,
                heatmap: PathBuf::from("com.a/heatmap.png"),
                bar_chart: PathBuf::from("com.a/barchart.png"),
            }],
            skipped: vec![SkippedPackage::new("com.b", "no releases in range")],
        }
    }

    #[test]
    fn the_manifest_names_outputs_and_skip_reasons() {
        let text = manifest_text(&report());
        assert!(text.starts_with("apk-endpoints run 000102\n"));
        assert!(text.contains("window: 2020-01-01 to 2020-12-31"));
        assert!(text.contains("  com.a: 4 releases, 17 endpoints (1 releases skipped)"));
        assert!(text.contains("  com.b: no releases in range"));
    }

    #[test]
    fn an_empty_run_manifest_says_none() {
        let mut empty = report();
        empty.packages.clear();
        empty.skipped.clear();
        let text = manifest_text(&empty);
        assert!(text.contains("packages:\n  none"));
        assert!(text.contains("skipped:\n  none"));
    }

    #[test]
    fn bundling_keeps_relative_paths_as_entry_names() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path();
        std::fs::create_dir_all(run_dir.join("com.a")).unwrap();
        std::fs::write(run_dir.join("com.a/heatmap.png"), b"png-bytes").unwrap();
        std::fs::write(run_dir.join("manifest.txt"), b"manifest").unwrap();

        let out = run_dir.join("results.zip");
        bundle(
            run_dir,
            &[
                run_dir.join("com.a/heatmap.png"),
                run_dir.join("manifest.txt"),
            ],
            &out,
        )
        .unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let names: BTreeSet<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            BTreeSet::from(["com.a/heatmap.png".to_string(), "manifest.txt".to_string()])
        );

        let mut entry = archive.by_name("com.a/heatmap.png").unwrap();
        let mut body = Vec::new();
        entry.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"png-bytes");
    }

    #[test]
    fn files_outside_the_run_directory_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let stray = elsewhere.path().join("stray.png");
        std::fs::write(&stray, b"x").unwrap();

        let err = bundle(dir.path(), &[stray], &dir.path().join("results.zip")).unwrap_err();
        assert!(matches!(err, PackagingError::OutsideRunDir { .. }));
    }

    #[test]
    fn manifests_write_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.txt");
        write_manifest(&report(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("apk-endpoints run 000102"));
    }
}
