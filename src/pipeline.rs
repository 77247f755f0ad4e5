//! Run orchestration.
//!
//! This module provides the [`Orchestrator`] that drives one request through
//! the run lifecycle (Received → Validating → Fetching → Extracting →
//! Aggregating → Rendering → Packaging → Done, Failed from any step) with:
//! - Async execution via `tokio`, one release at a time
//! - CPU-bound extraction and rendering on blocking threads
//! - Structured logging via `tracing` at every state change
//! - Per-release and per-package failures downgraded to recorded skips
//!
//! The dataset index is loaded by the caller and borrowed here; the
//! orchestrator never reads the index file itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate::AggregationTable;
use crate::archive::{self, PackagingError};
use crate::config::{RunRequest, ValidatedRequest, ValidationError};
use crate::dataset::{sample_releases, DatasetIndex, IndexError};
use crate::extract::ExtractionError;
use crate::fetch::FetchError;
use crate::model::{
    Extraction, PackageOutput, Release, RunReport, RunState, SkippedPackage,
};
use crate::render::{self, RenderError};

// ============================================================================
// Stage Seams
// ============================================================================

/// Fetch stage: turns a release into a local artifact file.
///
/// Implementations decide where the bytes come from; the orchestrator only
/// sees the resulting path. A failed fetch skips that release, never the
/// run.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, release: &Release) -> Result<PathBuf, FetchError>;

    /// One-time hook on entry to the fetch phase, for cache maintenance.
    /// The default does nothing.
    fn prepare(&self) {}
}

/// Extraction stage: reads one artifact and returns its endpoints.
///
/// Runs on a blocking thread; implementations are synchronous and must be
/// shareable across threads.
pub trait ArtifactExtractor: Send + Sync {
    fn extract(&self, artifact: &Path) -> Result<Extraction, ExtractionError>;
}

// ============================================================================
// Run Types
// ============================================================================

/// The resolved release selection for a request, before any fetching.
/// This is what the `plan` command shows for confirmation.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub packages: Vec<PackagePlan>,
}

#[derive(Debug, Clone)]
pub struct PackagePlan {
    pub package_id: String,
    pub releases: Vec<Release>,
}

/// Fetch-phase accumulator: the artifacts that made it to disk.
struct PackageWork {
    package_id: String,
    artifacts: Vec<(Release, PathBuf)>,
    releases_skipped: usize,
}

/// Extract-phase accumulator: per-release extraction results.
struct PackageData {
    package_id: String,
    extractions: Vec<(Release, Extraction)>,
    releases_skipped: usize,
}

// ============================================================================
// Run Errors
// ============================================================================

/// The fatal outcomes of a run. Everything else is recorded as a skip in
/// the report and the run carries on.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("dataset index unavailable: {0}")]
    Index(#[from] IndexError),

    #[error("packaging failed: {0}")]
    Packaging(#[from] PackagingError),

    #[error("all {count} requested packages failed; nothing to package")]
    AllPackagesFailed {
        count: usize,
        skipped: Vec<SkippedPackage>,
    },
}

// ============================================================================
// Planning
// ============================================================================

/// Resolves the release selection for a request without fetching anything.
/// Only the query parameters are validated; no API key is needed.
pub fn plan(index: &DatasetIndex, request: &RunRequest) -> Result<RunPlan, RunError> {
    let validated = request.validate_query()?;
    Ok(RunPlan {
        packages: resolve_releases(index, &validated),
    })
}

fn resolve_releases(index: &DatasetIndex, request: &ValidatedRequest) -> Vec<PackagePlan> {
    request
        .packages
        .iter()
        .map(|package_id| {
            let all = index.releases_between(package_id, request.start, request.end);
            let releases = sample_releases(all, request.max_versions);
            PackagePlan {
                package_id: package_id.clone(),
                releases,
            }
        })
        .collect()
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives one request end to end over borrowed dataset state.
///
/// The orchestrator is generic over its fetch and extraction stages so runs
/// can be exercised without network or real artifacts.
pub struct Orchestrator<'a, F, E> {
    /// Release index, loaded once by the caller.
    index: &'a DatasetIndex,

    /// Fetch stage implementation.
    fetcher: F,

    /// Extraction stage implementation, shared with blocking tasks.
    extractor: Arc<E>,
}

impl<'a, F, E> Orchestrator<'a, F, E>
where
    F: ArtifactFetcher,
    E: ArtifactExtractor + 'static,
{
    pub fn new(index: &'a DatasetIndex, fetcher: F, extractor: E) -> Self {
        Self {
            index,
            fetcher,
            extractor: Arc::new(extractor),
        }
    }

    /// Executes a full run and writes its outputs under `output_root`.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] when the request is invalid, when every package
    /// fails, or when the final packaging step cannot write its files.
    /// Individual release and package failures do not error; they appear in
    /// the returned report instead.
    pub async fn execute(
        &self,
        request: &RunRequest,
        output_root: &Path,
    ) -> Result<RunReport, RunError> {
        let mut state = RunState::Received;
        match self.run(request, output_root, &mut state).await {
            Ok(report) => Ok(report),
            Err(error) => {
                warn!(stage = %state, %error, "run failed");
                advance(&mut state, RunState::Failed);
                Err(error)
            }
        }
    }

    async fn run(
        &self,
        request: &RunRequest,
        output_root: &Path,
        state: &mut RunState,
    ) -> Result<RunReport, RunError> {
        advance(state, RunState::Validating);
        let validated = request.validate()?;

        let run_id = Uuid::new_v4().to_string();
        let run_dir = output_root.join(format!("run-{run_id}"));
        std::fs::create_dir_all(&run_dir).map_err(|source| PackagingError::Io {
            path: run_dir.clone(),
            source,
        })?;
        info!(
            run_id = %run_id,
            dir = %run_dir.display(),
            packages = validated.packages.len(),
            "run directory created"
        );

        let plans = resolve_releases(self.index, &validated);

        // ====================================================================
        // Stage: Fetching
        // ====================================================================

        advance(state, RunState::Fetching);
        self.fetcher.prepare();

        let mut skipped: Vec<SkippedPackage> = Vec::new();
        let mut work: Vec<PackageWork> = Vec::new();
        for PackagePlan {
            package_id,
            releases,
        } in plans
        {
            if releases.is_empty() {
                info!(package = %package_id, "no releases in range; skipping package");
                skipped.push(SkippedPackage::new(
                    package_id,
                    format!(
                        "no releases between {} and {}",
                        validated.start, validated.end
                    ),
                ));
                continue;
            }

            let total = releases.len();
            let mut artifacts = Vec::new();
            let mut last_error: Option<FetchError> = None;
            for release in releases {
                match self.fetcher.fetch(&release).await {
                    Ok(path) => artifacts.push((release, path)),
                    Err(error) => {
                        warn!(
                            package = %package_id,
                            sha256 = %release.sha256,
                            %error,
                            "release fetch failed; skipping release"
                        );
                        last_error = Some(error);
                    }
                }
            }

            if artifacts.is_empty() {
                let detail = last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no releases fetched".to_string());
                skipped.push(SkippedPackage::new(
                    package_id,
                    format!("all {total} releases failed to fetch; last error: {detail}"),
                ));
            } else {
                let releases_skipped = total - artifacts.len();
                work.push(PackageWork {
                    package_id,
                    artifacts,
                    releases_skipped,
                });
            }
        }

        // ====================================================================
        // Stage: Extracting
        // ====================================================================

        advance(state, RunState::Extracting);
        let mut data: Vec<PackageData> = Vec::new();
        for pkg in work {
            let mut extractions = Vec::new();
            let mut releases_skipped = pkg.releases_skipped;
            for (release, artifact) in pkg.artifacts {
                match self.extract_blocking(artifact).await {
                    Ok(extraction) => {
                        info!(
                            package = %pkg.package_id,
                            sha256 = %release.sha256,
                            endpoints = extraction.len(),
                            "release extracted"
                        );
                        extractions.push((release, extraction));
                    }
                    Err(error) => {
                        warn!(
                            package = %pkg.package_id,
                            sha256 = %release.sha256,
                            %error,
                            "extraction failed; skipping release"
                        );
                        releases_skipped += 1;
                    }
                }
            }
            if extractions.is_empty() {
                skipped.push(SkippedPackage::new(
                    pkg.package_id,
                    "no release could be extracted",
                ));
            } else {
                data.push(PackageData {
                    package_id: pkg.package_id,
                    extractions,
                    releases_skipped,
                });
            }
        }

        // ====================================================================
        // Stage: Aggregating
        // ====================================================================

        advance(state, RunState::Aggregating);
        let mut tables: Vec<(PackageData, AggregationTable)> = Vec::new();
        for pkg in data {
            let table = AggregationTable::build(&pkg.package_id, &pkg.extractions);
            info!(
                package = %pkg.package_id,
                endpoints = table.rows.len(),
                releases = table.columns.len(),
                "aggregation table built"
            );
            tables.push((pkg, table));
        }

        // ====================================================================
        // Stage: Rendering
        // ====================================================================

        advance(state, RunState::Rendering);
        let mut packages: Vec<PackageOutput> = Vec::new();
        let mut bundle_files: Vec<PathBuf> = Vec::new();
        for (pkg, table) in tables {
            match render_package(&run_dir, &table).await {
                Ok((heatmap, bar_chart)) => {
                    bundle_files.push(heatmap.clone());
                    bundle_files.push(bar_chart.clone());
                    packages.push(PackageOutput {
                        package_id: pkg.package_id,
                        releases_used: pkg.extractions.len(),
                        releases_skipped: pkg.releases_skipped,
                        endpoints: table.rows.len(),
                        heatmap,
                        bar_chart,
                    });
                }
                Err(error) => {
                    warn!(package = %pkg.package_id, %error, "rendering failed; skipping package");
                    skipped.push(SkippedPackage::new(
                        pkg.package_id,
                        format!("rendering failed: {error}"),
                    ));
                }
            }
        }

        if packages.is_empty() {
            return Err(RunError::AllPackagesFailed {
                count: skipped.len(),
                skipped,
            });
        }

        // ====================================================================
        // Stage: Packaging
        // ====================================================================

        advance(state, RunState::Packaging);
        let mut report = RunReport {
            run_id,
            state: RunState::Packaging,
            generated_at: Utc::now(),
            start_date: validated.start,
            end_date: validated.end,
            output_dir: run_dir.clone(),
            archive: None,
            packages,
            skipped,
        };

        let manifest_path = run_dir.join("manifest.txt");
        archive::write_manifest(&report, &manifest_path)?;
        bundle_files.push(manifest_path);

        let archive_path = run_dir.join("results.zip");
        archive::bundle(&run_dir, &bundle_files, &archive_path)?;

        advance(state, RunState::Done);
        report.state = RunState::Done;
        report.archive = Some(archive_path);
        write_summary(&report, &run_dir.join("summary.json"))?;
        info!(
            run_id = %report.run_id,
            packages = report.packages.len(),
            skipped = report.skipped.len(),
            "run finished"
        );
        Ok(report)
    }

    /// Runs one extraction on a blocking thread, folding join failures into
    /// the stage error.
    async fn extract_blocking(&self, artifact: PathBuf) -> Result<Extraction, ExtractionError> {
        let extractor = Arc::clone(&self.extractor);
        match tokio::task::spawn_blocking(move || extractor.extract(&artifact)).await {
            Ok(result) => result,
            Err(join) => Err(ExtractionError::Task(format!("task join error: {join}"))),
        }
    }
}

fn advance(state: &mut RunState, next: RunState) {
    info!(from = %state, to = %next, "run state change");
    *state = next;
}

/// Renders both charts for one package on a blocking thread. The package
/// directory is created here so a dir failure reads as a render skip.
async fn render_package(
    run_dir: &Path,
    table: &AggregationTable,
) -> Result<(PathBuf, PathBuf), RenderError> {
    let pkg_dir = run_dir.join(&table.package_id);
    std::fs::create_dir_all(&pkg_dir)?;
    let heatmap = pkg_dir.join("heatmap.png");
    let bar_chart = pkg_dir.join("barchart.png");

    let task_table = table.clone();
    let heatmap_path = heatmap.clone();
    let bar_chart_path = bar_chart.clone();
    match tokio::task::spawn_blocking(move || {
        render::render_heatmap(&task_table, &heatmap_path)?;
        render::render_bar_chart(&task_table, &bar_chart_path)
    })
    .await
    {
        Ok(result) => result.map(|_| (heatmap, bar_chart)),
        Err(join) => Err(RenderError::Task(format!("task join error: {join}"))),
    }
}

fn write_summary(report: &RunReport, path: &Path) -> Result<(), PackagingError> {
    let file = std::fs::File::create(path).map_err(|source| PackagingError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::to_writer_pretty(file, report).map_err(|source| PackagingError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::from(source),
    })?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
