//! Run parameters and their one-time validation.
//!
//! Requests arrive as loosely-typed strings (CLI arguments, environment).
//! They are checked exactly once, up front, and everything downstream works
//! with the strictly-typed [`ValidatedRequest`] that validation produces.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Public index of the dataset: one row per known release, with the date it
/// was added.
pub const DATASET_INDEX_URL: &str =
    "https://androzoo.uni.lu/static/lists/latest_with-added-date.csv.gz";

/// Base URL for per-release downloads. The sha256 and API key are appended
/// as query parameters.
pub const DOWNLOAD_BASE_URL: &str = "https://androzoo.uni.lu";

/// How many releases per package a run samples when the caller does not say.
pub const DEFAULT_MAX_VERSIONS: usize = 10;

/// Downloads smaller than this are error pages, not artifacts.
pub const MIN_ARTIFACT_BYTES: u64 = 1000;

/// A run request as it arrives from the outside. Dates are raw strings;
/// nothing here has been checked yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub api_key: String,
    pub packages: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub max_versions: usize,
    /// Reuse per-artifact extraction sidecars from earlier runs.
    pub reuse_extractions: bool,
    /// Verify downloaded artifacts against their index digest.
    pub verify_checksums: bool,
}

impl RunRequest {
    /// Full validation, including the API key. Use this before executing a
    /// run that will download artifacts.
    pub fn validate(&self) -> Result<ValidatedRequest, ValidationError> {
        let validated = self.validate_query()?;
        if self.api_key.trim().is_empty() {
            return Err(ValidationError::MissingApiKey);
        }
        Ok(validated)
    }

    /// Validates everything except the API key. Planning only reads the
    /// local index and never authenticates.
    pub fn validate_query(&self) -> Result<ValidatedRequest, ValidationError> {
        let mut packages = Vec::new();
        for raw in &self.packages {
            let name = raw.trim();
            if name.is_empty() {
                continue;
            }
            if !is_valid_package_name(name) {
                return Err(ValidationError::InvalidPackageName(name.to_string()));
            }
            if packages.iter().any(|p| p == name) {
                debug!(package = name, "dropping duplicate package name");
                continue;
            }
            packages.push(name.to_string());
        }
        if packages.is_empty() {
            return Err(ValidationError::EmptyPackageList);
        }

        let start = parse_date("start date", &self.start_date)?;
        let end = parse_date("end date", &self.end_date)?;
        if end < start {
            return Err(ValidationError::ReversedDateRange { start, end });
        }

        Ok(ValidatedRequest {
            api_key: self.api_key.clone(),
            packages,
            start,
            end,
            max_versions: self.max_versions,
            reuse_extractions: self.reuse_extractions,
            verify_checksums: self.verify_checksums,
        })
    }
}

/// The typed counterpart of [`RunRequest`]: package names are trimmed and
/// deduplicated, dates are real dates, and the range is known to be ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub api_key: String,
    pub packages: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Upper bound on releases sampled per package; 0 means no limit.
    pub max_versions: usize,
    pub reuse_extractions: bool,
    pub verify_checksums: bool,
}

fn parse_date(field: &'static str, raw: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| ValidationError::InvalidDate {
        field,
        value: raw.to_string(),
    })
}

/// Package identifiers are dot-separated Java-style names. Anything that
/// could double as a path or a query string is rejected.
fn is_valid_package_name(name: &str) -> bool {
    !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no package names were provided")]
    EmptyPackageList,
    #[error("package name '{0}' contains unsupported characters")]
    InvalidPackageName(String),
    #[error("{field} '{value}' is not a YYYY-MM-DD date")]
    InvalidDate { field: &'static str, value: String },
    #[error("date range ends ({end}) before it starts ({start})")]
    ReversedDateRange { start: NaiveDate, end: NaiveDate },
    #[error("an API key is required to download releases")]
    MissingApiKey,
}

// ===== Tests =====
