use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One dataset row selected for a run: a single dated release of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub package_id: String,
    pub sha256: String, // lowercase hex, also the artifact's cache key
    pub version_code: String,
    pub date_added: NaiveDateTime,
    /// Position within the package's chronological selection, starting at 0.
    pub sequence_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Subdomain,
    Domain,
    Url,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Subdomain => "subdomain",
            EndpointKind::Domain => "domain",
            EndpointKind::Url => "url",
        }
    }
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network endpoint string recovered from an artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub value: String,
    pub kind: EndpointKind,
}

impl Endpoint {
    pub fn new(value: impl Into<String>, kind: EndpointKind) -> Self {
        Self {
            value: value.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCount {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub count: u32,
}

/// Everything recovered from one artifact: the distinct endpoints it mentions
/// and how often each occurred. Entries are sorted by value and kind, so two
/// extractions of the same artifact compare equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub endpoints: Vec<EndpointCount>,
}

impl Extraction {
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointCount> {
        self.endpoints.iter()
    }
}

/// Lifecycle of a run. Each state is entered once; `Failed` can follow any
/// of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Received,
    Validating,
    Fetching,
    Extracting,
    Aggregating,
    Rendering,
    Packaging,
    Done,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Received => "received",
            RunState::Validating => "validating",
            RunState::Fetching => "fetching",
            RunState::Extracting => "extracting",
            RunState::Aggregating => "aggregating",
            RunState::Rendering => "rendering",
            RunState::Packaging => "packaging",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What one package contributed to a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageOutput {
    pub package_id: String,
    pub releases_used: usize,
    pub releases_skipped: usize,
    pub endpoints: usize,
    pub heatmap: PathBuf,
    pub bar_chart: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPackage {
    pub package_id: String,
    pub reason: String,
}

impl SkippedPackage {
    pub fn new(package_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            reason: reason.into(),
        }
    }
}

/// Run-level outcome, serialized as `summary.json` in the run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    pub generated_at: DateTime<Utc>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub output_dir: PathBuf,
    /// The bundled archive, set once packaging succeeds.
    pub archive: Option<PathBuf>,
    pub packages: Vec<PackageOutput>,
    pub skipped: Vec<SkippedPackage>,
}
