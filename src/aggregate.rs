//! Cross-release aggregation for one package.
//!
//! The table has one column per successfully extracted release and one row
//! per endpoint value ever seen for the package. Cells carry occurrence
//! counts; zero means the endpoint was absent in that release.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use tracing::warn;

use crate::model::{EndpointKind, Extraction, Release};

/// Column header data for one release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseColumn {
    pub sequence_index: usize,
    pub version_code: String,
    pub date_added: NaiveDateTime,
}

impl ReleaseColumn {
    fn from_release(release: &Release) -> Self {
        Self {
            sequence_index: release.sequence_index,
            version_code: release.version_code.clone(),
            date_added: release.date_added,
        }
    }

    /// Axis label: version code plus the day it entered the dataset.
    pub fn label(&self) -> String {
        let day = self.date_added.format("%Y-%m-%d");
        if self.version_code.is_empty() {
            day.to_string()
        } else {
            format!("{} ({day})", self.version_code)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationRow {
    pub value: String,
    pub kind: EndpointKind,
    /// One count per column, zero when the release never mentioned the value.
    pub counts: Vec<u32>,
    /// Column index where the value first appeared.
    pub first_seen: usize,
}

impl AggregationRow {
    pub fn present(&self, column: usize) -> bool {
        self.counts.get(column).is_some_and(|c| *c > 0)
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }
}

/// The full endpoint-by-release table for one package. Rows are ordered by
/// first appearance, then value, which gives the heatmap its staircase shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationTable {
    pub package_id: String,
    pub columns: Vec<ReleaseColumn>,
    pub rows: Vec<AggregationRow>,
}

impl AggregationTable {
    /// Folds per-release extractions into the table. Input pairs may arrive
    /// in any order; columns always end up in sequence order.
    ///
    /// A value that shows up under a different kind in a later release keeps
    /// the kind it was first seen with.
    pub fn build(package_id: &str, results: &[(Release, Extraction)]) -> Self {
        let mut order: Vec<usize> = (0..results.len()).collect();
        order.sort_by_key(|&i| results[i].0.sequence_index);
        let columns: Vec<ReleaseColumn> = order
            .iter()
            .map(|&i| ReleaseColumn::from_release(&results[i].0))
            .collect();

        let mut rows: Vec<AggregationRow> = Vec::new();
        let mut by_value: HashMap<String, usize> = HashMap::new();
        for (column, &i) in order.iter().enumerate() {
            for entry in results[i].1.iter() {
                let value = &entry.endpoint.value;
                let row_index = if let Some(&existing) = by_value.get(value) {
                    if rows[existing].kind != entry.endpoint.kind {
                        warn!(
                            endpoint = %value,
                            kept = %rows[existing].kind,
                            seen = %entry.endpoint.kind,
                            "endpoint kind changed across releases; keeping the first"
                        );
                    }
                    existing
                } else {
                    by_value.insert(value.clone(), rows.len());
                    rows.push(AggregationRow {
                        value: value.clone(),
                        kind: entry.endpoint.kind,
                        counts: vec![0; columns.len()],
                        first_seen: column,
                    });
                    rows.len() - 1
                };
                rows[row_index].counts[column] += entry.count;
            }
        }

        rows.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.value.cmp(&b.value))
        });
        Self {
            package_id: package_id.to_string(),
            columns,
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.columns.is_empty()
    }

    /// Largest single cell value, used to anchor the heatmap shading.
    pub fn max_count(&self) -> u32 {
        self.rows
            .iter()
            .flat_map(|row| row.counts.iter().copied())
            .max()
            .unwrap_or(0)
    }

    pub fn row(&self, value: &str) -> Option<&AggregationRow> {
        self.rows.iter().find(|row| row.value == value)
    }
}

// ===== Tests =====
