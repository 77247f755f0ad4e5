//! Chart rendering for aggregation tables.
//!
//! Two artifacts per package: a heatmap (endpoint rows over release
//! columns, white through grey to black by count) and a grouped bar chart
//! (bars per release, grouped by endpoint, colored by release position).
//! Plotters is built with its "ttf" font backend; without a font backend its
//! fallback panics on the first caption or label draw, so no chart geometry
//! could render at all.

use std::path::Path;

use plotters::prelude::*;
use thiserror::Error;

use crate::aggregate::AggregationTable;

/// Labels longer than this are cut for display; table data keeps the full
/// value.
pub const MAX_LABEL_CHARS: usize = 100;

const CELL_WIDTH: u32 = 44;
const CELL_HEIGHT: u32 = 18;
const BAR_SLOT_WIDTH: u32 = 16;

/// Fixed cycle of series colors for bar groups, one per release position.
const SERIES_COLORS: [RGBColor; 8] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
    RGBColor(227, 119, 194),
    RGBColor(127, 127, 127),
];

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("nothing to plot for '{package_id}': no endpoints survived aggregation")]
    EmptyTable { package_id: String },
    #[error("chart backend failure: {0}")]
    Backend(String),
    #[error("i/o while writing chart: {0}")]
    Io(#[from] std::io::Error),
    #[error("render task failed: {0}")]
    Task(String),
}

/// Renders the presence/count heatmap. Rows keep the table's order (first
/// appearance, then value), drawn top-down so the earliest endpoints sit at
/// the top and later arrivals step down like a staircase.
pub fn render_heatmap(table: &AggregationTable, path: &Path) -> Result<(), RenderError> {
    if table.is_empty() {
        return Err(RenderError::EmptyTable {
            package_id: table.package_id.clone(),
        });
    }
    let ncols = table.columns.len();
    let nrows = table.rows.len();
    let max = table.max_count().max(1);

    let (width, height) = heatmap_dimensions(table);
    let root = BitMapBackend::new(path, (width, height)).into_drawing_area();
    root.fill(&WHITE).map_err(backend)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("Endpoints across releases: {}", table.package_id),
            ("sans-serif", 18),
        )
        .margin(10)
        .x_label_area_size(56)
        .y_label_area_size(y_label_area(table))
        .build_cartesian_2d(0f64..ncols as f64, 0f64..nrows as f64)
        .map_err(backend)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .disable_y_mesh()
        .x_labels(ncols.min(12))
        .y_labels(nrows.min(30))
        .label_style(("sans-serif", 12))
        .x_label_formatter(&|v| heatmap_x_label(table, *v))
        .y_label_formatter(&|v| heatmap_y_label(table, *v))
        .draw()
        .map_err(backend)?;

    let mut cells = Vec::new();
    for (r, row) in table.rows.iter().enumerate() {
        let y = (nrows - 1 - r) as f64;
        for (c, &count) in row.counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            cells.push(Rectangle::new(
                [(c as f64 + 0.04, y + 0.06), (c as f64 + 0.96, y + 0.94)],
                shade(count, max).filled(),
            ));
        }
    }
    chart.draw_series(cells).map_err(backend)?;

    root.present().map_err(backend)?;
    Ok(())
}

/// Renders the grouped bar chart: one group per endpoint, one bar per
/// release inside the group, bar height = occurrence count.
pub fn render_bar_chart(table: &AggregationTable, path: &Path) -> Result<(), RenderError> {
    if table.is_empty() {
        return Err(RenderError::EmptyTable {
            package_id: table.package_id.clone(),
        });
    }
    let ncols = table.columns.len();
    let nrows = table.rows.len();
    let slots = nrows * (ncols + 1);
    let max = table.max_count().max(1);

    let (width, height) = bar_chart_dimensions(table);
    let root = BitMapBackend::new(path, (width, height)).into_drawing_area();
    root.fill(&WHITE).map_err(backend)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("Endpoint frequency per release: {}", table.package_id),
            ("sans-serif", 18),
        )
        .margin(10)
        .x_label_area_size(72)
        .y_label_area_size(48)
        .build_cartesian_2d(0f64..slots as f64, 0f64..(max as f64 * 1.05))
        .map_err(backend)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(slots.min(40))
        .y_labels(8)
        .label_style(("sans-serif", 12))
        .x_label_formatter(&|v| bar_group_label(table, *v))
        .draw()
        .map_err(backend)?;

    let mut bars = Vec::new();
    for (r, row) in table.rows.iter().enumerate() {
        for (c, &count) in row.counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let x = (r * (ncols + 1) + c) as f64;
            bars.push(Rectangle::new(
                [(x + 0.08, 0.0), (x + 0.92, count as f64)],
                SERIES_COLORS[c % SERIES_COLORS.len()].filled(),
            ));
        }
    }
    chart.draw_series(bars).map_err(backend)?;

    root.present().map_err(backend)?;
    Ok(())
}

fn backend<E: std::fmt::Display>(error: E) -> RenderError {
    RenderError::Backend(error.to_string())
}

/// White stays reserved for "absent"; the lightest present cell is already
/// visibly grey and the per-table maximum is black.
fn shade(count: u32, max: u32) -> RGBColor {
    let t = (f64::from(count) / f64::from(max)).clamp(0.0, 1.0);
    let level = (205.0 * (1.0 - t)) as u8;
    RGBColor(level, level, level)
}

pub(crate) fn heatmap_dimensions(table: &AggregationTable) -> (u32, u32) {
    let ncols = table.columns.len() as u32;
    let nrows = table.rows.len() as u32;
    let width = (y_label_area(table) as u32 + CELL_WIDTH * ncols + 40).clamp(480, 4096);
    let height = (CELL_HEIGHT * nrows + 140).clamp(320, 8192);
    (width, height)
}

pub(crate) fn bar_chart_dimensions(table: &AggregationTable) -> (u32, u32) {
    let slots = (table.rows.len() * (table.columns.len() + 1)) as u32;
    let width = (BAR_SLOT_WIDTH * slots + 120).clamp(480, 4096);
    (width, 480)
}

/// Estimated pixel width of the y label gutter, based on the longest value.
fn y_label_area(table: &AggregationTable) -> i32 {
    let longest = table
        .rows
        .iter()
        .map(|row| row.value.chars().count().min(44))
        .max()
        .unwrap_or(0);
    (longest as i32) * 7 + 16
}

fn heatmap_x_label(table: &AggregationTable, v: f64) -> String {
    let index = v.floor();
    if index < 0.0 || v != index {
        return String::new();
    }
    table
        .columns
        .get(index as usize)
        .map(|col| col.label())
        .unwrap_or_default()
}

fn heatmap_y_label(table: &AggregationTable, v: f64) -> String {
    let index = v.floor();
    if index < 0.0 || v != index {
        return String::new();
    }
    table
        .rows
        .len()
        .checked_sub(1 + index as usize)
        .and_then(|r| table.rows.get(r))
        .map(|row| truncate_label(&row.value, MAX_LABEL_CHARS))
        .unwrap_or_default()
}

/// Labels the middle slot of each group with the endpoint value.
fn bar_group_label(table: &AggregationTable, v: f64) -> String {
    let slot = v.floor();
    if slot < 0.0 || v != slot {
        return String::new();
    }
    let group_width = table.columns.len() + 1;
    let slot = slot as usize;
    if slot % group_width != group_width / 2 {
        return String::new();
    }
    table
        .rows
        .get(slot / group_width)
        .map(|row| truncate_label(&row.value, 24))
        .unwrap_or_default()
}

fn truncate_label(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregationTable;
    use crate::model::{Endpoint, EndpointCount, EndpointKind, Extraction, Release};
    use chrono::NaiveDate;

    fn table(entries_per_release: &[&[(&str, u32)]]) -> AggregationTable {
        let results: Vec<(Release, Extraction)> = entries_per_release
            .iter()
            .enumerate()
            .map(|(seq, entries)| {
                let release = Release {
                    package_id: "com.example.app".to_string(),
                    sha256: format!("{seq:064x}"),
                    version_code: format!("{}", seq + 1),
                    date_added: NaiveDate::from_ymd_opt(2020, 1, 1 + seq as u32)
                        .unwrap()
                        .and_hms_opt(0, 0, 0)
                        .unwrap(),
                    sequence_index: seq,
                };
                let extraction = Extraction {
                    endpoints: entries
                        .iter()
                        .map(|(value, count)| EndpointCount {
                            endpoint: Endpoint::new(*value, EndpointKind::Subdomain),
                            count: *count,
                        })
                        .collect(),
                };
                (release, extraction)
            })
            .collect();
        AggregationTable::build("com.example.app", &results)
    }

    fn two_release_table() -> AggregationTable {
        table(&[
            &[("ads.example.com", 2)],
            &[("ads.example.com", 1), ("new.example.com", 3)],
        ])
    }

    #[test]
    fn an_empty_table_is_rejected() {
        let empty = table(&[]);
        let dir = tempfile::tempdir().unwrap();
        let err = render_heatmap(&empty, &dir.path().join("h.png")).unwrap_err();
        assert!(matches!(err, RenderError::EmptyTable { .. }));
        let err = render_bar_chart(&empty, &dir.path().join("b.png")).unwrap_err();
        assert!(matches!(err, RenderError::EmptyTable { .. }));
    }

    #[test]
    fn the_heatmap_is_a_decodable_png_with_computed_dimensions() {
        let t = two_release_table();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heatmap.png");
        render_heatmap(&t, &path).unwrap();

        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), heatmap_dimensions(&t));

        let dark = img
            .pixels()
            .filter(|p| p.0[0] < 96 && p.0[1] < 96 && p.0[2] < 96)
            .count();
        assert!(dark > 0, "expected shaded cells");
        let white = img.pixels().filter(|p| p.0 == [255, 255, 255]).count();
        let total = (img.width() * img.height()) as usize;
        assert!(white * 4 > total, "background should stay mostly white");
    }

    #[test]
    fn different_tables_render_different_heatmaps() {
        let dir = tempfile::tempdir().unwrap();
        let a_path = dir.path().join("a.png");
        let b_path = dir.path().join("b.png");
        render_heatmap(&two_release_table(), &a_path).unwrap();
        render_heatmap(&table(&[&[("solo.example.com", 1)], &[]]), &b_path).unwrap();

        let a = image::open(&a_path).unwrap().to_rgb8();
        let b = image::open(&b_path).unwrap().to_rgb8();
        assert!(a.dimensions() != b.dimensions() || a.as_raw() != b.as_raw());
    }

    #[test]
    fn the_bar_chart_uses_colored_bars() {
        let t = two_release_table();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("barchart.png");
        render_bar_chart(&t, &path).unwrap();

        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), bar_chart_dimensions(&t));
        let colored = img
            .pixels()
            .filter(|p| p.0[0] != p.0[1] || p.0[1] != p.0[2])
            .count();
        assert!(colored > 0, "expected at least one colored bar");
    }

    #[test]
    fn shading_runs_white_adjacent_grey_to_black() {
        let light = shade(1, 10);
        let dark = shade(10, 10);
        assert!(light.0 > 150, "low counts should stay light grey");
        assert_eq!((dark.0, dark.1, dark.2), (0, 0, 0));
        assert_eq!(light.0, light.1);
        assert_eq!(light.1, light.2);
    }

    #[test]
    fn labels_are_cut_at_the_display_limit() {
        let long = "a".repeat(300);
        assert_eq!(truncate_label(&long, MAX_LABEL_CHARS).len(), 100);
        assert_eq!(truncate_label("short", MAX_LABEL_CHARS), "short");
    }

    #[test]
    fn group_labels_sit_on_the_middle_slot() {
        let t = two_release_table();
        // Two columns: group width 3, middle slot offset 1.
        assert_eq!(bar_group_label(&t, 1.0), "ads.example.com");
        assert_eq!(bar_group_label(&t, 0.0), "");
        assert_eq!(bar_group_label(&t, 4.0), "new.example.com");
    }
}
