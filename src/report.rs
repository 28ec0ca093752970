//! Run summaries and reporters.
//!
//! [`RunSummary`] is the processed, serializable form of a finished run:
//! per-metric statistics (merged across tag sets), the verdict of every
//! threshold, and the overall pass/fail. Reporters are the I/O boundary; the
//! summary itself is pure data, so the same run can be rendered as a console
//! table, printed as JSON, and written to a file.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use serde::Serialize;

use crate::error::ReportError;
use crate::metrics::{names, MetricsSnapshot};
use crate::run::RunState;
use crate::threshold::ThresholdResult;

/// Derived statistics for one metric name (all tag sets merged).
#[derive(Clone, Debug, Serialize)]
pub struct MetricReport {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    /// Fraction of non-zero samples; the hit rate for 0/1 series.
    pub rate: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

/// Final, machine-readable result of one run.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub scenario: String,
    pub outcome: RunState,
    pub duration_secs: f64,
    pub metrics: BTreeMap<String, MetricReport>,
    pub thresholds: Vec<ThresholdResult>,
    pub passed: bool,
}

impl RunSummary {
    pub(crate) fn build(
        scenario: String,
        outcome: RunState,
        elapsed: Duration,
        snapshot: &MetricsSnapshot,
        thresholds: Vec<ThresholdResult>,
        passed: bool,
    ) -> Self {
        let mut metrics = BTreeMap::new();
        for key in snapshot.series.keys() {
            if metrics.contains_key(&key.name) {
                continue;
            }
            if let Some(merged) = snapshot.get(&key.name) {
                metrics.insert(
                    key.name.clone(),
                    MetricReport {
                        count: merged.count,
                        sum: merged.sum,
                        min: merged.min,
                        max: merged.max,
                        avg: merged.avg(),
                        rate: merged.rate(),
                        p50: merged.percentile(50.0),
                        p90: merged.percentile(90.0),
                        p95: merged.percentile(95.0),
                        p99: merged.percentile(99.0),
                    },
                );
            }
        }

        Self {
            scenario,
            outcome,
            duration_secs: elapsed.as_secs_f64(),
            metrics,
            thresholds,
            passed,
        }
    }

    /// Iterations per second over the run's wall-clock time.
    pub fn iteration_rate(&self) -> f64 {
        let iterations = self
            .metrics
            .get(names::ITERATIONS)
            .map(|m| m.count)
            .unwrap_or(0);
        if self.duration_secs > 0.0 {
            iterations as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

/// Consumes a [`RunSummary`] and sends it somewhere: stdout, a file, a
/// service. Reporters are the only side-effectful stage of reporting.
pub trait Reporter {
    fn report(&self, summary: &RunSummary)
        -> impl Future<Output = Result<(), ReportError>> + Send;
}

/// Renders the summary as a console table.
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    async fn report(&self, summary: &RunSummary) -> Result<(), ReportError> {
        println!("{}", render_table(summary));
        Ok(())
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.2}"),
        None => "-".to_string(),
    }
}

fn render_table(summary: &RunSummary) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            format!("{} [{:?}]", summary.scenario, summary.outcome),
            String::new(),
        ]);

    table.add_row(vec![
        "Result".to_string(),
        if summary.passed { "PASSED".to_string() } else { "FAILED".to_string() },
    ]);
    table.add_row(vec![
        "Duration".to_string(),
        format!("{:.1}s", summary.duration_secs),
    ]);
    table.add_row(vec![
        "Iteration rate".to_string(),
        format!("{:.1}/s", summary.iteration_rate()),
    ]);

    table.add_row(vec![String::new(), String::new()]);
    table.add_row(vec![
        "Metric".to_string(),
        "count / rate / avg / p95 / p99 / max".to_string(),
    ]);
    for (name, metric) in &summary.metrics {
        table.add_row(vec![
            name.clone(),
            format!(
                "{} / {} / {} / {} / {} / {}",
                metric.count,
                fmt_opt(metric.rate),
                fmt_opt(metric.avg),
                fmt_opt(metric.p95),
                fmt_opt(metric.p99),
                fmt_opt(metric.max),
            ),
        ]);
    }

    if !summary.thresholds.is_empty() {
        table.add_row(vec![String::new(), String::new()]);
        for threshold in &summary.thresholds {
            table.add_row(vec![
                format!("{} {}", threshold.selector, threshold.predicate),
                format!(
                    "{} (observed {})",
                    if threshold.passed { "✓ pass" } else { "✗ FAIL" },
                    fmt_opt(threshold.observed),
                ),
            ]);
        }
    }

    table.to_string()
}

/// Prints the summary as pretty JSON on stdout.
pub struct JsonReporter;

impl Reporter for JsonReporter {
    async fn report(&self, summary: &RunSummary) -> Result<(), ReportError> {
        println!("{}", serde_json::to_string_pretty(summary)?);
        Ok(())
    }
}

/// Writes the summary as pretty JSON to a file.
pub struct JsonFileReporter {
    path: PathBuf,
}

impl JsonFileReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Reporter for JsonFileReporter {
    async fn report(&self, summary: &RunSummary) -> Result<(), ReportError> {
        let json = serde_json::to_string_pretty(summary)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}
