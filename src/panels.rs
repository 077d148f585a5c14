//! Per-tab summaries shown by the dashboard.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cost::CostParameters;
use crate::recommend::utilization_pct;
use crate::telemetry::TelemetryFrame;

pub const SLOWEST_QUERY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseSummary {
    pub total_credits: f64,
    pub total_cost: f64,
    pub total_executions: f64,
    pub avg_credits_per_hour: f64,
    pub utilization_pct: Option<f64>,
    /// `None` when no load history was returned.
    pub peak_queued_queries: Option<f64>,
    pub queuing_detected: bool,
}

impl WarehouseSummary {
    /// `None` when the metering frame is empty.
    pub fn from_frames(
        metrics: &TelemetryFrame,
        load: &TelemetryFrame,
        params: &CostParameters,
    ) -> Option<Self> {
        if metrics.is_empty() {
            return None;
        }

        let credits: Vec<f64> = metrics
            .column_f64("TOTAL_CREDITS")
            .into_iter()
            .flatten()
            .collect();
        let total_credits: f64 = credits.iter().sum();
        let total_executions: f64 = metrics
            .column_f64("EXECUTION_COUNT")
            .into_iter()
            .flatten()
            .sum();
        let avg_credits_per_hour = if credits.is_empty() {
            0.0
        } else {
            total_credits / credits.len() as f64
        };

        let peak_queued_queries = load
            .column_f64("AVG_QUEUED_QUERIES")
            .into_iter()
            .flatten()
            .reduce(f64::max);

        Some(Self {
            total_credits,
            total_cost: params.to_dollars(total_credits),
            total_executions,
            avg_credits_per_hour,
            utilization_pct: utilization_pct(metrics),
            peak_queued_queries,
            queuing_detected: peak_queued_queries.is_some_and(|peak| peak > 0.0),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQuery {
    pub query_id: Option<String>,
    pub workload_type: Option<String>,
    pub execution_time_seconds: f64,
    pub queue_time_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadPerformance {
    pub workload_type: String,
    pub mean_seconds: f64,
    pub median_seconds: f64,
    pub max_seconds: f64,
    pub total_gb_scanned: f64,
    pub query_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub slowest: Vec<SlowQuery>,
    pub by_workload: Vec<WorkloadPerformance>,
    pub queued_query_count: usize,
}

impl QueryAnalysis {
    /// `None` when the performance frame is empty.
    pub fn from_frame(frame: &TelemetryFrame) -> Option<Self> {
        if frame.is_empty() {
            return None;
        }

        let ids = frame.column_text("QUERY_ID");
        let workloads = frame.column_text("WORKLOAD_TYPE");
        let elapsed = frame.column_f64("EXECUTION_TIME_SECONDS");
        let queued = frame.column_f64("QUEUE_TIME_SECONDS");
        let scanned = frame.column_f64("GB_SCANNED");

        let mut slowest: Vec<SlowQuery> = (0..frame.len())
            .filter_map(|row| {
                let seconds = elapsed.get(row).copied().flatten()?;
                Some(SlowQuery {
                    query_id: text_at(&ids, row),
                    workload_type: text_at(&workloads, row),
                    execution_time_seconds: seconds,
                    queue_time_seconds: queued.get(row).copied().flatten(),
                })
            })
            .collect();
        // stable, so ties keep frame order
        slowest.sort_by(|a, b| {
            b.execution_time_seconds
                .partial_cmp(&a.execution_time_seconds)
                .unwrap_or(Ordering::Equal)
        });
        slowest.truncate(SLOWEST_QUERY_LIMIT);

        let mut groups: BTreeMap<String, (Vec<f64>, f64, usize)> = BTreeMap::new();
        for row in 0..frame.len() {
            let workload = text_at(&workloads, row).unwrap_or_else(|| "OTHER".to_string());
            let group = groups.entry(workload).or_default();
            if let Some(seconds) = elapsed.get(row).copied().flatten() {
                group.0.push(seconds);
            }
            group.1 += scanned.get(row).copied().flatten().unwrap_or(0.0);
            group.2 += 1;
        }
        let by_workload = groups
            .into_iter()
            .map(|(workload_type, (mut times, total_gb_scanned, query_count))| {
                times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                WorkloadPerformance {
                    workload_type,
                    mean_seconds: mean(&times),
                    median_seconds: median(&times),
                    max_seconds: times.last().copied().unwrap_or(0.0),
                    total_gb_scanned,
                    query_count,
                }
            })
            .collect();

        let queued_query_count = queued
            .iter()
            .filter(|seconds| seconds.is_some_and(|s| s > 0.0))
            .count();

        Some(Self {
            slowest,
            by_workload,
            queued_query_count,
        })
    }
}

fn text_at(values: &[Option<String>], row: usize) -> Option<String> {
    values.get(row).cloned().flatten()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

// expects sorted input
fn median(sorted: &[f64]) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n if n % 2 == 1 => sorted[n / 2],
        n => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{CellValue, LookbackDays, QueryKind, Tabular};

    fn frame(kind: QueryKind, columns: &[&str], rows: Vec<Vec<CellValue>>) -> TelemetryFrame {
        TelemetryFrame::from_tabular(
            kind,
            LookbackDays::Seven,
            Tabular {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        )
    }

    #[test]
    fn warehouse_summary_totals_and_queuing() {
        let metrics = frame(
            QueryKind::WarehouseMetrics,
            &["HOUR", "TOTAL_CREDITS", "EXECUTION_COUNT"],
            vec![
                vec![CellValue::Text("h1".into()), CellValue::Real(1.0), CellValue::Integer(2)],
                vec![CellValue::Text("h2".into()), CellValue::Real(3.0), CellValue::Integer(0)],
            ],
        );
        let load = frame(
            QueryKind::WarehouseLoad,
            &["AVG_QUEUED_QUERIES"],
            vec![vec![CellValue::Real(0.0)], vec![CellValue::Real(0.25)]],
        );

        let summary = WarehouseSummary::from_frames(&metrics, &load, &CostParameters::default())
            .expect("summary");
        assert_eq!(summary.total_credits, 4.0);
        assert_eq!(summary.total_cost, 12.0);
        assert_eq!(summary.total_executions, 2.0);
        assert_eq!(summary.avg_credits_per_hour, 2.0);
        assert_eq!(summary.utilization_pct, Some(50.0));
        assert_eq!(summary.peak_queued_queries, Some(0.25));
        assert!(summary.queuing_detected);
    }

    #[test]
    fn warehouse_summary_absent_without_metering() {
        let empty = TelemetryFrame::empty(QueryKind::WarehouseMetrics, LookbackDays::Seven);
        let load = TelemetryFrame::empty(QueryKind::WarehouseLoad, LookbackDays::Seven);
        assert!(WarehouseSummary::from_frames(&empty, &load, &CostParameters::default()).is_none());
    }

    #[test]
    fn query_analysis_ranks_and_groups() {
        let columns = [
            "QUERY_ID",
            "WORKLOAD_TYPE",
            "EXECUTION_TIME_SECONDS",
            "QUEUE_TIME_SECONDS",
            "GB_SCANNED",
        ];
        let row = |id: &str, workload: &str, secs: f64, queue: f64, gb: f64| {
            vec![
                CellValue::Text(id.into()),
                CellValue::Text(workload.into()),
                CellValue::Real(secs),
                CellValue::Real(queue),
                CellValue::Real(gb),
            ]
        };
        let mut rows = vec![
            row("q1", "TRAINING", 10.0, 0.0, 1.0),
            row("q2", "TRAINING", 30.0, 2.0, 1.0),
            row("q3", "TRAINING", 20.0, 0.0, 0.5),
            row("q4", "INFERENCE", 5.0, 1.0, 0.0),
        ];
        for i in 0..10 {
            rows.push(row(&format!("f{i}"), "INFERENCE", 1.0, 0.0, 0.0));
        }

        let analysis = QueryAnalysis::from_frame(&frame(QueryKind::QueryPerformance, &columns, rows))
            .expect("analysis");

        assert_eq!(analysis.slowest.len(), SLOWEST_QUERY_LIMIT);
        assert_eq!(analysis.slowest[0].query_id.as_deref(), Some("q2"));
        assert_eq!(analysis.slowest[4].query_id.as_deref(), Some("f0"));
        assert_eq!(analysis.queued_query_count, 2);

        let training = analysis
            .by_workload
            .iter()
            .find(|w| w.workload_type == "TRAINING")
            .expect("training group");
        assert_eq!(training.mean_seconds, 20.0);
        assert_eq!(training.median_seconds, 20.0);
        assert_eq!(training.max_seconds, 30.0);
        assert_eq!(training.total_gb_scanned, 2.5);
        assert_eq!(training.query_count, 3);

        let inference = &analysis.by_workload[0];
        assert_eq!(inference.workload_type, "INFERENCE");
        assert_eq!(inference.median_seconds, 1.0);
        assert_eq!(inference.query_count, 11);
    }
}
