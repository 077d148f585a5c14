//! Credit to currency conversion and the cost panels built on it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::telemetry::TelemetryFrame;

pub const DEFAULT_DOLLARS_PER_CREDIT: f64 = 3.0;

/// Snowpark-optimized warehouse credits per hour by size.
pub const DEFAULT_CREDITS_PER_HOUR: [(&str, f64); 6] = [
    ("MEDIUM", 6.0),
    ("LARGE", 12.0),
    ("XLARGE", 24.0),
    ("X2LARGE", 48.0),
    ("X3LARGE", 96.0),
    ("X4LARGE", 192.0),
];

const DOLLARS_PER_CREDIT_PARAM: &str = "DOLLARS_PER_CREDIT";
const CREDITS_PER_HOUR_SUFFIX: &str = "_CREDITS_PER_HOUR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostParameters {
    pub dollars_per_credit: f64,
    pub credits_per_hour_by_size: BTreeMap<String, f64>,
}

impl Default for CostParameters {
    fn default() -> Self {
        Self {
            dollars_per_credit: DEFAULT_DOLLARS_PER_CREDIT,
            credits_per_hour_by_size: DEFAULT_CREDITS_PER_HOUR
                .iter()
                .map(|(size, credits)| ((*size).to_string(), *credits))
                .collect(),
        }
    }
}

impl CostParameters {
    /// Reads `(PARAM_NAME, PARAM_VALUE)` rows. An empty frame yields the
    /// defaults; rows that do not parse are skipped.
    pub fn from_frame(frame: &TelemetryFrame) -> Self {
        let mut params = Self::default();
        if frame.is_empty() {
            return params;
        }

        let names = frame.column_text("PARAM_NAME");
        let values = frame.column_f64("PARAM_VALUE");
        for (name, value) in names.into_iter().zip(values) {
            let (Some(name), Some(value)) = (name, value) else {
                continue;
            };
            let name = name.trim().to_ascii_uppercase();
            if name == DOLLARS_PER_CREDIT_PARAM {
                params.dollars_per_credit = value;
            } else if let Some(size) = size_from_param(&name) {
                params.credits_per_hour_by_size.insert(size, value);
            } else {
                debug!(
                    component = "cost",
                    event = "cost.params.ignored",
                    param_name = %name
                );
            }
        }
        params
    }

    pub fn to_dollars(&self, credits: f64) -> f64 {
        to_dollars(credits, self)
    }

    /// Dollars per hour for a warehouse size such as `MEDIUM` or `X2LARGE`.
    pub fn hourly_cost(&self, size: &str) -> Option<f64> {
        self.credits_per_hour_by_size
            .get(&size.trim().to_ascii_uppercase())
            .map(|credits| credits * self.dollars_per_credit)
    }
}

pub fn to_dollars(credits: f64, params: &CostParameters) -> f64 {
    credits * params.dollars_per_credit
}

// SP_WH_MEDIUM_CREDITS_PER_HOUR -> MEDIUM
fn size_from_param(name: &str) -> Option<String> {
    let stem = name.strip_suffix(CREDITS_PER_HOUR_SUFFIX)?;
    let size = stem.rsplit('_').next()?;
    if size.is_empty() {
        None
    } else {
        Some(size.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadCost {
    pub workload_type: String,
    pub total_credits: f64,
    pub estimated_cost: f64,
    pub query_count: f64,
    pub execution_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPathCost {
    pub model_path: String,
    pub total_credits: f64,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub by_workload: Vec<WorkloadCost>,
    /// Excludes queries whose path resolved to `OTHER`.
    pub by_model_path: Vec<ModelPathCost>,
    pub total_credits: f64,
    pub total_cost: f64,
}

impl CostBreakdown {
    pub fn from_frame(frame: &TelemetryFrame, params: &CostParameters) -> Self {
        if frame.is_empty() {
            return Self::default();
        }

        let workloads = frame.column_text("WORKLOAD_TYPE");
        let paths = frame.column_text("MODEL_PATH");
        let credits = frame.column_f64("TOTAL_CREDITS");
        let counts = frame.column_f64("QUERY_COUNT");
        let hours = frame.column_f64("TOTAL_EXECUTION_HOURS");

        let mut by_workload: BTreeMap<String, (f64, f64, f64)> = BTreeMap::new();
        let mut by_path: BTreeMap<String, f64> = BTreeMap::new();

        for row in 0..frame.len() {
            let row_credits = credits.get(row).copied().flatten().unwrap_or(0.0);
            let workload = workloads
                .get(row)
                .cloned()
                .flatten()
                .unwrap_or_else(|| "UNTAGGED".to_string());
            let entry = by_workload.entry(workload).or_insert((0.0, 0.0, 0.0));
            entry.0 += row_credits;
            entry.1 += counts.get(row).copied().flatten().unwrap_or(0.0);
            entry.2 += hours.get(row).copied().flatten().unwrap_or(0.0);

            if let Some(Some(path)) = paths.get(row) {
                if path != "OTHER" {
                    *by_path.entry(path.clone()).or_insert(0.0) += row_credits;
                }
            }
        }

        let by_workload: Vec<WorkloadCost> = by_workload
            .into_iter()
            .map(|(workload_type, (total_credits, query_count, execution_hours))| WorkloadCost {
                workload_type,
                total_credits,
                estimated_cost: params.to_dollars(total_credits),
                query_count,
                execution_hours,
            })
            .collect();
        let by_model_path = by_path
            .into_iter()
            .map(|(model_path, total_credits)| ModelPathCost {
                model_path,
                total_credits,
                estimated_cost: params.to_dollars(total_credits),
            })
            .collect();

        let total_credits: f64 = by_workload.iter().map(|w| w.total_credits).sum();
        Self {
            by_workload,
            by_model_path,
            total_credits,
            total_cost: params.to_dollars(total_credits),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCost {
    pub date: String,
    pub credits: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCostStats {
    pub days: Vec<DailyCost>,
    pub average_daily_cost: f64,
    pub peak_daily_cost: f64,
    pub projected_monthly_cost: f64,
}

impl DailyCostStats {
    /// `None` when there are no daily rows.
    pub fn from_frame(frame: &TelemetryFrame, params: &CostParameters) -> Option<Self> {
        let dates = frame.column_text("DATE");
        let credits = frame.column_f64("DAILY_CREDITS");
        let days: Vec<DailyCost> = dates
            .into_iter()
            .zip(credits)
            .map(|(date, credits)| {
                let credits = credits.unwrap_or(0.0);
                DailyCost {
                    date: date.unwrap_or_default(),
                    credits,
                    cost: params.to_dollars(credits),
                }
            })
            .collect();

        if days.is_empty() {
            return None;
        }

        let average_daily_cost = days.iter().map(|d| d.cost).sum::<f64>() / days.len() as f64;
        let peak_daily_cost = days.iter().map(|d| d.cost).fold(f64::MIN, f64::max);
        Some(Self {
            days,
            average_daily_cost,
            peak_daily_cost,
            projected_monthly_cost: average_daily_cost * 30.0,
        })
    }
}
