//! Threshold rules over telemetry frames.
//!
//! Each rule is a pure function of the bundle and the thresholds and fires at
//! most once. The engine runs every registered rule and stably sorts the hits
//! by priority, so registering another rule never changes what an existing
//! rule reports.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::telemetry::TelemetryFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Performance,
    Cost,
    Monitoring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub category: Category,
    pub issue: String,
    pub recommendation: String,
    pub action: String,
}

/// Frames a refresh hands to the rules. Empty frames skip their rule.
#[derive(Debug, Clone, Copy)]
pub struct MetricsBundle<'a> {
    pub warehouse_name: &'a str,
    pub warehouse_load: &'a TelemetryFrame,
    pub warehouse_metrics: &'a TelemetryFrame,
    pub query_performance: &'a TelemetryFrame,
    pub cost_by_workload: &'a TelemetryFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleThresholds {
    /// Fires when the peak average queued load is strictly above this.
    pub peak_queued_queries: f64,
    /// Percent of sampled hours with executions; fires strictly below.
    pub min_utilization_pct: f64,
    pub slow_query_seconds: f64,
    /// Percent of credits carrying no workload tag; fires strictly above.
    pub max_untagged_pct: f64,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            peak_queued_queries: 2.0,
            min_utilization_pct: 30.0,
            slow_query_seconds: 300.0,
            max_untagged_pct: 0.0,
        }
    }
}

pub type Rule = fn(&MetricsBundle<'_>, &RuleThresholds) -> Option<Recommendation>;

pub struct RecommendationRuleEngine {
    rules: Vec<(&'static str, Rule)>,
    thresholds: RuleThresholds,
}

impl Default for RecommendationRuleEngine {
    fn default() -> Self {
        Self::new(RuleThresholds::default())
    }
}

impl RecommendationRuleEngine {
    /// Engine with the four built-in rules.
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self {
            rules: vec![
                ("queuing", queuing_rule as Rule),
                ("utilization", utilization_rule as Rule),
                ("slow_queries", slow_query_rule as Rule),
                ("attribution", attribution_rule as Rule),
            ],
            thresholds,
        }
    }

    pub fn empty(thresholds: RuleThresholds) -> Self {
        Self {
            rules: Vec::new(),
            thresholds,
        }
    }

    pub fn with_rule(mut self, name: &'static str, rule: Rule) -> Self {
        self.rules.push((name, rule));
        self
    }

    pub fn thresholds(&self) -> &RuleThresholds {
        &self.thresholds
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|(name, _)| *name)
    }

    pub fn evaluate(&self, bundle: &MetricsBundle<'_>) -> Vec<Recommendation> {
        let mut fired = Vec::new();
        for (name, rule) in &self.rules {
            if let Some(recommendation) = rule(bundle, &self.thresholds) {
                debug!(
                    component = "recommend",
                    event = "recommend.rule.fired",
                    rule = *name,
                    priority = %recommendation.priority
                );
                fired.push(recommendation);
            }
        }
        fired.sort_by_key(|recommendation| recommendation.priority.rank());
        fired
    }
}

pub fn queuing_rule(
    bundle: &MetricsBundle<'_>,
    thresholds: &RuleThresholds,
) -> Option<Recommendation> {
    if bundle.warehouse_load.is_empty() {
        return None;
    }
    let peak = max_of(&bundle.warehouse_load.column_f64("AVG_QUEUED_QUERIES"))?;
    if peak <= thresholds.peak_queued_queries {
        return None;
    }
    Some(Recommendation {
        priority: Priority::High,
        category: Category::Performance,
        issue: "Significant query queuing detected".to_string(),
        recommendation: format!(
            "Peak queued queries: {peak:.1}. Consider scaling up warehouse size or enabling multi-cluster warehouses."
        ),
        action: format!(
            "ALTER WAREHOUSE {} SET WAREHOUSE_SIZE = LARGE;",
            bundle.warehouse_name
        ),
    })
}

pub fn utilization_rule(
    bundle: &MetricsBundle<'_>,
    thresholds: &RuleThresholds,
) -> Option<Recommendation> {
    let utilization = utilization_pct(bundle.warehouse_metrics)?;
    if utilization >= thresholds.min_utilization_pct {
        return None;
    }
    Some(Recommendation {
        priority: Priority::Medium,
        category: Category::Cost,
        issue: format!("Low warehouse utilization ({utilization:.1}%)"),
        recommendation:
            "Consider reducing auto-suspend timeout or consolidating workloads to reduce idle time."
                .to_string(),
        action: format!(
            "ALTER WAREHOUSE {} SET AUTO_SUSPEND = 30;",
            bundle.warehouse_name
        ),
    })
}

pub fn slow_query_rule(
    bundle: &MetricsBundle<'_>,
    thresholds: &RuleThresholds,
) -> Option<Recommendation> {
    if bundle.query_performance.is_empty() {
        return None;
    }
    let slow = bundle
        .query_performance
        .column_f64("EXECUTION_TIME_SECONDS")
        .into_iter()
        .flatten()
        .filter(|seconds| *seconds > thresholds.slow_query_seconds)
        .count();
    if slow == 0 {
        return None;
    }
    Some(Recommendation {
        priority: Priority::Medium,
        category: Category::Performance,
        issue: format!(
            "{slow} queries taking over {}",
            describe_seconds(thresholds.slow_query_seconds)
        ),
        recommendation: "Review slow queries for optimization opportunities (see Query Analysis tab)."
            .to_string(),
        action: "Check query execution plans and consider adding clustering keys or materialized views."
            .to_string(),
    })
}

fn describe_seconds(seconds: f64) -> String {
    let minutes = seconds / 60.0;
    if seconds >= 60.0 && minutes.fract() == 0.0 {
        let unit = if minutes == 1.0 { "minute" } else { "minutes" };
        format!("{minutes} {unit}")
    } else {
        format!("{seconds} seconds")
    }
}

pub fn attribution_rule(
    bundle: &MetricsBundle<'_>,
    thresholds: &RuleThresholds,
) -> Option<Recommendation> {
    let untagged = untagged_credit_pct(bundle.cost_by_workload)?;
    if untagged <= thresholds.max_untagged_pct {
        return None;
    }
    Some(Recommendation {
        priority: Priority::Low,
        category: Category::Monitoring,
        issue: format!("{untagged:.1}% of queries are untagged"),
        recommendation: "Add query tags to all forecasting workloads for better cost attribution."
            .to_string(),
        action: "ALTER SESSION SET QUERY_TAG = 'WORKLOAD:type|PATH:approach';".to_string(),
    })
}

/// Share of sampled hours with at least one execution, in percent.
pub fn utilization_pct(metrics: &TelemetryFrame) -> Option<f64> {
    if metrics.is_empty() {
        return None;
    }
    let counts = metrics.column_f64("EXECUTION_COUNT");
    let active = counts
        .iter()
        .filter(|count| count.is_some_and(|c| c > 0.0))
        .count();
    Some(active as f64 / metrics.len() as f64 * 100.0)
}

/// Share of credits attributed to `UNTAGGED` workloads, in percent.
pub fn untagged_credit_pct(cost_by_workload: &TelemetryFrame) -> Option<f64> {
    if cost_by_workload.is_empty() {
        return None;
    }
    let workloads = cost_by_workload.column_text("WORKLOAD_TYPE");
    let credits = cost_by_workload.column_f64("TOTAL_CREDITS");

    let mut total = 0.0;
    let mut untagged = 0.0;
    for (workload, credits) in workloads.iter().zip(&credits) {
        let credits = credits.unwrap_or(0.0);
        total += credits;
        if workload.as_deref() == Some("UNTAGGED") {
            untagged += credits;
        }
    }
    if total > 0.0 {
        Some(untagged / total * 100.0)
    } else {
        Some(0.0)
    }
}

fn max_of(values: &[Option<f64>]) -> Option<f64> {
    values
        .iter()
        .flatten()
        .copied()
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
}
