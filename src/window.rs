//! Row-based window aggregates over partitioned series.
//!
//! A window frame is described relative to the current row. Frames may reach
//! back to the start of the partition or a fixed number of rows, but never past
//! the current row. Each partition is evaluated in one pass with a running
//! accumulator: rows enter when the frame end reaches them and are evicted when
//! the frame start moves past them.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::series::{OrderedPartitionedSeries, Partition, TimeSeriesPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowBound {
    UnboundedPreceding,
    /// Rows relative to the current row; negative values are preceding rows.
    Offset(i64),
    CurrentRow,
}

impl WindowBound {
    fn relative(self) -> Option<i64> {
        match self {
            Self::UnboundedPreceding => None,
            Self::Offset(offset) => Some(offset),
            Self::CurrentRow => Some(0),
        }
    }
}

impl fmt::Display for WindowBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnboundedPreceding => write!(f, "UNBOUNDED PRECEDING"),
            Self::Offset(offset) if *offset < 0 => write!(f, "{} PRECEDING", -offset),
            Self::Offset(0) | Self::CurrentRow => write!(f, "CURRENT ROW"),
            Self::Offset(offset) => write!(f, "{offset} FOLLOWING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("window bound references {offset} rows after the current row")]
    LookAhead { offset: i64 },
    #[error("window upper bound cannot be UNBOUNDED PRECEDING")]
    UnboundedUpperBound,
    #[error("window lower bound {lower} lies after upper bound {upper}")]
    InvertedBounds { lower: i64, upper: i64 },
    #[error("unknown aggregator: {0}")]
    UnknownAggregator(String),
    #[error(
        "window keys ({window_partition}, {window_order}) do not match series keys ({series_partition}, {series_order})"
    )]
    KeyMismatch {
        window_partition: String,
        window_order: String,
        series_partition: String,
        series_order: String,
    },
    #[error("metric {0} is not present in the series")]
    MissingMetric(String),
    #[error("duplicate feature output column: {0}")]
    DuplicateOutput(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    partition_key: String,
    order_key: String,
    lower: WindowBound,
    upper: WindowBound,
}

impl WindowSpec {
    pub fn rows_between(
        partition_key: impl Into<String>,
        order_key: impl Into<String>,
        lower: WindowBound,
        upper: WindowBound,
    ) -> Result<Self, ValidationError> {
        let upper_offset = upper
            .relative()
            .ok_or(ValidationError::UnboundedUpperBound)?;
        if upper_offset > 0 {
            return Err(ValidationError::LookAhead {
                offset: upper_offset,
            });
        }
        if let Some(lower_offset) = lower.relative() {
            if lower_offset > upper_offset {
                return Err(ValidationError::InvertedBounds {
                    lower: lower_offset,
                    upper: upper_offset,
                });
            }
        }

        Ok(Self {
            partition_key: partition_key.into(),
            order_key: order_key.into(),
            lower,
            upper,
        })
    }

    /// Start of the partition through the current row.
    pub fn cumulative(partition_key: impl Into<String>, order_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            order_key: order_key.into(),
            lower: WindowBound::UnboundedPreceding,
            upper: WindowBound::CurrentRow,
        }
    }

    /// The current row plus `preceding` rows before it.
    pub fn trailing(
        partition_key: impl Into<String>,
        order_key: impl Into<String>,
        preceding: u32,
    ) -> Self {
        Self {
            partition_key: partition_key.into(),
            order_key: order_key.into(),
            lower: WindowBound::Offset(-i64::from(preceding)),
            upper: WindowBound::CurrentRow,
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn order_key(&self) -> &str {
        &self.order_key
    }

    pub fn lower(&self) -> WindowBound {
        self.lower
    }

    pub fn upper(&self) -> WindowBound {
        self.upper
    }

    pub fn is_cumulative(&self) -> bool {
        self.lower == WindowBound::UnboundedPreceding && self.upper.relative() == Some(0)
    }

    fn frame(&self) -> Frame {
        // validated at construction: upper <= 0 and lower <= upper
        let lag = self.upper.relative().unwrap_or(0).unsigned_abs() as usize;
        let reach = self
            .lower
            .relative()
            .map(|offset| offset.unsigned_abs() as usize);
        Frame { reach, lag }
    }
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PARTITION BY {} ORDER BY {} ROWS BETWEEN {} AND {}",
            self.partition_key, self.order_key, self.lower, self.upper
        )
    }
}

/// Row `i` covers `[i - reach, i - lag]`, or `[0, i - lag]` when unbounded.
#[derive(Debug, Clone, Copy)]
struct Frame {
    reach: Option<usize>,
    lag: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFn {
    Avg,
    Sum,
}

impl AggregateFn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Sum => "sum",
        }
    }

    fn finish(self, acc: &Accumulator) -> Option<f64> {
        if acc.count == 0 {
            return None;
        }
        match self {
            Self::Avg => Some(acc.sum / acc.count as f64),
            Self::Sum => Some(acc.sum),
        }
    }
}

impl FromStr for AggregateFn {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "avg" | "mean" => Ok(Self::Avg),
            "sum" => Ok(Self::Sum),
            _ => Err(ValidationError::UnknownAggregator(raw.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    sum: f64,
    count: usize,
}

impl Accumulator {
    fn enter(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    fn evict(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.count -= 1;
            if self.count == 0 {
                self.sum = 0.0;
            } else {
                self.sum -= v;
            }
        }
    }
}

/// Aggregates `metric` over `window` for every row of `series`.
///
/// The output has one point per input point, in the same order, carrying the
/// aggregate under the metric's own name.
pub fn aggregate_window(
    series: &OrderedPartitionedSeries,
    window: &WindowSpec,
    aggregate: AggregateFn,
    metric: &str,
) -> Result<OrderedPartitionedSeries, ValidationError> {
    ensure_keys_match(series, window)?;
    if !series.is_empty() && !series.points().any(|point| point.values.contains_key(metric)) {
        return Err(ValidationError::MissingMetric(metric.to_string()));
    }

    let frame = window.frame();
    let partitions = series
        .partitions()
        .iter()
        .map(|partition| Partition {
            entity_id: partition.entity_id.clone(),
            points: partition
                .points
                .iter()
                .zip(aggregate_partition(partition, frame, aggregate, metric))
                .map(|(point, value)| {
                    TimeSeriesPoint::new(point.entity_id.clone(), point.order_key)
                        .with_value(metric, value)
                })
                .collect(),
        })
        .collect();

    debug!(
        component = "window",
        event = "window.aggregate",
        metric,
        aggregate = aggregate.as_str(),
        window = %window,
        rows = series.len()
    );

    Ok(OrderedPartitionedSeries::from_sorted_partitions(
        series.partition_key().to_string(),
        series.order_key().to_string(),
        partitions,
    ))
}

fn aggregate_partition(
    partition: &Partition,
    frame: Frame,
    aggregate: AggregateFn,
    metric: &str,
) -> Vec<Option<f64>> {
    let values: Vec<Option<f64>> = partition
        .points
        .iter()
        .map(|point| point.value(metric).flatten())
        .collect();

    let mut acc = Accumulator::default();
    let mut start = 0usize;
    let mut end = 0usize;
    let mut out = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        let target_end = (i + 1).saturating_sub(frame.lag);
        while end < target_end {
            acc.enter(values[end]);
            end += 1;
        }

        let target_start = frame.reach.map_or(0, |reach| i.saturating_sub(reach));
        while start < target_start.min(end) {
            acc.evict(values[start]);
            start += 1;
        }

        out.push(aggregate.finish(&acc));
    }

    out
}

fn ensure_keys_match(
    series: &OrderedPartitionedSeries,
    window: &WindowSpec,
) -> Result<(), ValidationError> {
    let partition_ok = series
        .partition_key()
        .eq_ignore_ascii_case(window.partition_key());
    let order_ok = series.order_key().eq_ignore_ascii_case(window.order_key());
    if partition_ok && order_ok {
        return Ok(());
    }
    Err(ValidationError::KeyMismatch {
        window_partition: window.partition_key().to_string(),
        window_order: window.order_key().to_string(),
        series_partition: series.partition_key().to_string(),
        series_order: series.order_key().to_string(),
    })
}

/// One derived feature column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureExpr {
    pub output: String,
    pub input: String,
    pub aggregate: AggregateFn,
    pub window: WindowSpec,
}

impl FeatureExpr {
    pub fn new(
        output: impl Into<String>,
        input: impl Into<String>,
        aggregate: AggregateFn,
        window: WindowSpec,
    ) -> Self {
        Self {
            output: output.into(),
            input: input.into(),
            aggregate,
            window,
        }
    }
}

/// Evaluates every expression and joins the outputs into one feature table,
/// one point per input point.
pub fn compute_features(
    series: &OrderedPartitionedSeries,
    exprs: &[FeatureExpr],
) -> Result<OrderedPartitionedSeries, ValidationError> {
    let mut seen = HashSet::new();
    for expr in exprs {
        if !seen.insert(expr.output.as_str()) {
            return Err(ValidationError::DuplicateOutput(expr.output.clone()));
        }
    }

    let mut columns: Vec<(&str, OrderedPartitionedSeries)> = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let aggregated = aggregate_window(series, &expr.window, expr.aggregate, &expr.input)?;
        columns.push((expr.output.as_str(), aggregated));
    }

    let partitions = series
        .partitions()
        .iter()
        .enumerate()
        .map(|(p_idx, partition)| Partition {
            entity_id: partition.entity_id.clone(),
            points: partition
                .points
                .iter()
                .enumerate()
                .map(|(row_idx, point)| {
                    let values: BTreeMap<String, Option<f64>> = columns
                        .iter()
                        .zip(exprs)
                        .map(|((output, aggregated), expr)| {
                            let value = aggregated.partitions()[p_idx].points[row_idx]
                                .value(&expr.input)
                                .flatten();
                            ((*output).to_string(), value)
                        })
                        .collect();
                    TimeSeriesPoint {
                        entity_id: point.entity_id.clone(),
                        order_key: point.order_key,
                        values,
                    }
                })
                .collect(),
        })
        .collect();

    Ok(OrderedPartitionedSeries::from_sorted_partitions(
        series.partition_key().to_string(),
        series.order_key().to_string(),
        partitions,
    ))
}
