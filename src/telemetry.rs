//! Time-boxed telemetry extraction behind a TTL cache.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{Clock, TtlCache};
use crate::sql::{render_query, QueryTarget};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl CellValue {
    /// Numeric view of the cell. Text is parsed, so DECIMAL columns that the
    /// driver hands back as strings still read as numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Null => None,
            CellValue::Integer(v) => Some(*v as f64),
            CellValue::Real(v) => Some(*v),
            CellValue::Text(raw) => raw.trim().parse::<f64>().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(raw) => Some(raw.as_str()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => f.write_str("NULL"),
            CellValue::Integer(v) => write!(f, "{v}"),
            CellValue::Real(v) => write!(f, "{v}"),
            CellValue::Text(v) => f.write_str(v),
        }
    }
}

/// Raw executor result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tabular {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("query failed: {0}")]
    Query(String),
    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

pub trait QueryExecutor: Send + Sync {
    fn execute(&self, sql: &str) -> Result<Tabular, ExecutorError>;
    fn platform_version(&self) -> Result<String, ExecutorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    WarehouseMetrics,
    WarehouseLoad,
    CostByWorkload,
    QueryPerformance,
    DailyCost,
    CostParameters,
}

impl QueryKind {
    pub const PANELS: [QueryKind; 5] = [
        QueryKind::WarehouseMetrics,
        QueryKind::WarehouseLoad,
        QueryKind::CostByWorkload,
        QueryKind::QueryPerformance,
        QueryKind::DailyCost,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::WarehouseMetrics => "warehouse_metrics",
            QueryKind::WarehouseLoad => "warehouse_load",
            QueryKind::CostByWorkload => "cost_by_workload",
            QueryKind::QueryPerformance => "query_performance",
            QueryKind::DailyCost => "daily_cost",
            QueryKind::CostParameters => "cost_parameters",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum LookbackDays {
    #[default]
    Seven,
    Fourteen,
    Thirty,
}

impl LookbackDays {
    pub const ALL: [LookbackDays; 3] = [
        LookbackDays::Seven,
        LookbackDays::Fourteen,
        LookbackDays::Thirty,
    ];

    pub fn days(self) -> u32 {
        match self {
            LookbackDays::Seven => 7,
            LookbackDays::Fourteen => 14,
            LookbackDays::Thirty => 30,
        }
    }
}

impl From<LookbackDays> for u32 {
    fn from(value: LookbackDays) -> Self {
        value.days()
    }
}

impl TryFrom<u32> for LookbackDays {
    type Error = TelemetryError;

    fn try_from(days: u32) -> Result<Self, Self::Error> {
        match days {
            7 => Ok(LookbackDays::Seven),
            14 => Ok(LookbackDays::Fourteen),
            30 => Ok(LookbackDays::Thirty),
            other => Err(TelemetryError::UnsupportedLookback(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryDescriptor {
    pub kind: QueryKind,
    pub lookback: LookbackDays,
}

impl QueryDescriptor {
    pub fn new(kind: QueryKind, lookback: LookbackDays) -> Self {
        Self { kind, lookback }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub kind: QueryKind,
    pub lookback_days: u32,
    pub fetched_at: DateTime<Utc>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl TelemetryFrame {
    pub fn empty(kind: QueryKind, lookback: LookbackDays) -> Self {
        Self {
            kind,
            lookback_days: lookback.days(),
            fetched_at: Utc::now(),
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn from_tabular(kind: QueryKind, lookback: LookbackDays, tabular: Tabular) -> Self {
        Self {
            kind,
            lookback_days: lookback.days(),
            fetched_at: Utc::now(),
            columns: tabular.columns,
            rows: tabular.rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Column names compare case-insensitively; warehouses disagree on case.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }

    /// Every row's value in `name`, or an empty vec when the column is absent.
    pub fn column_f64(&self, name: &str) -> Vec<Option<f64>> {
        match self.column_index(name) {
            Some(idx) => self
                .rows
                .iter()
                .map(|row| row.get(idx).and_then(CellValue::as_f64))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn column_text(&self, name: &str) -> Vec<Option<String>> {
        match self.column_index(name) {
            Some(idx) => self
                .rows
                .iter()
                .map(|row| match row.get(idx) {
                    None | Some(CellValue::Null) => None,
                    Some(cell) => Some(cell.to_string()),
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&CellValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("lookback of {0} days is not supported, expected 7, 14 or 30")]
    UnsupportedLookback(u32),
    #[error("extraction of {kind} failed: {source}")]
    Extraction {
        kind: QueryKind,
        #[source]
        source: ExecutorError,
    },
}

/// Extraction client shared by dashboard sessions.
pub struct TelemetryClient {
    executor: Arc<dyn QueryExecutor>,
    target: QueryTarget,
    cache: TtlCache<TelemetryFrame>,
}

impl TelemetryClient {
    pub fn new(executor: Arc<dyn QueryExecutor>, target: QueryTarget, ttl: Duration) -> Self {
        Self {
            executor,
            target,
            cache: TtlCache::new(ttl),
        }
    }

    pub fn with_clock(
        executor: Arc<dyn QueryExecutor>,
        target: QueryTarget,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            target,
            cache: TtlCache::with_clock(ttl, clock),
        }
    }

    pub fn target(&self) -> &QueryTarget {
        &self.target
    }

    pub fn cache(&self) -> &TtlCache<TelemetryFrame> {
        &self.cache
    }

    pub fn render(&self, descriptor: QueryDescriptor) -> String {
        render_query(descriptor.kind, descriptor.lookback, &self.target)
    }

    /// Serves from cache while the entry is fresh, otherwise runs the query and
    /// replaces the entry. Failures are returned and never cached.
    pub fn fetch(&self, descriptor: QueryDescriptor) -> Result<TelemetryFrame, TelemetryError> {
        let sql = self.render(descriptor);

        if let Some(frame) = self.cache.get(&sql) {
            debug!(
                component = "telemetry",
                event = "telemetry.fetch.cache_hit",
                kind = %descriptor.kind,
                lookback_days = descriptor.lookback.days(),
                rows = frame.len()
            );
            return Ok(frame);
        }

        debug!(
            component = "telemetry",
            event = "telemetry.fetch.cache_miss",
            kind = %descriptor.kind,
            lookback_days = descriptor.lookback.days()
        );

        let tabular = self.executor.execute(&sql).map_err(|source| {
            warn!(
                component = "telemetry",
                event = "telemetry.fetch.error",
                kind = %descriptor.kind,
                lookback_days = descriptor.lookback.days(),
                error = %source
            );
            TelemetryError::Extraction {
                kind: descriptor.kind,
                source,
            }
        })?;

        let frame = TelemetryFrame::from_tabular(descriptor.kind, descriptor.lookback, tabular);
        self.cache.insert(sql, frame.clone());
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::cache::ManualClock;
    use crate::sql::SqlDialect;

    struct CountingExecutor {
        calls: AtomicUsize,
        fail_next: Mutex<bool>,
    }

    impl CountingExecutor {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_next: Mutex::new(false),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl QueryExecutor for CountingExecutor {
        fn execute(&self, _sql: &str) -> Result<Tabular, ExecutorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as i64;
            let mut fail = self.fail_next.lock().expect("lock");
            if *fail {
                *fail = false;
                return Err(ExecutorError::Query("warehouse suspended".to_string()));
            }
            Ok(Tabular {
                columns: vec!["CALL".to_string()],
                rows: vec![vec![CellValue::Integer(call)]],
            })
        }

        fn platform_version(&self) -> Result<String, ExecutorError> {
            Ok("1.0.0".to_string())
        }
    }

    fn client(executor: Arc<CountingExecutor>, clock: Arc<ManualClock>) -> TelemetryClient {
        TelemetryClient::with_clock(
            executor,
            QueryTarget {
                dialect: SqlDialect::Sqlite,
                database: "DB".to_string(),
                schema: "S".to_string(),
                warehouse: "WH".to_string(),
            },
            Duration::from_secs(300),
            clock,
        )
    }

    #[test]
    fn fresh_entry_is_served_without_executing() {
        let executor = Arc::new(CountingExecutor::new());
        let clock = Arc::new(ManualClock::new());
        let client = client(executor.clone(), clock.clone());
        let desc = QueryDescriptor::new(QueryKind::WarehouseLoad, LookbackDays::Seven);

        let first = client.fetch(desc).expect("first fetch");
        clock.advance(Duration::from_secs(120));
        let second = client.fetch(desc).expect("second fetch");

        assert_eq!(executor.calls(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn expired_entry_is_re_extracted() {
        let executor = Arc::new(CountingExecutor::new());
        let clock = Arc::new(ManualClock::new());
        let client = client(executor.clone(), clock.clone());
        let desc = QueryDescriptor::new(QueryKind::DailyCost, LookbackDays::Fourteen);

        client.fetch(desc).expect("first fetch");
        clock.advance(Duration::from_secs(301));
        let refreshed = client.fetch(desc).expect("refetch");

        assert_eq!(executor.calls(), 2);
        assert_eq!(refreshed.column_f64("call"), vec![Some(1.0)]);
        assert_eq!(refreshed.cell(0, "Call"), Some(&CellValue::Integer(1)));
        assert_eq!(refreshed.cell(1, "CALL"), None);
        assert_eq!(refreshed.cell(0, "MISSING"), None);
    }

    #[test]
    fn different_lookbacks_are_cached_separately() {
        let executor = Arc::new(CountingExecutor::new());
        let client = client(executor.clone(), Arc::new(ManualClock::new()));

        client
            .fetch(QueryDescriptor::new(QueryKind::WarehouseMetrics, LookbackDays::Seven))
            .expect("7d");
        client
            .fetch(QueryDescriptor::new(QueryKind::WarehouseMetrics, LookbackDays::Thirty))
            .expect("30d");

        assert_eq!(executor.calls(), 2);
        assert_eq!(client.cache().len(), 2);
    }

    #[test]
    fn failures_are_not_cached() {
        let executor = Arc::new(CountingExecutor::new());
        *executor.fail_next.lock().expect("lock") = true;
        let client = client(executor.clone(), Arc::new(ManualClock::new()));
        let desc = QueryDescriptor::new(QueryKind::QueryPerformance, LookbackDays::Seven);

        let err = client.fetch(desc).expect_err("first call fails");
        assert!(matches!(
            err,
            TelemetryError::Extraction {
                kind: QueryKind::QueryPerformance,
                ..
            }
        ));
        assert!(client.cache().is_empty());

        client.fetch(desc).expect("retry succeeds");
        assert_eq!(executor.calls(), 2);
    }

    #[test]
    fn lookback_accepts_only_supported_days() {
        assert_eq!(LookbackDays::try_from(14).ok(), Some(LookbackDays::Fourteen));
        assert!(matches!(
            LookbackDays::try_from(10),
            Err(TelemetryError::UnsupportedLookback(10))
        ));
    }

    #[test]
    fn text_cells_parse_as_numbers() {
        let frame = TelemetryFrame::from_tabular(
            QueryKind::CostParameters,
            LookbackDays::Seven,
            Tabular {
                columns: vec!["PARAM_NAME".to_string(), "PARAM_VALUE".to_string()],
                rows: vec![vec![
                    CellValue::Text("DOLLARS_PER_CREDIT".to_string()),
                    CellValue::Text(" 2.5 ".to_string()),
                ]],
            },
        );

        assert_eq!(frame.column_f64("param_value"), vec![Some(2.5)]);
        assert_eq!(
            frame.column_text("Param_Name"),
            vec![Some("DOLLARS_PER_CREDIT".to_string())]
        );
        assert!(frame.column_f64("MISSING").is_empty());
    }
}
