//! Forecasting pipeline operations core.
//!
//! Two halves share the crate:
//! - feature provisioning: windowed aggregates over entity streams, registered
//!   as versioned feature views next to a placeholder model
//! - warehouse monitoring: cached telemetry extraction, the cost model, panel
//!   summaries and threshold recommendations behind JSON routes

mod cache;
mod config;
mod cost;
mod dashboard;
mod observability;
mod panels;
mod recommend;
mod refresh;
mod registry;
mod series;
mod setup;
mod sql;
mod store;
mod telemetry;
mod window;

pub use cache::{Clock, ManualClock, SystemClock, TtlCache, DEFAULT_TTL_SECONDS};
pub use config::AppConfig;
pub use cost::{
    to_dollars, CostBreakdown, CostParameters, DailyCost, DailyCostStats, ModelPathCost,
    WorkloadCost, DEFAULT_CREDITS_PER_HOUR, DEFAULT_DOLLARS_PER_CREDIT,
};
pub use dashboard::{dashboard_router, DashboardSource};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_store_opened, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use panels::{
    QueryAnalysis, SlowQuery, WarehouseSummary, WorkloadPerformance, SLOWEST_QUERY_LIMIT,
};
pub use recommend::{
    attribution_rule, queuing_rule, slow_query_rule, untagged_credit_pct, utilization_pct,
    utilization_rule, Category, MetricsBundle, Priority, Recommendation,
    RecommendationRuleEngine, Rule, RuleThresholds,
};
pub use refresh::{DashboardService, PanelError, RecommendationsReport, RefreshReport};
pub use registry::{
    DeleteOutcome, Entity, FeatureStoreError, FeatureStoreService, FeatureView,
    FeatureViewRecord, FeatureViewRegistry, FeatureViewSpec, InMemoryFeatureStore,
    RegisterOutcome, RegistrationState, RegistryError,
};
pub use series::{OrderedPartitionedSeries, Partition, TimeSeriesPoint};
pub use setup::{
    check_platform_version, compare_versions, placeholder_model, run_setup, source_series,
    stream_feature_view_spec, LinearModel, ModelArtifact, ModelRegistry, ModelRegistryError,
    SetupError, SetupPlan, SetupReport, AVG_STREAMS_TO_DATE, STREAMS_LAST_4_WEEKS,
};
pub use sql::{render_feature_source, render_query, QueryTarget, SqlDialect};
pub use store::{SqliteFeatureStore, SqliteModelRegistry, SqliteQueryExecutor, StoreError};
pub use telemetry::{
    CellValue, ExecutorError, LookbackDays, QueryDescriptor, QueryExecutor, QueryKind, Tabular,
    TelemetryClient, TelemetryError, TelemetryFrame,
};
pub use window::{
    aggregate_window, compute_features, AggregateFn, FeatureExpr, ValidationError, WindowBound,
    WindowSpec,
};
