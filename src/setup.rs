//! Feature store and model registry provisioning.
//!
//! Setup fails loudly at the first error. Re-running converges: the feature
//! view version and the placeholder model are dropped before they are
//! registered again.

use std::cmp::Ordering;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::registry::{
    DeleteOutcome, Entity, FeatureView, FeatureViewRegistry, FeatureViewSpec,
    FeatureStoreService, RegistryError,
};
use crate::series::{OrderedPartitionedSeries, TimeSeriesPoint};
use crate::sql::{render_feature_source, QueryTarget};
use crate::telemetry::{CellValue, ExecutorError, QueryExecutor, Tabular};
use crate::window::{compute_features, AggregateFn, FeatureExpr, ValidationError, WindowSpec};

pub const TIMESTAMP_COLUMN: &str = "WEEK_ENDING";
pub const STREAMS_COLUMN: &str = "STREAMS";
pub const AVG_STREAMS_TO_DATE: &str = "AVG_STREAMS_TO_DATE";
pub const STREAMS_LAST_4_WEEKS: &str = "STREAMS_LAST_4_WEEKS";
pub const PLACEHOLDER_MODEL_COMMENT: &str = "Placeholder model for registry demonstration";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearModel {
    /// Ordinary least squares on one feature.
    pub fn fit(x: &[f64], y: &[f64]) -> Result<Self, SetupError> {
        if x.len() != y.len() || x.len() < 2 {
            return Err(SetupError::ModelFit(format!(
                "need at least two paired samples, got {} x and {} y",
                x.len(),
                y.len()
            )));
        }
        let n = x.len() as f64;
        let mean_x = x.iter().sum::<f64>() / n;
        let mean_y = y.iter().sum::<f64>() / n;
        let (mut cov, mut var) = (0.0, 0.0);
        for (xi, yi) in x.iter().zip(y) {
            cov += (xi - mean_x) * (yi - mean_y);
            var += (xi - mean_x) * (xi - mean_x);
        }
        if var == 0.0 {
            return Err(SetupError::ModelFit("feature has zero variance".to_string()));
        }
        let slope = cov / var;
        Ok(Self {
            slope,
            intercept: mean_y - slope * mean_x,
        })
    }

    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    pub version: String,
    pub model: LinearModel,
    /// Defines the input signature.
    pub sample_input: Vec<Vec<f64>>,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelRegistryError {
    #[error("model {0} not found")]
    NotFound(String),
    #[error("model {name}/{version} already exists")]
    AlreadyExists { name: String, version: String },
    #[error("model registry service error: {0}")]
    Service(String),
}

pub trait ModelRegistry: Send + Sync {
    fn log_model(&self, artifact: &ModelArtifact) -> Result<(), ModelRegistryError>;
    /// Drops every version. Fails with [`ModelRegistryError::NotFound`] when absent.
    fn drop_model(&self, name: &str) -> Result<(), ModelRegistryError>;
    fn get_model(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<ModelArtifact>, ModelRegistryError>;
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("platform version {found} is older than the required {required}")]
    IncompatibleVersion { found: String, required: String },
    #[error("unparseable version string: {0:?}")]
    InvalidVersion(String),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Window(#[from] ValidationError),
    #[error(transparent)]
    Model(#[from] ModelRegistryError),
    #[error("source row {row}: {reason}")]
    SourceRow { row: usize, reason: String },
    #[error("model fit failed: {0}")]
    ModelFit(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupPlan {
    pub min_platform_version: String,
    pub target: QueryTarget,
    pub entity: Entity,
    pub feature_view_name: String,
    pub feature_view_version: String,
    pub model_name: String,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupReport {
    pub platform_version: String,
    pub feature_view: String,
    pub feature_view_version: String,
    pub replaced_existing_view: bool,
    pub fingerprint: String,
    pub row_count: usize,
    pub model_name: String,
    pub model_version: String,
}

/// Compares dotted numeric versions; missing components count as zero.
pub fn compare_versions(found: &str, required: &str) -> Result<Ordering, SetupError> {
    let found_parts = parse_version(found)?;
    let required_parts = parse_version(required)?;
    let len = found_parts.len().max(required_parts.len());
    for idx in 0..len {
        let a = found_parts.get(idx).copied().unwrap_or(0);
        let b = required_parts.get(idx).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(Ordering::Equal)
}

fn parse_version(raw: &str) -> Result<Vec<u64>, SetupError> {
    let mut parts = Vec::new();
    for segment in raw.trim().split('.') {
        let digits: String = segment.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            break;
        }
        let value = digits
            .parse::<u64>()
            .map_err(|_| SetupError::InvalidVersion(raw.to_string()))?;
        parts.push(value);
    }
    if parts.is_empty() {
        return Err(SetupError::InvalidVersion(raw.to_string()));
    }
    Ok(parts)
}

pub fn check_platform_version(found: &str, required: &str) -> Result<(), SetupError> {
    if compare_versions(found, required)? == Ordering::Less {
        return Err(SetupError::IncompatibleVersion {
            found: found.to_string(),
            required: required.to_string(),
        });
    }
    Ok(())
}

/// `AVG_STREAMS_TO_DATE` and `STREAMS_LAST_4_WEEKS` partitioned by the entity key.
pub fn stream_feature_view_spec(plan: &SetupPlan) -> FeatureViewSpec {
    let join_key = plan
        .entity
        .join_keys
        .first()
        .cloned()
        .unwrap_or_else(|| "ISRC".to_string());
    FeatureViewSpec {
        name: plan.feature_view_name.clone(),
        version: plan.feature_view_version.clone(),
        entities: vec![plan.entity.clone()],
        features: vec![
            FeatureExpr::new(
                AVG_STREAMS_TO_DATE,
                STREAMS_COLUMN,
                AggregateFn::Avg,
                WindowSpec::cumulative(join_key.clone(), TIMESTAMP_COLUMN),
            ),
            FeatureExpr::new(
                STREAMS_LAST_4_WEEKS,
                STREAMS_COLUMN,
                AggregateFn::Sum,
                WindowSpec::trailing(join_key, TIMESTAMP_COLUMN, 3),
            ),
        ],
        timestamp_col: TIMESTAMP_COLUMN.to_string(),
        description: None,
    }
}

/// Turns source rows into a series keyed by `join_key` and ordered by
/// `WEEK_ENDING` as unix seconds.
pub fn source_series(
    tabular: &Tabular,
    join_key: &str,
) -> Result<OrderedPartitionedSeries, SetupError> {
    let column = |name: &str| {
        tabular
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| SetupError::SourceRow {
                row: 0,
                reason: format!("source is missing column {name}"),
            })
    };
    let key_idx = column(join_key)?;
    let ts_idx = column(TIMESTAMP_COLUMN)?;
    let streams_idx = column(STREAMS_COLUMN)?;

    let mut points = Vec::with_capacity(tabular.rows.len());
    for (row_idx, row) in tabular.rows.iter().enumerate() {
        let entity = match row.get(key_idx) {
            Some(CellValue::Null) | None => {
                return Err(SetupError::SourceRow {
                    row: row_idx,
                    reason: format!("null {join_key}"),
                })
            }
            Some(cell) => cell.to_string(),
        };
        let order_key = row
            .get(ts_idx)
            .and_then(timestamp_seconds)
            .ok_or_else(|| SetupError::SourceRow {
                row: row_idx,
                reason: format!("unreadable {TIMESTAMP_COLUMN}"),
            })?;
        let streams = row.get(streams_idx).and_then(CellValue::as_f64);
        points.push(TimeSeriesPoint::new(entity, order_key).with_value(STREAMS_COLUMN, streams));
    }

    Ok(OrderedPartitionedSeries::from_points(
        join_key,
        TIMESTAMP_COLUMN,
        points,
    ))
}

fn timestamp_seconds(cell: &CellValue) -> Option<i64> {
    match cell {
        CellValue::Integer(v) => Some(*v),
        CellValue::Text(raw) => {
            let raw = raw.trim();
            if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
                return Some(ts.and_utc().timestamp());
            }
            let date = NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()?;
            Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
        }
        _ => None,
    }
}

pub fn placeholder_model(plan: &SetupPlan) -> Result<ModelArtifact, SetupError> {
    let x = [1.0, 2.0, 3.0];
    let y = [1.0, 2.0, 3.0];
    Ok(ModelArtifact {
        name: plan.model_name.clone(),
        version: plan.model_version.clone(),
        model: LinearModel::fit(&x, &y)?,
        sample_input: x.iter().map(|v| vec![*v]).collect(),
        comment: PLACEHOLDER_MODEL_COMMENT.to_string(),
    })
}

pub fn run_setup(
    executor: &dyn QueryExecutor,
    store: &dyn FeatureStoreService,
    models: &dyn ModelRegistry,
    plan: &SetupPlan,
) -> Result<SetupReport, SetupError> {
    let platform_version = executor.platform_version()?;
    check_platform_version(&platform_version, &plan.min_platform_version)?;
    info!(
        component = "setup",
        event = "setup.version.ok",
        platform_version = %platform_version,
        required = %plan.min_platform_version
    );

    let registry = FeatureViewRegistry::new(store);
    registry.register_entity(&plan.entity)?;

    let deleted = registry.delete(&plan.feature_view_name, &plan.feature_view_version)?;

    let spec = stream_feature_view_spec(plan);
    let join_key = spec
        .entities
        .first()
        .and_then(|entity| entity.join_keys.first())
        .cloned()
        .unwrap_or_else(|| "ISRC".to_string());
    let source = executor.execute(&render_feature_source(&plan.target, &join_key))?;
    let series = source_series(&source, &join_key)?;
    let features = compute_features(&series, &spec.features)?;

    let view = FeatureView {
        rows: features.points().cloned().collect(),
        spec,
    };
    registry.register(&view)?;
    let fingerprint = view.spec.fingerprint();

    match models.drop_model(&plan.model_name) {
        Ok(()) | Err(ModelRegistryError::NotFound(_)) => {}
        Err(err) => return Err(err.into()),
    }
    let artifact = placeholder_model(plan)?;
    models.log_model(&artifact)?;
    info!(
        component = "setup",
        event = "setup.model.logged",
        model = %artifact.name,
        version = %artifact.version,
        slope = artifact.model.slope,
        intercept = artifact.model.intercept
    );

    let report = SetupReport {
        platform_version,
        feature_view: plan.feature_view_name.clone(),
        feature_view_version: plan.feature_view_version.clone(),
        replaced_existing_view: deleted == DeleteOutcome::Deleted,
        fingerprint,
        row_count: view.rows.len(),
        model_name: artifact.name,
        model_version: artifact.version,
    };
    info!(
        component = "setup",
        event = "setup.completed",
        feature_view = %report.feature_view,
        version = %report.feature_view_version,
        rows = report.row_count,
        replaced = report.replaced_existing_view
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(compare_versions("1.10.0", "1.9.0").ok(), Some(Ordering::Greater));
        assert_eq!(compare_versions("1.9", "1.9.0").ok(), Some(Ordering::Equal));
        assert_eq!(compare_versions("3.45.0-beta", "3.31.0").ok(), Some(Ordering::Greater));
        assert!(matches!(
            compare_versions("unknown", "1.0"),
            Err(SetupError::InvalidVersion(_))
        ));
    }

    #[test]
    fn old_platform_is_rejected() {
        let err = check_platform_version("1.8.9", "1.9.0").expect_err("too old");
        assert!(matches!(err, SetupError::IncompatibleVersion { .. }));
        assert!(check_platform_version("1.9.0", "1.9.0").is_ok());
    }

    #[test]
    fn placeholder_fit_is_identity_line() {
        let model = LinearModel::fit(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]).expect("fit");
        assert!((model.slope - 1.0).abs() < 1e-12);
        assert!(model.intercept.abs() < 1e-12);
        assert!((model.predict(10.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_fit_is_an_error() {
        assert!(matches!(
            LinearModel::fit(&[2.0, 2.0], &[1.0, 3.0]),
            Err(SetupError::ModelFit(_))
        ));
    }

    #[test]
    fn source_rows_accept_dates_and_timestamps() {
        let tabular = Tabular {
            columns: vec![
                "ISRC".to_string(),
                "WEEK_ENDING".to_string(),
                "STREAMS".to_string(),
            ],
            rows: vec![
                vec![
                    CellValue::Text("T1".to_string()),
                    CellValue::Text("2024-01-14".to_string()),
                    CellValue::Integer(20),
                ],
                vec![
                    CellValue::Text("T1".to_string()),
                    CellValue::Text("2024-01-07 00:00:00".to_string()),
                    CellValue::Null,
                ],
            ],
        };
        let series = source_series(&tabular, "ISRC").expect("series");
        assert_eq!(series.metric_values("T1", "STREAMS"), vec![None, Some(20.0)]);

        let points: Vec<i64> = series.points().map(|p| p.order_key).collect();
        assert_eq!(points[1] - points[0], 7 * 86_400);
    }

    #[test]
    fn source_without_timestamp_column_is_rejected() {
        let tabular = Tabular {
            columns: vec!["ISRC".to_string(), "STREAMS".to_string()],
            rows: vec![],
        };
        assert!(matches!(
            source_series(&tabular, "ISRC"),
            Err(SetupError::SourceRow { .. })
        ));
    }
}
