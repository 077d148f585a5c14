//! Telemetry and feature-source query text.
//!
//! `Snowflake` targets the ACCOUNT_USAGE views. `Sqlite` targets a local mirror
//! with the same columns in lower case (`warehouse_metering_history`,
//! `warehouse_load_history`, `query_history`, `cost_params`) and timestamps
//! stored as `YYYY-MM-DD HH:MM:SS` text. Both render the same output column
//! names, so frames read identically whichever dialect produced them.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::telemetry::{LookbackDays, QueryKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlDialect {
    Snowflake,
    Sqlite,
}

impl FromStr for SqlDialect {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "snowflake" => Ok(Self::Snowflake),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown sql dialect: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTarget {
    pub dialect: SqlDialect,
    pub database: String,
    pub schema: String,
    pub warehouse: String,
}

const WORKLOAD_CASE_BODY: &str = "
            WHEN {tag} LIKE '%WORKLOAD:TRAINING%' THEN 'TRAINING'
            WHEN {tag} LIKE '%WORKLOAD:INFERENCE%' THEN 'INFERENCE'
            WHEN {tag} LIKE '%WORKLOAD:DATA_PREP%' THEN 'DATA_PREP'";

const MODEL_PATH_CASE_BODY: &str = "
            WHEN {tag} LIKE '%PATH:ML_FUNCTIONS%' THEN 'ML_FUNCTIONS'
            WHEN {tag} LIKE '%PATH:SNOWPARK_XGBOOST%' THEN 'SNOWPARK_XGBOOST'";

pub fn render_query(kind: QueryKind, lookback: LookbackDays, target: &QueryTarget) -> String {
    let days = match kind {
        QueryKind::DailyCost => lookback.days().min(30),
        _ => lookback.days(),
    };
    let wh = quote_literal(&target.warehouse);

    match (target.dialect, kind) {
        (SqlDialect::Snowflake, QueryKind::WarehouseMetrics) => format!(
            "
    SELECT
        warehouse_name,
        DATE_TRUNC('hour', start_time) AS hour,
        SUM(credits_used) AS total_credits,
        COUNT(*) AS execution_count
    FROM SNOWFLAKE.ACCOUNT_USAGE.WAREHOUSE_METERING_HISTORY
    WHERE warehouse_name = {wh}
      AND start_time >= DATEADD(day, -{days}, CURRENT_TIMESTAMP())
    GROUP BY warehouse_name, DATE_TRUNC('hour', start_time)
    ORDER BY hour
    "
        ),
        (SqlDialect::Sqlite, QueryKind::WarehouseMetrics) => format!(
            "
    SELECT
        warehouse_name AS WAREHOUSE_NAME,
        strftime('%Y-%m-%d %H:00:00', start_time) AS HOUR,
        SUM(credits_used) AS TOTAL_CREDITS,
        COUNT(*) AS EXECUTION_COUNT
    FROM warehouse_metering_history
    WHERE warehouse_name = {wh}
      AND start_time >= datetime('now', '-{days} days')
    GROUP BY warehouse_name, strftime('%Y-%m-%d %H:00:00', start_time)
    ORDER BY HOUR
    "
        ),
        (SqlDialect::Snowflake, QueryKind::WarehouseLoad) => format!(
            "
    SELECT
        start_time,
        end_time,
        avg_running AS avg_running_queries,
        avg_queued_load AS avg_queued_queries,
        avg_queued_provisioning,
        avg_blocked
    FROM SNOWFLAKE.ACCOUNT_USAGE.WAREHOUSE_LOAD_HISTORY
    WHERE warehouse_name = {wh}
      AND start_time >= DATEADD(day, -{days}, CURRENT_TIMESTAMP())
    ORDER BY start_time
    "
        ),
        (SqlDialect::Sqlite, QueryKind::WarehouseLoad) => format!(
            "
    SELECT
        start_time AS START_TIME,
        end_time AS END_TIME,
        avg_running AS AVG_RUNNING_QUERIES,
        avg_queued_load AS AVG_QUEUED_QUERIES,
        avg_queued_provisioning AS AVG_QUEUED_PROVISIONING,
        avg_blocked AS AVG_BLOCKED
    FROM warehouse_load_history
    WHERE warehouse_name = {wh}
      AND start_time >= datetime('now', '-{days} days')
    ORDER BY start_time
    "
        ),
        (SqlDialect::Snowflake, QueryKind::CostByWorkload) => format!(
            "
    WITH tagged_queries AS (
        SELECT
            qh.query_id,
            qh.query_tag,
            qh.total_elapsed_time / 1000 AS execution_time_seconds,
            wmh.credits_used,
            CASE{workload}
                ELSE 'UNTAGGED'
            END AS workload_type,
            CASE{path}
                ELSE 'OTHER'
            END AS model_path
        FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY qh
        LEFT JOIN SNOWFLAKE.ACCOUNT_USAGE.WAREHOUSE_METERING_HISTORY wmh
            ON qh.warehouse_name = wmh.warehouse_name
            AND DATE_TRUNC('hour', qh.start_time) = DATE_TRUNC('hour', wmh.start_time)
        WHERE qh.warehouse_name = {wh}
          AND qh.start_time >= DATEADD(day, -{days}, CURRENT_TIMESTAMP())
          AND qh.execution_status = 'SUCCESS'
    )
    SELECT
        workload_type,
        model_path,
        COUNT(DISTINCT query_id) AS query_count,
        SUM(execution_time_seconds) / 3600 AS total_execution_hours,
        SUM(credits_used) AS total_credits
    FROM tagged_queries
    GROUP BY workload_type, model_path
    ORDER BY total_credits DESC
    ",
            workload = case_body(WORKLOAD_CASE_BODY, "qh.query_tag"),
            path = case_body(MODEL_PATH_CASE_BODY, "qh.query_tag"),
        ),
        (SqlDialect::Sqlite, QueryKind::CostByWorkload) => format!(
            "
    WITH tagged_queries AS (
        SELECT
            qh.query_id,
            qh.query_tag,
            qh.total_elapsed_time / 1000.0 AS execution_time_seconds,
            wmh.credits_used,
            CASE{workload}
                ELSE 'UNTAGGED'
            END AS workload_type,
            CASE{path}
                ELSE 'OTHER'
            END AS model_path
        FROM query_history qh
        LEFT JOIN warehouse_metering_history wmh
            ON qh.warehouse_name = wmh.warehouse_name
            AND strftime('%Y-%m-%d %H', qh.start_time) = strftime('%Y-%m-%d %H', wmh.start_time)
        WHERE qh.warehouse_name = {wh}
          AND qh.start_time >= datetime('now', '-{days} days')
          AND qh.execution_status = 'SUCCESS'
    )
    SELECT
        workload_type AS WORKLOAD_TYPE,
        model_path AS MODEL_PATH,
        COUNT(DISTINCT query_id) AS QUERY_COUNT,
        SUM(execution_time_seconds) / 3600.0 AS TOTAL_EXECUTION_HOURS,
        SUM(credits_used) AS TOTAL_CREDITS
    FROM tagged_queries
    GROUP BY workload_type, model_path
    ORDER BY TOTAL_CREDITS DESC
    ",
            workload = case_body(WORKLOAD_CASE_BODY, "qh.query_tag"),
            path = case_body(MODEL_PATH_CASE_BODY, "qh.query_tag"),
        ),
        (SqlDialect::Snowflake, QueryKind::QueryPerformance) => format!(
            "
    SELECT
        query_id,
        query_tag,
        user_name,
        start_time,
        total_elapsed_time / 1000 AS execution_time_seconds,
        queued_overload_time / 1000 AS queue_time_seconds,
        bytes_scanned / POWER(1024, 3) AS gb_scanned,
        rows_produced,
        CASE{workload}
            ELSE 'OTHER'
        END AS workload_type
    FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY
    WHERE warehouse_name = {wh}
      AND start_time >= DATEADD(day, -{days}, CURRENT_TIMESTAMP())
      AND execution_status = 'SUCCESS'
    ORDER BY total_elapsed_time DESC
    LIMIT 100
    ",
            workload = case_body(WORKLOAD_CASE_BODY, "query_tag"),
        ),
        (SqlDialect::Sqlite, QueryKind::QueryPerformance) => format!(
            "
    SELECT
        query_id AS QUERY_ID,
        query_tag AS QUERY_TAG,
        user_name AS USER_NAME,
        start_time AS START_TIME,
        total_elapsed_time / 1000.0 AS EXECUTION_TIME_SECONDS,
        queued_overload_time / 1000.0 AS QUEUE_TIME_SECONDS,
        bytes_scanned / 1073741824.0 AS GB_SCANNED,
        rows_produced AS ROWS_PRODUCED,
        CASE{workload}
            ELSE 'OTHER'
        END AS WORKLOAD_TYPE
    FROM query_history
    WHERE warehouse_name = {wh}
      AND start_time >= datetime('now', '-{days} days')
      AND execution_status = 'SUCCESS'
    ORDER BY total_elapsed_time DESC
    LIMIT 100
    ",
            workload = case_body(WORKLOAD_CASE_BODY, "query_tag"),
        ),
        (SqlDialect::Snowflake, QueryKind::DailyCost) => format!(
            "
    SELECT
        DATE_TRUNC('day', start_time) AS date,
        SUM(credits_used) AS daily_credits
    FROM SNOWFLAKE.ACCOUNT_USAGE.WAREHOUSE_METERING_HISTORY
    WHERE warehouse_name = {wh}
      AND start_time >= DATEADD(day, -{days}, CURRENT_TIMESTAMP())
    GROUP BY DATE_TRUNC('day', start_time)
    ORDER BY date
    "
        ),
        (SqlDialect::Sqlite, QueryKind::DailyCost) => format!(
            "
    SELECT
        date(start_time) AS DATE,
        SUM(credits_used) AS DAILY_CREDITS
    FROM warehouse_metering_history
    WHERE warehouse_name = {wh}
      AND start_time >= datetime('now', '-{days} days')
    GROUP BY date(start_time)
    ORDER BY DATE
    "
        ),
        (SqlDialect::Snowflake, QueryKind::CostParameters) => format!(
            "
    SELECT param_name, param_value
    FROM {}.{}.SFE_COST_PARAMS
    ",
            target.database, target.schema
        ),
        (SqlDialect::Sqlite, QueryKind::CostParameters) => "
    SELECT param_name AS PARAM_NAME, param_value AS PARAM_VALUE
    FROM cost_params
    "
        .to_string(),
    }
}

/// Source rows for the stream feature view. The track column is aliased to
/// `join_key`, next to `WEEK_ENDING` and `STREAMS`.
pub fn render_feature_source(target: &QueryTarget, join_key: &str) -> String {
    let key = quote_ident(join_key);
    match target.dialect {
        SqlDialect::Snowflake => format!(
            "
    SELECT ISRC AS {key}, WEEK_ENDING, STREAMS
    FROM {}.{}.FORECAST_INPUT_GLOBAL
    WHERE REGION = 'Global'
    ",
            target.database, target.schema
        ),
        SqlDialect::Sqlite => format!(
            "
    SELECT isrc AS {key}, week_ending AS WEEK_ENDING, streams AS STREAMS
    FROM forecast_input_global
    WHERE region = 'Global'
    "
        ),
    }
}

fn case_body(template: &str, tag_column: &str) -> String {
    template.replace("{tag}", tag_column)
}

fn quote_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

fn quote_ident(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}
