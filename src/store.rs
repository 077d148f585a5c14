//! SQLite-backed query executor, feature store and model registry.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use crate::registry::{
    Entity, FeatureStoreError, FeatureStoreService, FeatureView, FeatureViewRecord,
    FeatureViewSpec,
};
use crate::series::TimeSeriesPoint;
use crate::setup::{ModelArtifact, ModelRegistry, ModelRegistryError};
use crate::telemetry::{CellValue, ExecutorError, QueryExecutor, Tabular};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for ExecutorError {
    fn from(err: rusqlite::Error) -> Self {
        ExecutorError::Query(err.to_string())
    }
}

impl From<rusqlite::Error> for FeatureStoreError {
    fn from(err: rusqlite::Error) -> Self {
        FeatureStoreError::Service(err.to_string())
    }
}

impl From<serde_json::Error> for FeatureStoreError {
    fn from(err: serde_json::Error) -> Self {
        FeatureStoreError::Service(format!("definition encoding: {err}"))
    }
}

impl From<rusqlite::Error> for ModelRegistryError {
    fn from(err: rusqlite::Error) -> Self {
        ModelRegistryError::Service(err.to_string())
    }
}

impl From<serde_json::Error> for ModelRegistryError {
    fn from(err: serde_json::Error) -> Self {
        ModelRegistryError::Service(format!("artifact encoding: {err}"))
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        ",
    )?;
    Ok(conn)
}

/// Runs telemetry SQL against a local mirror of the usage views.
pub struct SqliteQueryExecutor {
    conn: Mutex<Connection>,
}

impl SqliteQueryExecutor {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        ensure_mirror_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_mirror_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs statements that return no rows, e.g. seeding the mirror.
    pub fn execute_batch(&self, sql: &str) -> Result<(), ExecutorError> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ExecutorError> {
        self.conn
            .lock()
            .map_err(|_| ExecutorError::Unavailable("sqlite connection lock poisoned".to_string()))
    }
}

impl QueryExecutor for SqliteQueryExecutor {
    fn execute(&self, sql: &str) -> Result<Tabular, ExecutorError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let width = columns.len();

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(width);
            for idx in 0..width {
                cells.push(cell_value(row.get_ref(idx)?));
            }
            out.push(cells);
        }

        debug!(
            component = "store",
            event = "store.query.executed",
            columns = width,
            rows = out.len()
        );
        Ok(Tabular {
            columns,
            rows: out,
        })
    }

    fn platform_version(&self) -> Result<String, ExecutorError> {
        Ok(rusqlite::version().to_string())
    }
}

fn cell_value(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(v) => CellValue::Integer(v),
        ValueRef::Real(v) => CellValue::Real(v),
        ValueRef::Text(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => CellValue::Text(hex::encode(bytes)),
    }
}

fn ensure_mirror_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS warehouse_metering_history (
            warehouse_name TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            credits_used REAL
        );
        CREATE TABLE IF NOT EXISTS warehouse_load_history (
            warehouse_name TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            avg_running REAL,
            avg_queued_load REAL,
            avg_queued_provisioning REAL,
            avg_blocked REAL
        );
        CREATE TABLE IF NOT EXISTS query_history (
            query_id TEXT PRIMARY KEY,
            query_tag TEXT,
            user_name TEXT,
            warehouse_name TEXT NOT NULL,
            start_time TEXT NOT NULL,
            execution_status TEXT NOT NULL,
            total_elapsed_time REAL,
            queued_overload_time REAL,
            bytes_scanned REAL,
            rows_produced INTEGER
        );
        CREATE TABLE IF NOT EXISTS cost_params (
            param_name TEXT PRIMARY KEY,
            param_value REAL
        );
        CREATE TABLE IF NOT EXISTS forecast_input_global (
            isrc TEXT NOT NULL,
            region TEXT NOT NULL,
            week_ending TEXT NOT NULL,
            streams REAL
        );
        ",
    )
}

/// Feature views persisted as JSON definitions plus one row per point.
pub struct SqliteFeatureStore {
    conn: Mutex<Connection>,
}

impl SqliteFeatureStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        ensure_feature_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_feature_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Materialized rows of a view in storage order.
    pub fn rows(&self, name: &str, version: &str) -> Result<Vec<TimeSeriesPoint>, FeatureStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT entity_id, order_key, feature_values
            FROM fs_feature_rows
            WHERE name = ?1 AND version = ?2
            ORDER BY row_idx
            ",
        )?;
        let mut rows = stmt.query(params![name, version])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let values: String = row.get(2)?;
            out.push(TimeSeriesPoint {
                entity_id: row.get(0)?,
                order_key: row.get(1)?,
                values: serde_json::from_str(&values)?,
            });
        }
        Ok(out)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, FeatureStoreError> {
        self.conn
            .lock()
            .map_err(|_| FeatureStoreError::Service("sqlite connection lock poisoned".to_string()))
    }
}

fn ensure_feature_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS fs_entities (
            name TEXT PRIMARY KEY,
            join_keys TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS fs_feature_views (
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            definition TEXT NOT NULL,
            registered_at TEXT NOT NULL,
            PRIMARY KEY (name, version)
        );
        CREATE TABLE IF NOT EXISTS fs_feature_rows (
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            row_idx INTEGER NOT NULL,
            entity_id TEXT NOT NULL,
            order_key INTEGER NOT NULL,
            feature_values TEXT NOT NULL,
            PRIMARY KEY (name, version, row_idx)
        );
        ",
    )
}

impl FeatureStoreService for SqliteFeatureStore {
    fn register_entity(&self, entity: &Entity) -> Result<(), FeatureStoreError> {
        let conn = self.lock()?;
        let join_keys = serde_json::to_string(&entity.join_keys)?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT join_keys FROM fs_entities WHERE name = ?1",
                params![entity.name],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(stored) if stored == join_keys => Ok(()),
            Some(_) => Err(FeatureStoreError::EntityConflict(entity.name.clone())),
            None => {
                conn.execute(
                    "INSERT INTO fs_entities (name, join_keys) VALUES (?1, ?2)",
                    params![entity.name, join_keys],
                )?;
                Ok(())
            }
        }
    }

    fn register_feature_view(&self, view: &FeatureView) -> Result<(), FeatureStoreError> {
        let mut conn = self.lock()?;
        let spec = &view.spec;
        let tx = conn.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM fs_feature_views WHERE name = ?1 AND version = ?2",
                params![spec.name, spec.version],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(FeatureStoreError::AlreadyExists {
                name: spec.name.clone(),
                version: spec.version.clone(),
            });
        }

        tx.execute(
            "
            INSERT INTO fs_feature_views (name, version, fingerprint, definition, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                spec.name,
                spec.version,
                spec.fingerprint(),
                serde_json::to_string(spec)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO fs_feature_rows
                    (name, version, row_idx, entity_id, order_key, feature_values)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
            )?;
            for (idx, row) in view.rows.iter().enumerate() {
                stmt.execute(params![
                    spec.name,
                    spec.version,
                    idx as i64,
                    row.entity_id,
                    row.order_key,
                    serde_json::to_string(&row.values)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_feature_view(&self, name: &str, version: &str) -> Result<(), FeatureStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM fs_feature_views WHERE name = ?1 AND version = ?2",
            params![name, version],
        )?;
        if removed == 0 {
            return Err(FeatureStoreError::NotFound {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        tx.execute(
            "DELETE FROM fs_feature_rows WHERE name = ?1 AND version = ?2",
            params![name, version],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_feature_view(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<FeatureViewRecord>, FeatureStoreError> {
        let conn = self.lock()?;
        let stored: Option<(String, String)> = conn
            .query_row(
                "SELECT fingerprint, definition FROM fs_feature_views WHERE name = ?1 AND version = ?2",
                params![name, version],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((fingerprint, definition)) = stored else {
            return Ok(None);
        };
        let spec: FeatureViewSpec = serde_json::from_str(&definition)?;
        let row_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fs_feature_rows WHERE name = ?1 AND version = ?2",
            params![name, version],
            |row| row.get(0),
        )?;
        Ok(Some(FeatureViewRecord {
            spec,
            fingerprint,
            row_count: row_count as usize,
        }))
    }
}

pub struct SqliteModelRegistry {
    conn: Mutex<Connection>,
}

impl SqliteModelRegistry {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        ensure_model_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_model_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ModelRegistryError> {
        self.conn
            .lock()
            .map_err(|_| ModelRegistryError::Service("sqlite connection lock poisoned".to_string()))
    }
}

fn ensure_model_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS models (
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            artifact TEXT NOT NULL,
            logged_at TEXT NOT NULL,
            PRIMARY KEY (name, version)
        );
        ",
    )
}

impl ModelRegistry for SqliteModelRegistry {
    fn log_model(&self, artifact: &ModelArtifact) -> Result<(), ModelRegistryError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "
            INSERT OR IGNORE INTO models (name, version, artifact, logged_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                artifact.name,
                artifact.version,
                serde_json::to_string(artifact)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(ModelRegistryError::AlreadyExists {
                name: artifact.name.clone(),
                version: artifact.version.clone(),
            });
        }
        Ok(())
    }

    fn drop_model(&self, name: &str) -> Result<(), ModelRegistryError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM models WHERE name = ?1", params![name])?;
        if removed == 0 {
            return Err(ModelRegistryError::NotFound(name.to_string()));
        }
        Ok(())
    }

    fn get_model(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<ModelArtifact>, ModelRegistryError> {
        let conn = self.lock()?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT artifact FROM models WHERE name = ?1 AND version = ?2",
                params![name, version],
                |row| row.get(0),
            )
            .optional()?;
        stored
            .map(|artifact| serde_json::from_str(&artifact).map_err(ModelRegistryError::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_maps_sqlite_types_to_cells() {
        let executor = SqliteQueryExecutor::open_in_memory().expect("open");
        let tabular = executor
            .execute("SELECT 1 AS A, 2.5 AS B, 'x' AS C, NULL AS D, x'ff' AS E")
            .expect("select");

        assert_eq!(tabular.columns, vec!["A", "B", "C", "D", "E"]);
        assert_eq!(
            tabular.rows[0],
            vec![
                CellValue::Integer(1),
                CellValue::Real(2.5),
                CellValue::Text("x".to_string()),
                CellValue::Null,
                CellValue::Text("ff".to_string()),
            ]
        );
    }

    #[test]
    fn executor_reports_sql_errors() {
        let executor = SqliteQueryExecutor::open_in_memory().expect("open");
        assert!(matches!(
            executor.execute("SELECT * FROM missing_table"),
            Err(ExecutorError::Query(_))
        ));
        assert!(executor.platform_version().expect("version").starts_with('3'));
    }

    #[test]
    fn model_drop_distinguishes_absent() {
        let registry = SqliteModelRegistry::open_in_memory().expect("open");
        assert_eq!(
            registry.drop_model("M"),
            Err(ModelRegistryError::NotFound("M".to_string()))
        );
    }
}
