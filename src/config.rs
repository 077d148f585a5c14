//! Application configuration read from `FOPS_*` environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::DEFAULT_TTL_SECONDS;
use crate::registry::Entity;
use crate::setup::SetupPlan;
use crate::sql::{QueryTarget, SqlDialect};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database: String,
    pub schema: String,
    pub warehouse: String,
    pub feature_store: String,
    pub entity_name: String,
    pub entity_join_key: String,
    pub feature_view_name: String,
    pub feature_view_version: String,
    pub model_name: String,
    pub model_version: String,
    pub cache_ttl_seconds: u64,
    pub dialect: SqlDialect,
    pub min_platform_version: String,
    pub sqlite_path: PathBuf,
    pub bind_addr: SocketAddr,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: "SNOWFLAKE_EXAMPLE".to_string(),
            schema: "FORECASTING".to_string(),
            warehouse: "SFE_SP_WH".to_string(),
            feature_store: "SFE_FEATURE_STORE".to_string(),
            entity_name: "SFE_TRACK".to_string(),
            entity_join_key: "ISRC".to_string(),
            feature_view_name: "SFE_STREAM_FEATURES".to_string(),
            feature_view_version: "v1".to_string(),
            model_name: "SFE_STREAM_FORECAST_MODEL".to_string(),
            model_version: "v1".to_string(),
            cache_ttl_seconds: DEFAULT_TTL_SECONDS,
            dialect: SqlDialect::Sqlite,
            min_platform_version: "3.31.0".to_string(),
            sqlite_path: PathBuf::from("data/forecast_ops.sqlite"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

impl AppConfig {
    /// Unset, blank or unparseable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        set_text(&mut config.database, "FOPS_DATABASE");
        set_text(&mut config.schema, "FOPS_SCHEMA");
        set_text(&mut config.warehouse, "FOPS_WAREHOUSE");
        set_text(&mut config.feature_store, "FOPS_FEATURE_STORE");
        set_text(&mut config.entity_name, "FOPS_ENTITY_NAME");
        set_text(&mut config.entity_join_key, "FOPS_ENTITY_JOIN_KEY");
        set_text(&mut config.feature_view_name, "FOPS_FEATURE_VIEW");
        set_text(&mut config.feature_view_version, "FOPS_FEATURE_VIEW_VERSION");
        set_text(&mut config.model_name, "FOPS_MODEL_NAME");
        set_text(&mut config.model_version, "FOPS_MODEL_VERSION");
        set_text(&mut config.min_platform_version, "FOPS_MIN_PLATFORM_VERSION");

        if let Some(ttl) = read_trimmed("FOPS_CACHE_TTL_SECONDS").and_then(|raw| raw.parse().ok()) {
            if ttl > 0 {
                config.cache_ttl_seconds = ttl;
            }
        }
        if let Some(dialect) = read_trimmed("FOPS_SQL_DIALECT").and_then(|raw| raw.parse().ok()) {
            config.dialect = dialect;
        }
        if let Some(path) = read_trimmed("FOPS_SQLITE_PATH") {
            config.sqlite_path = PathBuf::from(path);
        }
        if let Some(addr) = read_trimmed("FOPS_DASHBOARD_ADDR").and_then(|raw| raw.parse().ok()) {
            config.bind_addr = addr;
        }

        config
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn query_target(&self) -> QueryTarget {
        QueryTarget {
            dialect: self.dialect,
            database: self.database.clone(),
            schema: self.schema.clone(),
            warehouse: self.warehouse.clone(),
        }
    }

    pub fn entity(&self) -> Entity {
        Entity::new(self.entity_name.clone(), self.entity_join_key.clone())
    }

    pub fn setup_plan(&self) -> SetupPlan {
        SetupPlan {
            min_platform_version: self.min_platform_version.clone(),
            target: self.query_target(),
            entity: self.entity(),
            feature_view_name: self.feature_view_name.clone(),
            feature_view_version: self.feature_view_version.clone(),
            model_name: self.model_name.clone(),
            model_version: self.model_version.clone(),
        }
    }
}

fn read_trimmed(key: &str) -> Option<String> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn set_text(slot: &mut String, key: &str) {
    if let Some(value) = read_trimmed(key) {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::test_env::with_env_vars;

    const KEYS: [&str; 5] = [
        "FOPS_WAREHOUSE",
        "FOPS_CACHE_TTL_SECONDS",
        "FOPS_SQL_DIALECT",
        "FOPS_DASHBOARD_ADDR",
        "FOPS_DATABASE",
    ];

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        KEYS.iter().map(|key| (*key, None)).collect()
    }

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(&cleared(), AppConfig::from_env);
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn reads_overrides_from_env() {
        let cfg = with_env_vars(
            &[
                ("FOPS_WAREHOUSE", Some(" FORECAST_WH ")),
                ("FOPS_CACHE_TTL_SECONDS", Some("60")),
                ("FOPS_SQL_DIALECT", Some("snowflake")),
                ("FOPS_DASHBOARD_ADDR", Some("0.0.0.0:9000")),
                ("FOPS_DATABASE", None),
            ],
            AppConfig::from_env,
        );

        assert_eq!(cfg.warehouse, "FORECAST_WH");
        assert_eq!(cfg.cache_ttl_seconds, 60);
        assert_eq!(cfg.dialect, SqlDialect::Snowflake);
        assert_eq!(cfg.bind_addr.port(), 9000);
        assert_eq!(cfg.query_target().warehouse, "FORECAST_WH");
        assert_eq!(cfg.database, "SNOWFLAKE_EXAMPLE");
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let cfg = with_env_vars(
            &[
                ("FOPS_WAREHOUSE", Some("   ")),
                ("FOPS_CACHE_TTL_SECONDS", Some("0")),
                ("FOPS_SQL_DIALECT", Some("oracle")),
                ("FOPS_DASHBOARD_ADDR", Some("not-an-addr")),
                ("FOPS_DATABASE", None),
            ],
            AppConfig::from_env,
        );

        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn setup_plan_carries_entity_and_view() {
        let plan = AppConfig::default().setup_plan();
        assert_eq!(plan.entity, Entity::new("SFE_TRACK", "ISRC"));
        assert_eq!(plan.feature_view_name, "SFE_STREAM_FEATURES");
        assert_eq!(plan.feature_view_version, "v1");
        assert_eq!(plan.model_name, "SFE_STREAM_FORECAST_MODEL");
    }
}
