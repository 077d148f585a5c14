use std::sync::Arc;

use forecast_ops::{
    dashboard_router, init_logging, log_app_bind, log_app_start, log_store_opened,
    logging_config_from_env, AppConfig, DashboardService, DashboardSource,
    RecommendationRuleEngine, SqlDialect, SqliteQueryExecutor, TelemetryClient,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let config = AppConfig::from_env();
    log_app_start("dashboard_server", &logging_cfg, &config);

    if config.dialect != SqlDialect::Sqlite {
        return Err("dashboard_server only bundles the sqlite executor; set FOPS_SQL_DIALECT=sqlite".into());
    }

    let executor = Arc::new(SqliteQueryExecutor::open(&config.sqlite_path)?);
    log_store_opened("dashboard_server", "telemetry", Some(&config.sqlite_path));

    let telemetry = TelemetryClient::new(executor, config.query_target(), config.cache_ttl());
    let source: Arc<dyn DashboardSource> = Arc::new(DashboardService::new(
        telemetry,
        RecommendationRuleEngine::default(),
    ));
    let app = dashboard_router(source);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
