use forecast_ops::{
    init_logging, log_app_start, log_store_opened, logging_config_from_env, run_setup, AppConfig,
    SqlDialect, SqliteFeatureStore, SqliteModelRegistry, SqliteQueryExecutor,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let config = AppConfig::from_env();
    log_app_start("feature_setup", &logging_cfg, &config);

    if config.dialect != SqlDialect::Sqlite {
        return Err("feature_setup only bundles the sqlite adapters; set FOPS_SQL_DIALECT=sqlite".into());
    }

    let executor = SqliteQueryExecutor::open(&config.sqlite_path)?;
    let store = SqliteFeatureStore::open(&config.sqlite_path)?;
    let models = SqliteModelRegistry::open(&config.sqlite_path)?;
    log_store_opened("feature_setup", &config.feature_store, Some(&config.sqlite_path));

    let report = run_setup(&executor, &store, &models, &config.setup_plan())?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
