use forecast_ops::{
    run_setup, AppConfig, CellValue, DeleteOutcome, Entity, ExecutorError, FeatureStoreService,
    FeatureView, FeatureViewRegistry, InMemoryFeatureStore, ModelArtifact, ModelRegistry,
    ModelRegistryError, QueryExecutor, RegisterOutcome, RegistrationState, RegistryError,
    SetupError, SetupPlan, SqliteFeatureStore, SqliteModelRegistry, SqliteQueryExecutor, Tabular,
    AVG_STREAMS_TO_DATE, STREAMS_LAST_4_WEEKS,
};
use rusqlite::{params, Connection};
use std::sync::Mutex;
use tempfile::NamedTempFile;

fn plan() -> SetupPlan {
    AppConfig::default().setup_plan()
}

fn seed_source(path: &std::path::Path) {
    let conn = Connection::open(path).expect("open seed connection");
    let weeks = [
        ("2024-01-07", 10.0),
        ("2024-01-14", 20.0),
        ("2024-01-21", 30.0),
        ("2024-01-28", 40.0),
        ("2024-02-04", 50.0),
    ];
    for (week, streams) in weeks.iter().rev() {
        conn.execute(
            "INSERT INTO forecast_input_global (isrc, region, week_ending, streams) VALUES (?1, 'Global', ?2, ?3)",
            params!["USRC17607839", week, streams],
        )
        .expect("insert global row");
    }
    conn.execute(
        "INSERT INTO forecast_input_global (isrc, region, week_ending, streams) VALUES ('USRC17607839', 'US', '2024-01-07', 999)",
        [],
    )
    .expect("insert regional row");
}

#[test]
fn setup_against_sqlite_registers_view_and_model() {
    let db = NamedTempFile::new().expect("temp db");
    let executor = SqliteQueryExecutor::open(db.path()).expect("executor");
    seed_source(db.path());
    let store = SqliteFeatureStore::open(db.path()).expect("feature store");
    let models = SqliteModelRegistry::open(db.path()).expect("model registry");
    let plan = plan();

    let report = run_setup(&executor, &store, &models, &plan).expect("setup succeeds");

    assert_eq!(report.row_count, 5);
    assert!(!report.replaced_existing_view);
    assert_eq!(report.feature_view, "SFE_STREAM_FEATURES");

    let rows = store.rows("SFE_STREAM_FEATURES", "v1").expect("rows");
    let avg: Vec<Option<f64>> = rows
        .iter()
        .map(|row| row.values.get(AVG_STREAMS_TO_DATE).copied().flatten())
        .collect();
    let last4: Vec<Option<f64>> = rows
        .iter()
        .map(|row| row.values.get(STREAMS_LAST_4_WEEKS).copied().flatten())
        .collect();
    assert_eq!(
        avg,
        vec![Some(10.0), Some(15.0), Some(20.0), Some(25.0), Some(30.0)]
    );
    assert_eq!(
        last4,
        vec![Some(10.0), Some(30.0), Some(60.0), Some(100.0), Some(140.0)]
    );

    let model = models
        .get_model("SFE_STREAM_FORECAST_MODEL", "v1")
        .expect("model lookup")
        .expect("model logged");
    assert!((model.model.slope - 1.0).abs() < 1e-12);
    assert_eq!(model.sample_input, vec![vec![1.0], vec![2.0], vec![3.0]]);
}

#[test]
fn rerunning_setup_converges() {
    let db = NamedTempFile::new().expect("temp db");
    let executor = SqliteQueryExecutor::open(db.path()).expect("executor");
    seed_source(db.path());
    let store = SqliteFeatureStore::open(db.path()).expect("feature store");
    let models = SqliteModelRegistry::open(db.path()).expect("model registry");
    let plan = plan();

    let first = run_setup(&executor, &store, &models, &plan).expect("first run");
    let second = run_setup(&executor, &store, &models, &plan).expect("second run");

    assert!(second.replaced_existing_view);
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(
        store.rows("SFE_STREAM_FEATURES", "v1").expect("rows").len(),
        5
    );
    let record = store
        .get_feature_view("SFE_STREAM_FEATURES", "v1")
        .expect("lookup")
        .expect("registered");
    assert_eq!(record.row_count, 5);
    assert_eq!(record.fingerprint, second.fingerprint);
}

#[test]
fn setup_honours_a_custom_join_key() {
    let db = NamedTempFile::new().expect("temp db");
    let executor = SqliteQueryExecutor::open(db.path()).expect("executor");
    seed_source(db.path());
    let store = SqliteFeatureStore::open(db.path()).expect("feature store");
    let models = SqliteModelRegistry::open(db.path()).expect("model registry");
    let config = AppConfig {
        entity_join_key: "TRACK_ID".to_string(),
        ..AppConfig::default()
    };
    let plan = config.setup_plan();

    let report = run_setup(&executor, &store, &models, &plan).expect("setup succeeds");

    assert_eq!(report.row_count, 5);
    let record = store
        .get_feature_view("SFE_STREAM_FEATURES", "v1")
        .expect("lookup")
        .expect("registered");
    assert_eq!(record.spec.entities[0].join_keys, vec!["TRACK_ID".to_string()]);
    let rows = store.rows("SFE_STREAM_FEATURES", "v1").expect("rows");
    assert!(rows.iter().all(|row| row.entity_id == "USRC17607839"));
}

struct StaticExecutor {
    version: &'static str,
    executed: Mutex<Vec<String>>,
}

impl QueryExecutor for StaticExecutor {
    fn execute(&self, sql: &str) -> Result<Tabular, ExecutorError> {
        self.executed.lock().expect("lock").push(sql.to_string());
        Ok(Tabular {
            columns: vec![
                "ISRC".to_string(),
                "WEEK_ENDING".to_string(),
                "STREAMS".to_string(),
            ],
            rows: vec![vec![
                CellValue::Text("T1".to_string()),
                CellValue::Text("2024-01-07".to_string()),
                CellValue::Real(5.0),
            ]],
        })
    }

    fn platform_version(&self) -> Result<String, ExecutorError> {
        Ok(self.version.to_string())
    }
}

#[derive(Default)]
struct RecordingModels {
    logged: Mutex<Vec<ModelArtifact>>,
}

impl ModelRegistry for RecordingModels {
    fn log_model(&self, artifact: &ModelArtifact) -> Result<(), ModelRegistryError> {
        self.logged.lock().expect("lock").push(artifact.clone());
        Ok(())
    }

    fn drop_model(&self, name: &str) -> Result<(), ModelRegistryError> {
        Err(ModelRegistryError::NotFound(name.to_string()))
    }

    fn get_model(
        &self,
        _name: &str,
        _version: &str,
    ) -> Result<Option<ModelArtifact>, ModelRegistryError> {
        Ok(None)
    }
}

#[test]
fn old_platform_fails_before_any_work() {
    let executor = StaticExecutor {
        version: "3.20.1",
        executed: Mutex::new(Vec::new()),
    };
    let store = InMemoryFeatureStore::new();
    let models = RecordingModels::default();

    let err = run_setup(&executor, &store, &models, &plan()).expect_err("version gate");

    assert!(matches!(err, SetupError::IncompatibleVersion { .. }));
    assert!(executor.executed.lock().expect("lock").is_empty());
    assert!(models.logged.lock().expect("lock").is_empty());
    assert_eq!(
        FeatureViewRegistry::new(&store)
            .state("SFE_STREAM_FEATURES", "v1")
            .expect("state"),
        RegistrationState::Absent
    );
}

#[test]
fn setup_with_in_memory_store_tolerates_absent_model() {
    let executor = StaticExecutor {
        version: "3.45.1",
        executed: Mutex::new(Vec::new()),
    };
    let store = InMemoryFeatureStore::new();
    let models = RecordingModels::default();

    let report = run_setup(&executor, &store, &models, &plan()).expect("setup");

    assert_eq!(report.row_count, 1);
    assert_eq!(models.logged.lock().expect("lock").len(), 1);
    assert_eq!(
        store
            .rows("SFE_STREAM_FEATURES", "v1")
            .expect("rows")[0]
            .values
            .get(STREAMS_LAST_4_WEEKS),
        Some(&Some(5.0))
    );
}

#[test]
fn registry_state_machine_over_sqlite() {
    let db = NamedTempFile::new().expect("temp db");
    let store = SqliteFeatureStore::open(db.path()).expect("feature store");
    let registry = FeatureViewRegistry::new(&store);
    let plan = plan();

    let spec = forecast_ops::stream_feature_view_spec(&plan);
    let view = FeatureView {
        spec: spec.clone(),
        rows: Vec::new(),
    };

    registry
        .register_entity(&Entity::new("SFE_TRACK", "ISRC"))
        .expect("entity");
    registry
        .register_entity(&Entity::new("SFE_TRACK", "ISRC"))
        .expect("entity is idempotent");

    assert_eq!(
        registry.delete(&spec.name, &spec.version).expect("delete"),
        DeleteOutcome::AlreadyAbsent
    );
    assert_eq!(
        registry.register(&view).expect("register"),
        RegisterOutcome::Registered
    );
    assert_eq!(
        registry.register(&view).expect("register again"),
        RegisterOutcome::AlreadyRegistered
    );

    let mut changed = view.clone();
    changed.spec.description = Some("weekly stream aggregates".to_string());
    assert!(matches!(
        registry.register(&changed),
        Err(RegistryError::DefinitionConflict { .. })
    ));

    assert_eq!(
        registry.replace(&changed).expect("replace"),
        RegisterOutcome::Registered
    );
    assert_eq!(
        registry.delete(&spec.name, &spec.version).expect("delete"),
        DeleteOutcome::Deleted
    );
    assert_eq!(
        registry.state(&spec.name, &spec.version).expect("state"),
        RegistrationState::Absent
    );
}
