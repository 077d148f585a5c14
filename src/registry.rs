//! Versioned feature view registration against a feature-store service.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::series::TimeSeriesPoint;
use crate::window::FeatureExpr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub join_keys: Vec<String>,
}

impl Entity {
    pub fn new(name: impl Into<String>, join_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            join_keys: vec![join_key.into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureViewSpec {
    pub name: String,
    pub version: String,
    pub entities: Vec<Entity>,
    pub features: Vec<FeatureExpr>,
    pub timestamp_col: String,
    pub description: Option<String>,
}

impl FeatureViewSpec {
    /// Content hash of the definition. Entity order does not matter; feature
    /// order does, since it fixes the column order of the materialized view.
    pub fn fingerprint(&self) -> String {
        let mut entities: Vec<&Entity> = self.entities.iter().collect();
        entities.sort_by(|a, b| a.name.cmp(&b.name));

        let mut hasher = Sha256::new();
        hasher.update(format!("name:{};version:{};", self.name, self.version));
        hasher.update("entities:");
        for entity in entities {
            hasher.update(format!("{}[{}],", entity.name, entity.join_keys.join("|")));
        }
        hasher.update(";features:");
        for feature in &self.features {
            hasher.update(format!(
                "{}={}({}) over {};",
                feature.output,
                feature.aggregate.as_str(),
                feature.input,
                feature.window
            ));
        }
        hasher.update(format!("timestamp_col:{};", self.timestamp_col));
        if let Some(description) = &self.description {
            hasher.update(format!("description:{description};"));
        }
        hex::encode(hasher.finalize())
    }
}

/// A definition together with its materialized rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureView {
    pub spec: FeatureViewSpec,
    pub rows: Vec<TimeSeriesPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureViewRecord {
    pub spec: FeatureViewSpec,
    pub fingerprint: String,
    pub row_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureStoreError {
    #[error("feature view {name}/{version} not found")]
    NotFound { name: String, version: String },
    #[error("feature view {name}/{version} already exists")]
    AlreadyExists { name: String, version: String },
    #[error("entity {0} is already registered with a different definition")]
    EntityConflict(String),
    #[error("feature store service error: {0}")]
    Service(String),
}

pub trait FeatureStoreService: Send + Sync {
    fn register_entity(&self, entity: &Entity) -> Result<(), FeatureStoreError>;
    fn register_feature_view(&self, view: &FeatureView) -> Result<(), FeatureStoreError>;
    /// Fails with [`FeatureStoreError::NotFound`] when the version does not exist.
    fn delete_feature_view(&self, name: &str, version: &str) -> Result<(), FeatureStoreError>;
    fn get_feature_view(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<FeatureViewRecord>, FeatureStoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Absent,
    Registered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    AlreadyRegistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(
        "feature view {name}/{version} is registered with fingerprint {registered}, refusing {requested}"
    )]
    DefinitionConflict {
        name: String,
        version: String,
        registered: String,
        requested: String,
    },
    #[error(transparent)]
    Store(#[from] FeatureStoreError),
}

pub struct FeatureViewRegistry<'a> {
    store: &'a dyn FeatureStoreService,
}

impl<'a> FeatureViewRegistry<'a> {
    pub fn new(store: &'a dyn FeatureStoreService) -> Self {
        Self { store }
    }

    pub fn register_entity(&self, entity: &Entity) -> Result<(), RegistryError> {
        self.store.register_entity(entity)?;
        info!(
            component = "registry",
            event = "registry.entity.registered",
            entity = %entity.name,
            join_keys = ?entity.join_keys
        );
        Ok(())
    }

    pub fn state(&self, name: &str, version: &str) -> Result<RegistrationState, RegistryError> {
        Ok(match self.store.get_feature_view(name, version)? {
            Some(_) => RegistrationState::Registered,
            None => RegistrationState::Absent,
        })
    }

    pub fn register(&self, view: &FeatureView) -> Result<RegisterOutcome, RegistryError> {
        let spec = &view.spec;
        let requested = spec.fingerprint();

        if let Some(existing) = self.store.get_feature_view(&spec.name, &spec.version)? {
            if existing.fingerprint == requested {
                info!(
                    component = "registry",
                    event = "registry.register.noop",
                    feature_view = %spec.name,
                    version = %spec.version,
                    fingerprint = %requested
                );
                return Ok(RegisterOutcome::AlreadyRegistered);
            }
            return Err(RegistryError::DefinitionConflict {
                name: spec.name.clone(),
                version: spec.version.clone(),
                registered: existing.fingerprint,
                requested,
            });
        }

        self.store.register_feature_view(view)?;
        info!(
            component = "registry",
            event = "registry.register.created",
            feature_view = %spec.name,
            version = %spec.version,
            fingerprint = %requested,
            rows = view.rows.len()
        );
        Ok(RegisterOutcome::Registered)
    }

    pub fn delete(&self, name: &str, version: &str) -> Result<DeleteOutcome, RegistryError> {
        match self.store.delete_feature_view(name, version) {
            Ok(()) => {
                info!(
                    component = "registry",
                    event = "registry.delete.deleted",
                    feature_view = name,
                    version
                );
                Ok(DeleteOutcome::Deleted)
            }
            Err(FeatureStoreError::NotFound { .. }) => {
                info!(
                    component = "registry",
                    event = "registry.delete.absent",
                    feature_view = name,
                    version
                );
                Ok(DeleteOutcome::AlreadyAbsent)
            }
            Err(err) => {
                warn!(
                    component = "registry",
                    event = "registry.delete.error",
                    feature_view = name,
                    version,
                    error = %err
                );
                Err(err.into())
            }
        }
    }

    /// Delete-then-register so repeated setup runs converge on `view`.
    pub fn replace(&self, view: &FeatureView) -> Result<RegisterOutcome, RegistryError> {
        self.delete(&view.spec.name, &view.spec.version)?;
        self.register(view)
    }
}

type ViewKey = (String, String);

#[derive(Default)]
pub struct InMemoryFeatureStore {
    entities: RwLock<HashMap<String, Entity>>,
    views: RwLock<HashMap<ViewKey, FeatureView>>,
}

impl InMemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, name: &str, version: &str) -> Option<Vec<TimeSeriesPoint>> {
        self.views
            .read()
            .ok()?
            .get(&(name.to_string(), version.to_string()))
            .map(|view| view.rows.clone())
    }
}

fn poisoned() -> FeatureStoreError {
    FeatureStoreError::Service("feature store lock poisoned".to_string())
}

impl FeatureStoreService for InMemoryFeatureStore {
    fn register_entity(&self, entity: &Entity) -> Result<(), FeatureStoreError> {
        let mut entities = self.entities.write().map_err(|_| poisoned())?;
        match entities.get(&entity.name) {
            Some(existing) if existing == entity => Ok(()),
            Some(_) => Err(FeatureStoreError::EntityConflict(entity.name.clone())),
            None => {
                entities.insert(entity.name.clone(), entity.clone());
                Ok(())
            }
        }
    }

    fn register_feature_view(&self, view: &FeatureView) -> Result<(), FeatureStoreError> {
        let mut views = self.views.write().map_err(|_| poisoned())?;
        let key = (view.spec.name.clone(), view.spec.version.clone());
        if views.contains_key(&key) {
            return Err(FeatureStoreError::AlreadyExists {
                name: key.0,
                version: key.1,
            });
        }
        views.insert(key, view.clone());
        Ok(())
    }

    fn delete_feature_view(&self, name: &str, version: &str) -> Result<(), FeatureStoreError> {
        let mut views = self.views.write().map_err(|_| poisoned())?;
        views
            .remove(&(name.to_string(), version.to_string()))
            .map(|_| ())
            .ok_or_else(|| FeatureStoreError::NotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    fn get_feature_view(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<FeatureViewRecord>, FeatureStoreError> {
        let views = self.views.read().map_err(|_| poisoned())?;
        Ok(views
            .get(&(name.to_string(), version.to_string()))
            .map(|view| FeatureViewRecord {
                spec: view.spec.clone(),
                fingerprint: view.spec.fingerprint(),
                row_count: view.rows.len(),
            }))
    }
}
