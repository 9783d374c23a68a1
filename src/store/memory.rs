//! In-memory store backend

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use crate::clock::version_order;
use crate::error::{PipelineError, Result};
use crate::store::{EventStore, FeatureStore, ModelRegistry, PredictionStore};
use crate::types::{DailyFeature, FeatureImportance, Model, Prediction, RawEvent, TrainingRun};

type PredictionKey = (String, String, NaiveDate);

#[derive(Default)]
struct Registry {
    models: HashMap<String, Model>,
    importances: HashMap<String, Vec<FeatureImportance>>,
}

/// A store backed by process memory, implementing every store trait
#[derive(Default)]
pub struct InMemoryStore {
    events: RwLock<Vec<RawEvent>>,
    features: RwLock<BTreeMap<(String, NaiveDate), DailyFeature>>,
    registry: RwLock<Registry>,
    predictions: RwLock<BTreeMap<PredictionKey, Prediction>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append events to the log
    pub async fn append_events(&self, events: impl IntoIterator<Item = RawEvent>) {
        self.events.write().await.extend(events);
    }

    /// Number of models in the registry
    pub async fn model_count(&self) -> usize {
        self.registry.read().await.models.len()
    }

    /// Number of stored predictions across all models
    pub async fn prediction_count(&self) -> usize {
        self.predictions.read().await.len()
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn events_for_user(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>> {
        let guard = self.events.read().await;
        let mut events: Vec<RawEvent> = guard
            .iter()
            .filter(|e| e.user_id == user_id && e.timestamp >= start && e.timestamp <= end)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn users_with_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let guard = self.events.read().await;
        let users: BTreeSet<String> = guard
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .map(|e| e.user_id.clone())
            .collect();
        Ok(users.into_iter().collect())
    }
}

#[async_trait]
impl FeatureStore for InMemoryStore {
    async fn upsert_daily_feature(&self, row: &DailyFeature) -> Result<()> {
        self.features
            .write()
            .await
            .insert((row.user_id.clone(), row.day), row.clone());
        Ok(())
    }

    async fn daily_features(&self) -> Result<Vec<DailyFeature>> {
        Ok(self.features.read().await.values().cloned().collect())
    }

    async fn daily_features_since(&self, since: NaiveDate) -> Result<Vec<DailyFeature>> {
        Ok(self
            .features
            .read()
            .await
            .values()
            .filter(|row| row.day >= since)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ModelRegistry for InMemoryStore {
    async fn commit_run(&self, run: &TrainingRun) -> Result<()> {
        let version = &run.model.model_version;

        // Lock order: registry, then predictions
        let mut registry = self.registry.write().await;
        let mut predictions = self.predictions.write().await;

        if registry.models.contains_key(version) {
            return Err(PipelineError::VersionConflict(version.clone()));
        }
        if let Some(stray) = run
            .importances
            .iter()
            .map(|i| &i.model_version)
            .chain(run.predictions.iter().map(|p| &p.model_version))
            .find(|v| *v != version)
        {
            return Err(PipelineError::Repository(format!(
                "training run for {version} contains a row for {stray}"
            )));
        }

        registry.models.insert(version.clone(), run.model.clone());
        registry
            .importances
            .insert(version.clone(), run.importances.clone());
        for p in &run.predictions {
            predictions.insert(prediction_key(p), p.clone());
        }
        Ok(())
    }

    async fn model(&self, model_version: &str) -> Result<Option<Model>> {
        Ok(self.registry.read().await.models.get(model_version).cloned())
    }

    async fn latest_model(&self) -> Result<Option<Model>> {
        let registry = self.registry.read().await;
        Ok(registry
            .models
            .values()
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| {
                        version_order(&a.model_version).cmp(&version_order(&b.model_version))
                    })
            })
            .cloned())
    }

    async fn importances(&self, model_version: &str) -> Result<Vec<FeatureImportance>> {
        Ok(self
            .registry
            .read()
            .await
            .importances
            .get(model_version)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PredictionStore for InMemoryStore {
    async fn upsert_predictions(&self, predictions: &[Prediction]) -> Result<()> {
        let mut guard = self.predictions.write().await;
        for p in predictions {
            guard.insert(prediction_key(p), p.clone());
        }
        Ok(())
    }

    async fn predictions(&self, model_version: &str) -> Result<Vec<Prediction>> {
        Ok(self
            .predictions
            .read()
            .await
            .values()
            .filter(|p| p.model_version == model_version)
            .cloned()
            .collect())
    }
}

fn prediction_key(p: &Prediction) -> PredictionKey {
    (p.model_version.clone(), p.user_id.clone(), p.day)
}
