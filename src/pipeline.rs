//! Pipeline orchestration
//!
//! This module provides the public API for Mood Flux. It wires the stores,
//! clock and configuration into the batch stages:
//!
//! 1. FeatureAggregator - Raw events → daily feature rows
//! 2. ModelTrainer - Complete rows → ridge model with a fresh version
//! 3. ImportanceCalculator - Coefficients → normalized importances
//! 4. Predictor - Trailing window → predictions
//! 5. ModelRegistry - Model, importances and predictions committed together
//!
//! The flow is fail-fast: any error aborts the remaining stages, and nothing
//! from a failed training run reaches the registry.

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock, VersionGenerator};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::features::FeatureAggregator;
use crate::importance::ImportanceCalculator;
use crate::predictor::Predictor;
use crate::store::{with_timeout, EventStore, FeatureStore, ModelRegistry, PredictionStore};
use crate::trainer::ModelTrainer;
use crate::types::{AggregationReport, Model, ScoreReport, TrainReport, TrainingRun};

static SYSTEM_CLOCK: SystemClock = SystemClock;

/// Versions tried for one training run before a conflict is returned
const MAX_COMMIT_ATTEMPTS: usize = 64;

/// Batch pipeline over a set of stores
pub struct MoodPipeline<'a> {
    events: &'a dyn EventStore,
    features: &'a dyn FeatureStore,
    registry: &'a dyn ModelRegistry,
    predictions: &'a dyn PredictionStore,
    clock: &'a dyn Clock,
    versions: VersionGenerator,
    config: PipelineConfig,
}

impl<'a> MoodPipeline<'a> {
    /// Create a pipeline over one store that implements every interface
    pub fn new<S>(store: &'a S, config: PipelineConfig) -> Result<Self>
    where
        S: EventStore + FeatureStore + ModelRegistry + PredictionStore,
    {
        Self::with_stores(store, store, store, store, config)
    }

    /// Create a pipeline over separate stores
    pub fn with_stores(
        events: &'a dyn EventStore,
        features: &'a dyn FeatureStore,
        registry: &'a dyn ModelRegistry,
        predictions: &'a dyn PredictionStore,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            events,
            features,
            registry,
            predictions,
            clock: &SYSTEM_CLOCK,
            versions: VersionGenerator::new(),
            config,
        })
    }

    /// Replace the wall clock (for deterministic versions and windows)
    pub fn with_clock(mut self, clock: &'a dyn Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Aggregate and store daily features for every user active on `day`
    pub async fn aggregate_day(&self, day: NaiveDate) -> Result<AggregationReport> {
        FeatureAggregator::new(self.events, self.features, &self.config)
            .aggregate_all_users_for_day(day)
            .await
    }

    /// Train a model on all stored daily features, score the trailing window
    /// and commit the run.
    pub async fn train(&self) -> Result<TrainReport> {
        let rows = with_timeout(
            "daily_features",
            self.config.store_timeout,
            self.features.daily_features(),
        )
        .await?;

        let trained = ModelTrainer::new(self.clock, &self.versions).train(&rows, self.config.lambda)?;
        let model = trained.model;

        let importances = ImportanceCalculator::compute(&model);

        let window_start = self.window_start()?;
        let predictions = self.predictor().predict_window(&model, &rows, window_start);

        let train_rows = trained.train_rows;
        let scored = predictions.len();
        let mut run = TrainingRun {
            model,
            importances,
            predictions,
        };
        self.commit(&mut run).await?;

        let report = TrainReport {
            model_version: run.model.model_version,
            train_rows,
            train_mae: run.model.train_mae,
        };
        info!(
            model_version = %report.model_version,
            train_rows = report.train_rows,
            predictions = scored,
            %window_start,
            "training run committed"
        );
        Ok(report)
    }

    /// Score the trailing window with a stored model (latest if `None`) and
    /// upsert the predictions.
    pub async fn score(&self, model_version: Option<&str>) -> Result<ScoreReport> {
        let model = self.load_model(model_version).await?;

        let window_start = self.window_start()?;
        let rows = with_timeout(
            "daily_features_since",
            self.config.store_timeout,
            self.features.daily_features_since(window_start),
        )
        .await?;

        let predictions = self.predictor().predict_window(&model, &rows, window_start);
        with_timeout(
            "upsert_predictions",
            self.config.store_timeout,
            self.predictions.upsert_predictions(&predictions),
        )
        .await?;

        info!(
            model_version = %model.model_version,
            predictions = predictions.len(),
            %window_start,
            "window scored"
        );
        Ok(ScoreReport {
            model_version: model.model_version,
            window_start,
            scored_rows: predictions.len(),
        })
    }

    /// Aggregate `day`, then train on everything stored
    pub async fn run(&self, day: NaiveDate) -> Result<TrainReport> {
        self.aggregate_day(day).await?;
        self.train().await
    }

    /// Commit a training run, moving it to the next free version when another
    /// run (possibly another process) already took its version.
    async fn commit(&self, run: &mut TrainingRun) -> Result<()> {
        let mut attempt = 1;
        loop {
            let committed = with_timeout(
                "commit_run",
                self.config.store_timeout,
                self.registry.commit_run(run),
            )
            .await;
            match committed {
                Err(PipelineError::VersionConflict(taken)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    let next = self.versions.next(run.model.created_at);
                    warn!(%taken, %next, "model version taken, reassigning");
                    run.reassign_version(&next);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn load_model(&self, model_version: Option<&str>) -> Result<Model> {
        let found = match model_version {
            Some(version) => {
                with_timeout("model", self.config.store_timeout, self.registry.model(version))
                    .await?
            }
            None => {
                with_timeout(
                    "latest_model",
                    self.config.store_timeout,
                    self.registry.latest_model(),
                )
                .await?
            }
        };
        found.ok_or_else(|| {
            PipelineError::ModelNotFound(model_version.unwrap_or("latest").to_string())
        })
    }

    fn window_start(&self) -> Result<NaiveDate> {
        Predictor::window_start(self.clock.today(), self.config.window_days)
    }

    fn predictor(&self) -> Predictor {
        Predictor::new(self.config.min_features_present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::InMemoryStore;
    use crate::types::{DailyFeature, FeatureName};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, d).unwrap()
    }

    fn row(user: &str, d: u32, value: f64, label: i32) -> DailyFeature {
        let mut row = DailyFeature::empty(user, day(d));
        for (i, f) in FeatureName::ALL.iter().enumerate() {
            row.set(*f, Some(value + i as f64 * 0.1));
        }
        row.mood_label = Some(label);
        row
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        for (d, v, l) in [(1, 1.0, 2), (5, 2.0, 3), (18, 3.0, 4), (20, 4.0, 5)] {
            store.upsert_daily_feature(&row("u1", d, v, l)).await.unwrap();
        }
        store
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = InMemoryStore::new();
        let config = PipelineConfig {
            aggregation_workers: 0,
            ..Default::default()
        };
        assert!(MoodPipeline::new(&store, config).is_err());
    }

    #[tokio::test]
    async fn test_train_commits_full_run() {
        let store = seeded().await;
        let clock = FixedClock::at_day(day(20));
        let pipeline = MoodPipeline::new(&store, PipelineConfig::default())
            .unwrap()
            .with_clock(&clock);

        let report = pipeline.train().await.unwrap();
        assert_eq!(report.train_rows, 4);

        let model = store.model(&report.model_version).await.unwrap().unwrap();
        assert_eq!(model.train_mae, report.train_mae);
        assert_eq!(store.importances(&report.model_version).await.unwrap().len(), 12);

        // Window is 14 days back from the 20th: only the 18th and 20th
        let predictions = store.predictions(&report.model_version).await.unwrap();
        assert_eq!(predictions.len(), 2);
    }

    #[test]
    fn test_out_of_range_window_rejected() {
        let store = InMemoryStore::new();
        let config = PipelineConfig {
            window_days: 1_000_000_000,
            ..Default::default()
        };
        assert!(matches!(
            MoodPipeline::new(&store, config),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_separate_pipelines_same_second_commit_distinct_versions() {
        let store = seeded().await;
        let clock = FixedClock::at_day(day(20));

        // Separate pipelines share no version state, like separate processes
        let mut versions = Vec::new();
        for _ in 0..3 {
            let pipeline = MoodPipeline::new(&store, PipelineConfig::default())
                .unwrap()
                .with_clock(&clock);
            versions.push(pipeline.train().await.unwrap().model_version);
        }

        assert_eq!(
            versions,
            vec![
                "20240820T120000Z".to_string(),
                "20240820T120000Z.1".to_string(),
                "20240820T120000Z.2".to_string(),
            ]
        );
        assert_eq!(store.model_count().await, 3);
        for version in &versions {
            assert_eq!(store.importances(version).await.unwrap().len(), 12);
            assert_eq!(store.predictions(version).await.unwrap().len(), 2);
        }
        assert_eq!(
            store.latest_model().await.unwrap().unwrap().model_version,
            versions[2]
        );
    }

    #[tokio::test]
    async fn test_failed_training_writes_nothing() {
        let store = InMemoryStore::new();
        store.upsert_daily_feature(&row("u1", 1, 1.0, 3)).await.unwrap();
        let pipeline = MoodPipeline::new(&store, PipelineConfig::default()).unwrap();

        let err = pipeline.train().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientTrainingData { found: 1 }
        ));
        assert_eq!(store.model_count().await, 0);
        assert_eq!(store.prediction_count().await, 0);
    }

    #[tokio::test]
    async fn test_score_requires_a_model() {
        let store = seeded().await;
        let pipeline = MoodPipeline::new(&store, PipelineConfig::default()).unwrap();
        assert!(matches!(
            pipeline.score(None).await,
            Err(PipelineError::ModelNotFound(_))
        ));
        assert!(matches!(
            pipeline.score(Some("nope")).await,
            Err(PipelineError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_score_uses_latest_model() {
        let store = seeded().await;
        let clock = FixedClock::at_day(day(20));
        let pipeline = MoodPipeline::new(&store, PipelineConfig::default())
            .unwrap()
            .with_clock(&clock);

        let trained = pipeline.train().await.unwrap();
        let scored = pipeline.score(None).await.unwrap();
        assert_eq!(scored.model_version, trained.model_version);
        assert_eq!(scored.window_start, day(6));
        assert_eq!(scored.scored_rows, 2);
        assert_eq!(store.prediction_count().await, 2);
    }
}
