//! Store interfaces
//!
//! The pipeline reads events and daily features and writes features, models,
//! importances and predictions through these traits. Backends:
//! - [`memory::InMemoryStore`] for tests and embedding
//! - [`postgres::PgStore`] for production (feature `postgres`)

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{PipelineError, Result};
use crate::types::{DailyFeature, FeatureImportance, Model, Prediction, RawEvent, TrainingRun};

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

/// Read access to the append-only event log
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events for one user with `start <= timestamp <= end`, oldest first
    async fn events_for_user(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>>;

    /// Distinct users with at least one event in `[start, end]`
    async fn users_with_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>>;
}

/// Daily feature rows, unique per `(user_id, day)`
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Insert or overwrite the row for `(row.user_id, row.day)`
    async fn upsert_daily_feature(&self, row: &DailyFeature) -> Result<()>;

    /// All stored rows
    async fn daily_features(&self) -> Result<Vec<DailyFeature>>;

    /// Rows with `day >= since`, across all users
    async fn daily_features_since(&self, since: NaiveDate) -> Result<Vec<DailyFeature>>;
}

/// Append-only model registry
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Write the model, its importances and its predictions as one unit.
    ///
    /// Fails without writing anything if the model version already exists.
    async fn commit_run(&self, run: &TrainingRun) -> Result<()>;

    async fn model(&self, model_version: &str) -> Result<Option<Model>>;

    /// Most recently created model
    async fn latest_model(&self) -> Result<Option<Model>>;

    async fn importances(&self, model_version: &str) -> Result<Vec<FeatureImportance>>;
}

/// Prediction rows, unique per `(model_version, user_id, day)`
#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Insert or overwrite each prediction
    async fn upsert_predictions(&self, predictions: &[Prediction]) -> Result<()>;

    async fn predictions(&self, model_version: &str) -> Result<Vec<Prediction>>;
}

/// Run a store call under an optional deadline
pub async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: Option<Duration>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| PipelineError::Timeout { operation, after })?,
        None => fut.await,
    }
}
