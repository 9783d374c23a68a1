//! Mood Flux - Daily behavioral features and ridge-regression mood models
//!
//! Mood Flux turns a per-user event log into daily feature vectors and fits a
//! mood model through a fail-fast batch pipeline: event aggregation → ridge
//! training → feature importance → trailing-window scoring → atomic registry
//! commit.
//!
//! ## Modules
//!
//! - **Aggregation**: Raw events into fixed-width daily feature rows
//! - **Modeling**: Closed-form ridge solver, trainer, importances, predictor
//! - **Stores**: Async store interfaces with in-memory and Postgres backends

pub mod clock;
pub mod config;
pub mod error;
pub mod features;
pub mod importance;
pub mod pipeline;
pub mod policy;
pub mod predictor;
pub mod solver;
pub mod store;
pub mod trainer;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock, VersionGenerator};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use features::{FeatureAggregator, FeatureDeriver};
pub use importance::ImportanceCalculator;
pub use pipeline::MoodPipeline;
pub use policy::{CountPolicy, RowPolicy};
pub use predictor::Predictor;
pub use solver::{RidgeFit, RidgeSolver};
pub use store::{EventStore, FeatureStore, InMemoryStore, ModelRegistry, PredictionStore};
#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use trainer::{ModelTrainer, TrainedModel};
pub use types::{
    AggregationReport, DailyFeature, EventType, FeatureImportance, FeatureName, Model, Prediction,
    RawEvent, ScoreReport, TrainReport, TrainingRun,
};

/// Crate version, reported by the CLI
pub const FLUX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name, reported by the CLI
pub const PRODUCER_NAME: &str = "mood-flux";
