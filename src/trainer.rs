//! Mood model training
//!
//! Builds the design matrix from complete rows, fits the ridge solver and
//! measures in-sample error. Versioning is delegated to a
//! [`VersionGenerator`] over an injected [`Clock`].

use tracing::info;

use crate::clock::{Clock, VersionGenerator};
use crate::error::{PipelineError, Result};
use crate::policy::RowPolicy;
use crate::solver::RidgeSolver;
use crate::types::{DailyFeature, FeatureName, Model};

/// Minimum complete rows needed to fit a model
pub const MIN_TRAINING_ROWS: usize = 2;

/// Rows used for a fit, split into design matrix and labels
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    pub x: Vec<Vec<f64>>,
    pub y: Vec<f64>,
}

impl TrainingSet {
    /// Keep only rows with every feature and a label
    pub fn from_rows(rows: &[DailyFeature]) -> Self {
        let (x, y) = rows
            .iter()
            .filter_map(|row| {
                let label = row.mood_label?;
                let design = RowPolicy::CompleteRowsOnly.design_row(row)?;
                Some((design, f64::from(label)))
            })
            .unzip();
        Self { x, y }
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

/// A freshly fitted model plus the number of rows it saw
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
    pub model: Model,
    pub train_rows: usize,
}

/// Fits mood models and assigns their versions
pub struct ModelTrainer<'a> {
    clock: &'a dyn Clock,
    versions: &'a VersionGenerator,
}

impl<'a> ModelTrainer<'a> {
    pub fn new(clock: &'a dyn Clock, versions: &'a VersionGenerator) -> Self {
        Self { clock, versions }
    }

    /// Fit a ridge model on the complete rows of `rows`.
    ///
    /// Fails with [`PipelineError::InsufficientTrainingData`] when fewer than
    /// [`MIN_TRAINING_ROWS`] rows have all features and a label.
    pub fn train(&self, rows: &[DailyFeature], lambda: f64) -> Result<TrainedModel> {
        let set = TrainingSet::from_rows(rows);
        if set.len() < MIN_TRAINING_ROWS {
            return Err(PipelineError::InsufficientTrainingData { found: set.len() });
        }

        let fit = RidgeSolver::fit(&set.x, &set.y, lambda)?;

        let now = self.clock.now();
        let mut model = Model {
            model_version: self.versions.next(now),
            features: FeatureName::names(),
            coefficients: fit.beta,
            intercept: fit.intercept,
            lambda,
            train_mae: 0.0,
            created_at: now,
        };
        model.train_mae = mean_absolute_error(&model, &set);

        info!(
            model_version = %model.model_version,
            train_rows = set.len(),
            dropped_rows = rows.len() - set.len(),
            train_mae = model.train_mae,
            "model trained"
        );

        Ok(TrainedModel {
            model,
            train_rows: set.len(),
        })
    }
}

/// In-sample `mean(|ŷ - y|)`
pub fn mean_absolute_error(model: &Model, set: &TrainingSet) -> f64 {
    if set.is_empty() {
        return 0.0;
    }
    set.x
        .iter()
        .zip(&set.y)
        .map(|(x, y)| (model.predict(x) - y).abs())
        .sum::<f64>()
        / set.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::NaiveDate;

    fn row(user: &str, d: u32, value: f64, label: Option<i32>) -> DailyFeature {
        let day = NaiveDate::from_ymd_opt(2024, 6, d).unwrap();
        let mut row = DailyFeature::empty(user, day);
        for f in FeatureName::ALL {
            row.set(f, Some(value));
        }
        row.mood_label = label;
        row
    }

    fn trainer_parts() -> (FixedClock, VersionGenerator) {
        let day = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        (FixedClock::at_day(day), VersionGenerator::new())
    }

    #[test]
    fn test_training_set_filters_incomplete_rows() {
        let mut partial = row("u1", 2, 1.0, Some(3));
        partial.steps = None;
        let rows = vec![
            row("u1", 1, 1.0, Some(3)),
            partial,
            row("u1", 3, 2.0, None),
            row("u2", 1, 4.0, Some(5)),
        ];

        let set = TrainingSet::from_rows(&rows);
        assert_eq!(set.len(), 2);
        assert_eq!(set.y, vec![3.0, 5.0]);
        assert_eq!(set.x[1], vec![4.0; 12]);
    }

    #[test]
    fn test_insufficient_training_data() {
        let (clock, versions) = trainer_parts();
        let trainer = ModelTrainer::new(&clock, &versions);

        let rows = vec![row("u1", 1, 1.0, Some(3)), row("u1", 2, 1.0, None)];
        let err = trainer.train(&rows, 1.0).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientTrainingData { found: 1 }
        ));
    }

    #[test]
    fn test_constant_features_give_finite_model() {
        let (clock, versions) = trainer_parts();
        let trainer = ModelTrainer::new(&clock, &versions);

        let rows = vec![
            row("u1", 1, 1.0, Some(3)),
            row("u1", 2, 1.0, Some(4)),
            row("u1", 3, 1.0, Some(5)),
        ];
        let trained = trainer.train(&rows, 1.0).unwrap();
        let model = &trained.model;

        assert_eq!(trained.train_rows, 3);
        assert_eq!(model.coefficients.len(), model.features.len());
        assert!(model.coefficients.iter().all(|c| c.is_finite()));
        assert!(model.intercept.is_finite());

        // Independent MAE: every row gets the same prediction
        let y_hat = model.intercept + model.coefficients.iter().sum::<f64>();
        let expected = [3.0, 4.0, 5.0]
            .iter()
            .map(|y| (y_hat - y).abs())
            .sum::<f64>()
            / 3.0;
        assert!((model.train_mae - expected).abs() < 1e-12);
    }

    #[test]
    fn test_model_metadata() {
        let (clock, versions) = trainer_parts();
        let trainer = ModelTrainer::new(&clock, &versions);
        let rows = vec![row("u1", 1, 1.0, Some(2)), row("u1", 2, 3.0, Some(4))];

        let model = trainer.train(&rows, 0.5).unwrap().model;
        assert_eq!(model.model_version, "20240630T120000Z");
        assert_eq!(model.created_at, clock.now());
        assert_eq!(model.lambda, 0.5);
        assert_eq!(model.features, FeatureName::names());
    }

    #[test]
    fn test_same_second_runs_get_distinct_versions() {
        let (clock, versions) = trainer_parts();
        let trainer = ModelTrainer::new(&clock, &versions);
        let rows = vec![row("u1", 1, 1.0, Some(2)), row("u1", 2, 3.0, Some(4))];

        let first = trainer.train(&rows, 1.0).unwrap().model;
        let second = trainer.train(&rows, 1.0).unwrap().model;
        assert_ne!(first.model_version, second.model_version);
    }
}
