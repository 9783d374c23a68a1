//! Trailing-window scoring
//!
//! Every daily row in the window is scored, with missing features treated as
//! zero ([`RowPolicy::ZeroFillMissing`]). This differs on purpose from training,
//! which only sees complete rows.

use chrono::{Duration, NaiveDate};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::policy::RowPolicy;
use crate::types::{DailyFeature, Model, Prediction};

/// Scores daily feature rows with a trained model
#[derive(Debug, Clone, Copy, Default)]
pub struct Predictor {
    /// Rows with fewer present features are skipped (0 scores everything)
    pub min_features_present: usize,
}

impl Predictor {
    pub fn new(min_features_present: usize) -> Self {
        Self {
            min_features_present,
        }
    }

    /// First day of a window of `window_days` days ending `today`.
    ///
    /// Fails with [`PipelineError::InvalidConfig`] when the start would fall
    /// outside the representable date range.
    pub fn window_start(today: NaiveDate, window_days: i64) -> Result<NaiveDate> {
        Duration::try_days(window_days)
            .and_then(|window| today.checked_sub_signed(window))
            .ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "window of {window_days} days before {today} is out of range"
                ))
            })
    }

    /// Score one row, or `None` if it falls below the completeness guard
    pub fn predict_row(&self, model: &Model, row: &DailyFeature) -> Option<Prediction> {
        if row.present_count() < self.min_features_present {
            debug!(
                user_id = %row.user_id,
                day = %row.day,
                present = row.present_count(),
                "row below completeness guard, not scored"
            );
            return None;
        }
        let x = RowPolicy::ZeroFillMissing.design_row(row)?;

        Some(Prediction {
            model_version: model.model_version.clone(),
            user_id: row.user_id.clone(),
            day: row.day,
            y_true: row.mood_label,
            y_pred: round2(model.predict(&x)),
            proba_at_risk: None,
        })
    }

    /// Score every row with `day >= window_start`
    pub fn predict_window(
        &self,
        model: &Model,
        rows: &[DailyFeature],
        window_start: NaiveDate,
    ) -> Vec<Prediction> {
        rows.iter()
            .filter(|row| row.day >= window_start)
            .filter_map(|row| self.predict_row(model, row))
            .collect()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
