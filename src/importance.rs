//! Feature importance from model coefficients

use crate::types::{FeatureImportance, Model};

pub struct ImportanceCalculator;

impl ImportanceCalculator {
    /// `|coef_i| / Σ|coef_j|`, one row per feature in model order.
    ///
    /// An all-zero coefficient vector yields all-zero importances.
    pub fn compute(model: &Model) -> Vec<FeatureImportance> {
        let total: f64 = model.coefficients.iter().map(|c| c.abs()).sum();
        let denominator = if total == 0.0 { 1.0 } else { total };

        model
            .features
            .iter()
            .zip(&model.coefficients)
            .map(|(feature, coef)| FeatureImportance {
                model_version: model.model_version.clone(),
                feature: feature.clone(),
                importance: coef.abs() / denominator,
            })
            .collect()
    }
}
