//! Pipeline configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::policy::CountPolicy;
use crate::types::FEATURE_COUNT;

/// Default ridge penalty
pub const DEFAULT_LAMBDA: f64 = 1.0;

/// Default trailing window scored after training, in days
pub const DEFAULT_WINDOW_DAYS: i64 = 14;

/// Longest accepted scoring window, in days
pub const MAX_WINDOW_DAYS: i64 = 36_500;

/// Default number of users aggregated concurrently
pub const DEFAULT_AGGREGATION_WORKERS: usize = 4;

/// Default per-call store timeout
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for one pipeline invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Ridge penalty applied to every coefficient (not the intercept)
    pub lambda: f64,
    /// Days before today included in the scoring window
    pub window_days: i64,
    /// Concurrent users during daily aggregation; 1 is strictly sequential
    pub aggregation_workers: usize,
    /// Deadline for each store call; `None` waits indefinitely
    pub store_timeout: Option<Duration>,
    pub count_policy: CountPolicy,
    /// Rows with fewer present features are not scored (0 scores everything)
    pub min_features_present: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lambda: DEFAULT_LAMBDA,
            window_days: DEFAULT_WINDOW_DAYS,
            aggregation_workers: DEFAULT_AGGREGATION_WORKERS,
            store_timeout: Some(DEFAULT_STORE_TIMEOUT),
            count_policy: CountPolicy::default(),
            min_features_present: 0,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.lambda.is_finite() || self.lambda < 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "lambda must be a finite value >= 0, got {}",
                self.lambda
            )));
        }
        if !(0..=MAX_WINDOW_DAYS).contains(&self.window_days) {
            return Err(PipelineError::InvalidConfig(format!(
                "window_days must be between 0 and {MAX_WINDOW_DAYS}, got {}",
                self.window_days
            )));
        }
        if self.aggregation_workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "aggregation_workers must be at least 1".to_string(),
            ));
        }
        if self.min_features_present > FEATURE_COUNT {
            return Err(PipelineError::InvalidConfig(format!(
                "min_features_present must be <= {FEATURE_COUNT}, got {}",
                self.min_features_present
            )));
        }
        Ok(())
    }
}
