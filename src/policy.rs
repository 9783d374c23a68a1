//! Null-handling policies
//!
//! Training and scoring treat missing features differently, and the two
//! behaviors are kept as separate named strategies:
//! - [`RowPolicy::CompleteRowsOnly`] drops any row missing a feature
//! - [`RowPolicy::ZeroFillMissing`] scores every row, treating gaps as 0
//!
//! [`CountPolicy`] governs whether a zero count is reported as 0 or null.

use serde::{Deserialize, Serialize};

use crate::types::DailyFeature;

/// How a [`DailyFeature`] becomes a design-matrix row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowPolicy {
    /// Only rows with all features present
    CompleteRowsOnly,
    /// Missing features default to 0.0
    ZeroFillMissing,
}

impl RowPolicy {
    /// Feature values in model order, or `None` if the row is excluded
    pub fn design_row(&self, row: &DailyFeature) -> Option<Vec<f64>> {
        let values = row.values();
        match self {
            RowPolicy::CompleteRowsOnly => values.iter().copied().collect(),
            RowPolicy::ZeroFillMissing => {
                Some(values.iter().map(|v| v.unwrap_or(0.0)).collect())
            }
        }
    }
}

/// Count features as computed before the null policy is applied
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Count {
    pub value: f64,
    /// At least one event of the relevant type existed that day
    pub observed: bool,
}

impl Count {
    pub fn new(value: f64, observed: bool) -> Self {
        Self { value, observed }
    }
}

/// Whether a zero count is stored as 0 or as null
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountPolicy {
    /// Any count of exactly 0 becomes null, whether or not events existed
    #[default]
    CollapseZero,
    /// 0 when relevant events existed, null only when there were none
    KeepZero,
}

impl CountPolicy {
    pub fn resolve(&self, count: Count) -> Option<f64> {
        match self {
            CountPolicy::CollapseZero => (count.value != 0.0).then_some(count.value),
            CountPolicy::KeepZero => count.observed.then_some(count.value),
        }
    }
}
