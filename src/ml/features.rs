//! Feature extraction for the quantile regressor
//!
//! Turns observations and forecast slots into fixed-width feature vectors.

use crate::observation::{Observation, TimeFeatures};

/// Features fed to the model for a single row
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureRow {
    pub minutes_from_daystart: f64,
    /// Day of week, 0 = Monday
    pub weekday: f64,
    pub holiday: f64,
    pub bridge_day: f64,
}

impl FeatureRow {
    /// Number of features
    pub const NUM_FEATURES: usize = 4;

    /// Indices of the categorical features within `to_vec`
    pub const CATEGORICAL: [usize; 3] = [1, 2, 3];

    pub fn from_time_features(features: &TimeFeatures) -> Self {
        Self {
            minutes_from_daystart: f64::from(features.minutes_from_daystart),
            weekday: f64::from(features.weekday),
            holiday: if features.holiday { 1.0 } else { 0.0 },
            bridge_day: if features.bridge_day { 1.0 } else { 0.0 },
        }
    }

    /// Convert features to a vector for the model
    pub fn to_vec(&self) -> Vec<f64> {
        vec![
            self.minutes_from_daystart,
            self.weekday,
            self.holiday,
            self.bridge_day,
        ]
    }

    /// Feature names for logging
    pub fn feature_names() -> Vec<&'static str> {
        vec!["minutes_from_daystart", "weekday", "holiday", "bridge_holiday"]
    }
}

/// Feature rows paired with their power targets
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub features: Vec<FeatureRow>,
    pub targets: Vec<f64>,
}

impl Dataset {
    pub fn from_observations(rows: &[Observation]) -> Self {
        Self {
            features: rows
                .iter()
                .map(|row| FeatureRow::from_time_features(&row.features))
                .collect(),
            targets: rows.iter().map(|row| row.power).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Append another dataset's rows after this one's.
    pub fn concat(mut self, other: &Dataset) -> Self {
        self.features.extend_from_slice(&other.features);
        self.targets.extend_from_slice(&other.targets);
        self
    }
}
