//! Hyperparameter schema shared by the search, the model registry and the
//! run records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

/// Name of a tunable hyperparameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKey {
    NEstimators,
    LearningRate,
    Depth,
    L2LeafReg,
    ModelSizeReg,
    RandomStrength,
    ColsampleBylevel,
    Subsample,
    EarlyStoppingRounds,
}

impl ParamKey {
    pub const ALL: [ParamKey; 9] = [
        ParamKey::NEstimators,
        ParamKey::LearningRate,
        ParamKey::Depth,
        ParamKey::L2LeafReg,
        ParamKey::ModelSizeReg,
        ParamKey::RandomStrength,
        ParamKey::ColsampleBylevel,
        ParamKey::Subsample,
        ParamKey::EarlyStoppingRounds,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamKey::NEstimators => "n_estimators",
            ParamKey::LearningRate => "learning_rate",
            ParamKey::Depth => "depth",
            ParamKey::L2LeafReg => "l2_leaf_reg",
            ParamKey::ModelSizeReg => "model_size_reg",
            ParamKey::RandomStrength => "random_strength",
            ParamKey::ColsampleBylevel => "colsample_bylevel",
            ParamKey::Subsample => "subsample",
            ParamKey::EarlyStoppingRounds => "early_stopping_rounds",
        }
    }

    /// Whether values of this key are whole numbers.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ParamKey::NEstimators | ParamKey::Depth | ParamKey::EarlyStoppingRounds
        )
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values chosen by a search trial for the keys it explores.
pub type ParamOverrides = BTreeMap<ParamKey, f64>;

/// Complete hyperparameter set of the quantile regressor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Maximum number of boosting rounds
    pub n_estimators: usize,
    pub learning_rate: f64,
    /// Maximum tree depth
    pub depth: usize,
    /// L2 shrinkage of leaf values
    pub l2_leaf_reg: f64,
    /// Minimum split gain
    pub model_size_reg: f64,
    /// Scale of the noise added to split scores
    pub random_strength: f64,
    /// Share of features considered per tree level
    pub colsample_bylevel: f64,
    /// Share of rows sampled per tree
    pub subsample: f64,
    /// Rounds without evaluation improvement before stopping
    pub early_stopping_rounds: usize,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_estimators: 800,
            learning_rate: 0.05,
            depth: 7,
            l2_leaf_reg: 0.0001,
            model_size_reg: 4.5e-05,
            random_strength: 0.00075,
            colsample_bylevel: 0.836,
            subsample: 0.84,
            early_stopping_rounds: 400,
        }
    }
}

impl ModelParams {
    pub fn get(&self, key: ParamKey) -> f64 {
        match key {
            ParamKey::NEstimators => self.n_estimators as f64,
            ParamKey::LearningRate => self.learning_rate,
            ParamKey::Depth => self.depth as f64,
            ParamKey::L2LeafReg => self.l2_leaf_reg,
            ParamKey::ModelSizeReg => self.model_size_reg,
            ParamKey::RandomStrength => self.random_strength,
            ParamKey::ColsampleBylevel => self.colsample_bylevel,
            ParamKey::Subsample => self.subsample,
            ParamKey::EarlyStoppingRounds => self.early_stopping_rounds as f64,
        }
    }

    /// Set a key; integer keys are rounded to the nearest whole number.
    pub fn set(&mut self, key: ParamKey, value: f64) {
        let whole = value.round().max(0.0) as usize;
        match key {
            ParamKey::NEstimators => self.n_estimators = whole,
            ParamKey::LearningRate => self.learning_rate = value,
            ParamKey::Depth => self.depth = whole,
            ParamKey::L2LeafReg => self.l2_leaf_reg = value,
            ParamKey::ModelSizeReg => self.model_size_reg = value,
            ParamKey::RandomStrength => self.random_strength = value,
            ParamKey::ColsampleBylevel => self.colsample_bylevel = value,
            ParamKey::Subsample => self.subsample = value,
            ParamKey::EarlyStoppingRounds => self.early_stopping_rounds = whole,
        }
    }

    /// Copy of `self` with every key in `overrides` replaced.
    pub fn with_overrides(&self, overrides: &ParamOverrides) -> Self {
        let mut merged = *self;
        for (key, value) in overrides {
            merged.set(*key, *value);
        }
        merged
    }

    /// Flat string-keyed form used by run records.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        ParamKey::ALL
            .iter()
            .map(|key| (key.as_str().to_string(), self.get(*key)))
            .collect()
    }

    /// Rebuild from a string-keyed map; every key must be present.
    pub fn from_map(map: &BTreeMap<String, f64>) -> Result<Self> {
        let mut params = Self::default();
        for key in ParamKey::ALL {
            let value = map
                .get(key.as_str())
                .ok_or_else(|| ForecastError::IncompleteParams(key.as_str().to_string()))?;
            params.set(key, *value);
        }
        params.validate()?;
        Ok(params)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ForecastError::InvalidParameter(msg.to_string()));
        if self.n_estimators == 0 {
            return invalid("n_estimators must be positive");
        }
        if self.depth == 0 {
            return invalid("depth must be positive");
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return invalid("learning_rate must be positive");
        }
        if !(0.0 < self.subsample && self.subsample <= 1.0) {
            return invalid("subsample must be in (0, 1]");
        }
        if !(0.0 < self.colsample_bylevel && self.colsample_bylevel <= 1.0) {
            return invalid("colsample_bylevel must be in (0, 1]");
        }
        if self.l2_leaf_reg < 0.0 || self.model_size_reg < 0.0 || self.random_strength < 0.0 {
            return invalid("regularization strengths must be non-negative");
        }
        Ok(())
    }
}
