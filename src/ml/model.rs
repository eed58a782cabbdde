//! Quantile regressor interface and the registry of model families

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::features::{Dataset, FeatureRow};
use super::gbdt::GradientBoostedQuantiles;
use super::params::ModelParams;
use super::scoring::QuantileLevels;
use crate::error::{ForecastError, Result};

/// Everything needed to construct a fresh, unfitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub params: ModelParams,
    pub quantiles: QuantileLevels,
    /// Indices into `FeatureRow::to_vec` treated as categories
    pub categorical_features: Vec<usize>,
    pub seed: u64,
}

impl ModelSpec {
    pub fn new(params: ModelParams, quantiles: QuantileLevels, seed: u64) -> Self {
        Self {
            params,
            quantiles,
            categorical_features: FeatureRow::CATEGORICAL.to_vec(),
            seed,
        }
    }

    pub fn with_params(&self, params: ModelParams) -> Self {
        Self {
            params,
            ..self.clone()
        }
    }
}

/// A regressor predicting three quantiles per row.
pub trait QuantileRegressor: fmt::Debug + Send {
    /// Family tag the model was built by
    fn family(&self) -> &str;

    fn params(&self) -> &ModelParams;

    /// Fit on `train`; when `eval` is given, boosting stops early against it
    /// and the best iteration is kept.
    fn fit(&mut self, train: &Dataset, eval: Option<&Dataset>) -> Result<()>;

    /// One `[lower, median, upper]` row per input row.
    fn predict(&self, features: &[FeatureRow]) -> Result<Vec<Vec<f64>>>;

    /// Serialized fitted state, loadable through the family's loader.
    fn to_artifact(&self) -> Result<serde_json::Value>;
}

type Constructor = Box<dyn Fn(&ModelSpec) -> Box<dyn QuantileRegressor> + Send + Sync>;
type Loader = Box<dyn Fn(serde_json::Value) -> Result<Box<dyn QuantileRegressor>> + Send + Sync>;

struct ModelFamily {
    construct: Constructor,
    load: Loader,
}

/// Maps a model-family tag to its constructor and artifact loader.
pub struct ModelRegistry {
    families: HashMap<String, ModelFamily>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("families", &self.families())
            .finish()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            GradientBoostedQuantiles::FAMILY,
            |spec| Box::new(GradientBoostedQuantiles::new(spec.clone())),
            |artifact| {
                let model: GradientBoostedQuantiles = serde_json::from_value(artifact)?;
                Ok(Box::new(model))
            },
        );
        registry
    }
}

impl ModelRegistry {
    /// Registry without any family.
    pub fn empty() -> Self {
        Self {
            families: HashMap::new(),
        }
    }

    /// Register a family, replacing any previous entry under `name`.
    pub fn register<C, L>(&mut self, name: &str, construct: C, load: L)
    where
        C: Fn(&ModelSpec) -> Box<dyn QuantileRegressor> + Send + Sync + 'static,
        L: Fn(serde_json::Value) -> Result<Box<dyn QuantileRegressor>> + Send + Sync + 'static,
    {
        self.families.insert(
            name.to_string(),
            ModelFamily {
                construct: Box::new(construct),
                load: Box::new(load),
            },
        );
    }

    /// Construct a fresh model of `family`.
    pub fn build(&self, family: &str, spec: &ModelSpec) -> Result<Box<dyn QuantileRegressor>> {
        let entry = self
            .families
            .get(family)
            .ok_or_else(|| ForecastError::UnsupportedModel(family.to_string()))?;
        Ok((entry.construct)(spec))
    }

    /// Restore a fitted model of `family` from its artifact.
    pub fn load(
        &self,
        family: &str,
        artifact: serde_json::Value,
    ) -> Result<Box<dyn QuantileRegressor>> {
        let entry = self
            .families
            .get(family)
            .ok_or_else(|| ForecastError::UnsupportedModel(family.to_string()))?;
        (entry.load)(artifact)
    }

    /// Registered family tags, sorted.
    pub fn families(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.families.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
