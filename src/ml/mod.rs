//! Model fitting, walk-forward evaluation and model selection
//!
//! The regressor itself sits behind [`QuantileRegressor`]; everything else in
//! this module only sees lower/median/upper predictions and the interval
//! score computed from them.

pub mod cv;
pub mod features;
pub mod gbdt;
pub mod model;
pub mod params;
pub mod persistence;
pub mod scoring;
pub mod search;
pub mod selection;

pub use cv::{CvOutcome, Fold, FoldScore, WalkForward, WalkForwardValidator, WindowPolicy};
pub use features::{Dataset, FeatureRow};
pub use gbdt::GradientBoostedQuantiles;
pub use model::{ModelRegistry, ModelSpec, QuantileRegressor};
pub use params::{ModelParams, ParamKey, ParamOverrides};
pub use persistence::{FileModelRepository, ModelRepository, RunRecord, RunTags};
pub use scoring::{IntervalScore, QuantileLevels, QuantileTriple, mean_interval_score};
pub use search::{
    HyperparameterSearch, MedianPruner, SearchOutcome, SearchSettings, SearchSpace, Trial,
    TrialState, TrialSummary,
};
pub use selection::{Decision, Incumbent, ModelLineage, ModelSelector, TestMetrics, Winner};
