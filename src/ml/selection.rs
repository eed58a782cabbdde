//! Challenger versus incumbent decision on the held-out test window.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::features::Dataset;
use super::model::{ModelRegistry, ModelSpec, QuantileRegressor};
use super::params::{ModelParams, ParamOverrides};
use super::scoring::{mean_absolute_error, mean_interval_score, triples_from_predictions};
use crate::error::Result;
use crate::observation::Observation;

/// Whether a floor already has a model to compete against.
#[derive(Debug)]
pub enum ModelLineage {
    /// First model for the floor
    Bootstrap,
    Continuation(Incumbent),
}

impl ModelLineage {
    pub fn incumbent(&self) -> Option<&Incumbent> {
        match self {
            ModelLineage::Bootstrap => None,
            ModelLineage::Continuation(incumbent) => Some(incumbent),
        }
    }

    /// Parameters the search should narrow around, if any.
    pub fn prior_params(&self) -> Option<&ModelParams> {
        self.incumbent().map(|incumbent| &incumbent.params)
    }
}

/// The previously selected model of a floor.
#[derive(Debug)]
pub struct Incumbent {
    pub run_id: String,
    pub params: ModelParams,
    pub model: Box<dyn QuantileRegressor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Challenger,
    Incumbent,
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Winner::Challenger => "challenger",
            Winner::Incumbent => "incumbent",
        })
    }
}

/// Scores of one model on the test window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestMetrics {
    pub mwis: f64,
    pub mae: f64,
    pub coverage: f64,
}

/// Percent by which `challenger` improves on `incumbent`.
///
/// A zero incumbent score cannot be improved on: a zero challenger ties at
/// zero percent, anything else counts as infinitely worse.
pub fn percent_improvement(incumbent: f64, challenger: f64) -> f64 {
    if incumbent == 0.0 {
        return if challenger == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }
    (incumbent - challenger) / incumbent * 100.0
}

/// Pick the winner from the two test scores.
pub fn choose_winner(
    challenger_mwis: f64,
    incumbent_mwis: Option<f64>,
    min_improvement_percent: f64,
) -> Winner {
    match incumbent_mwis {
        None => Winner::Challenger,
        Some(incumbent) => {
            if percent_improvement(incumbent, challenger_mwis) < min_improvement_percent {
                Winner::Incumbent
            } else {
                Winner::Challenger
            }
        }
    }
}

/// Outcome of the selection.
#[derive(Debug)]
pub struct Decision {
    pub winner: Winner,
    /// Canonical parameters for the floor from now on
    pub params: ModelParams,
    /// Test metrics of the winner
    pub metrics: TestMetrics,
    pub challenger_metrics: TestMetrics,
    pub incumbent_metrics: Option<TestMetrics>,
    pub improvement_percent: Option<f64>,
    /// Trained on CV and test rows with the winning parameters
    pub production_model: Box<dyn QuantileRegressor>,
}

/// Trains the challenger, compares it with the incumbent and fits the
/// production model.
#[derive(Debug)]
pub struct ModelSelector<'a> {
    pub registry: &'a ModelRegistry,
    pub family: &'a str,
    /// Spec template; its parameters are replaced per fit
    pub spec: ModelSpec,
    pub min_improvement_percent: f64,
}

impl ModelSelector<'_> {
    /// Score a fitted model on `test`.
    pub fn evaluate(&self, model: &dyn QuantileRegressor, test: &Dataset) -> Result<TestMetrics> {
        let predictions = triples_from_predictions(&model.predict(&test.features)?)?;
        let score = mean_interval_score(&test.targets, &predictions, &self.spec.quantiles)?;
        Ok(TestMetrics {
            mwis: score.mwis,
            mae: mean_absolute_error(&test.targets, &predictions),
            coverage: score.coverage,
        })
    }

    fn fit(&self, params: ModelParams, train: &Dataset) -> Result<Box<dyn QuantileRegressor>> {
        let mut model = self.registry.build(self.family, &self.spec.with_params(params))?;
        model.fit(train, None)?;
        Ok(model)
    }

    /// Decide between the best trial's parameters and the incumbent.
    ///
    /// `best` holds the full challenger parameters and `overrides` the keys
    /// the search explored; on a challenger win the overrides are merged
    /// over the incumbent's parameters.
    pub fn decide(
        &self,
        best: &ModelParams,
        overrides: &ParamOverrides,
        cv: &[Observation],
        test: &[Observation],
        lineage: &ModelLineage,
    ) -> Result<Decision> {
        let cv_data = Dataset::from_observations(cv);
        let test_data = Dataset::from_observations(test);

        let challenger = self.fit(*best, &cv_data)?;
        let challenger_metrics = self.evaluate(challenger.as_ref(), &test_data)?;

        let incumbent_metrics = match lineage.incumbent() {
            Some(incumbent) => Some(self.evaluate(incumbent.model.as_ref(), &test_data)?),
            None => None,
        };

        let winner = choose_winner(
            challenger_metrics.mwis,
            incumbent_metrics.map(|m| m.mwis),
            self.min_improvement_percent,
        );
        let improvement_percent =
            incumbent_metrics.map(|m| percent_improvement(m.mwis, challenger_metrics.mwis));

        let (params, metrics) = match (winner, lineage.incumbent(), incumbent_metrics) {
            (Winner::Incumbent, Some(incumbent), Some(metrics)) => (incumbent.params, metrics),
            (_, Some(incumbent), _) => {
                (incumbent.params.with_overrides(overrides), challenger_metrics)
            }
            (_, None, _) => (*best, challenger_metrics),
        };

        match improvement_percent {
            Some(pct) => tracing::info!(
                "Test MWIS challenger {:.4} vs incumbent {:.4} ({:+.2}%), {} wins",
                challenger_metrics.mwis,
                incumbent_metrics.map_or(f64::NAN, |m| m.mwis),
                pct,
                winner
            ),
            None => tracing::info!(
                "No incumbent, challenger wins with test MWIS {:.4}",
                challenger_metrics.mwis
            ),
        }

        let full = cv_data.concat(&test_data);
        let production_model = self.fit(params, &full)?;

        Ok(Decision {
            winner,
            params,
            metrics,
            challenger_metrics,
            incumbent_metrics,
            improvement_percent,
            production_model,
        })
    }
}
