//! Walk-forward cross-validation over calendar weeks.
//!
//! Folds are built on the chronological list of distinct weeks. Every fold
//! fits a fresh model, predicts its validation weeks, and contributes its
//! predictions to a pooled out-of-fold set that is scored once at the end.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::features::Dataset;
use super::model::{ModelRegistry, ModelSpec};
use super::scoring::{
    IntervalScore, QuantileTriple, mean_absolute_error, mean_interval_score,
    triples_from_predictions,
};
use crate::error::{ForecastError, Result};
use crate::observation::{Observation, YearWeek, distinct_weeks, rows_in_weeks, sort_chronologically};

/// How the training window moves between folds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowPolicy {
    /// Train on everything up to the cutoff
    #[serde(rename = "expanding_window")]
    Expanding,
    /// Train on a fixed number of weeks ending at the cutoff
    #[serde(rename = "sliding_window")]
    Sliding,
}

impl fmt::Display for WindowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WindowPolicy::Expanding => "expanding_window",
            WindowPolicy::Sliding => "sliding_window",
        })
    }
}

impl FromStr for WindowPolicy {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "expanding_window" => Ok(WindowPolicy::Expanding),
            "sliding_window" => Ok(WindowPolicy::Sliding),
            other => Err(ForecastError::InvalidParameter(format!(
                "'{other}' is not one of expanding_window, sliding_window"
            ))),
        }
    }
}

/// Train and validation weeks of one fold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fold {
    pub index: usize,
    pub train_weeks: Vec<YearWeek>,
    pub validation_weeks: Vec<YearWeek>,
}

/// Week positions of one fold, before they are mapped to keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldBounds {
    /// Half-open range of train week indices
    pub train: std::ops::Range<usize>,
    pub validation: Vec<usize>,
}

/// Fold generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkForward {
    pub policy: WindowPolicy,
    /// Initial window (expanding) or window length (sliding), in weeks
    pub window_weeks: usize,
    pub step_weeks: usize,
    /// Validation offsets in weeks after the last train week
    pub horizon: Vec<usize>,
}

impl WalkForward {
    pub fn new(
        policy: WindowPolicy,
        window_weeks: usize,
        step_weeks: usize,
        horizon: Vec<usize>,
    ) -> Result<Self> {
        if window_weeks == 0 || step_weeks == 0 {
            return Err(ForecastError::InvalidParameter(
                "window and step must be at least one week".to_string(),
            ));
        }
        if horizon.is_empty() || horizon.contains(&0) {
            return Err(ForecastError::InvalidParameter(format!(
                "horizon must be a non-empty list of positive offsets, got {horizon:?}"
            )));
        }
        Ok(Self {
            policy,
            window_weeks,
            step_weeks,
            horizon,
        })
    }

    fn max_horizon(&self) -> usize {
        self.horizon.iter().copied().max().unwrap_or(1)
    }

    /// Fewest distinct weeks that yield one fold.
    pub fn min_weeks(&self) -> usize {
        self.window_weeks + self.max_horizon() + 1
    }

    /// Fold positions over `n_weeks` chronological weeks.
    ///
    /// The cutoff starts after `window_weeks` and advances by `step_weeks`
    /// while the furthest horizon stays before the final week.
    pub fn bounds(&self, n_weeks: usize) -> Vec<FoldBounds> {
        let max_h = self.max_horizon();
        let mut folds = Vec::new();
        let mut end = self.window_weeks;
        while end + max_h < n_weeks {
            let start = match self.policy {
                WindowPolicy::Expanding => 0,
                WindowPolicy::Sliding => end - self.window_weeks,
            };
            folds.push(FoldBounds {
                train: start..end,
                validation: self.horizon.iter().map(|h| end - 1 + h).collect(),
            });
            end += self.step_weeks;
        }
        folds
    }

    /// Folds over chronologically ordered `weeks`.
    pub fn folds(&self, weeks: &[YearWeek]) -> Vec<Fold> {
        self.bounds(weeks.len())
            .into_iter()
            .enumerate()
            .map(|(index, bounds)| Fold {
                index,
                train_weeks: weeks[bounds.train].to_vec(),
                validation_weeks: bounds.validation.iter().map(|i| weeks[*i]).collect(),
            })
            .collect()
    }
}

/// Diagnostics of one fold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoldScore {
    pub fold: usize,
    pub train_weeks: Vec<YearWeek>,
    pub validation_weeks: Vec<YearWeek>,
    pub train_rows: usize,
    pub validation_rows: usize,
    pub mae: f64,
    pub interval_score: f64,
    pub coverage: f64,
}

/// Outcome of a full cross-validation run.
#[derive(Debug, Clone, PartialEq)]
pub struct CvOutcome {
    /// Score over the pooled out-of-fold predictions
    pub score: IntervalScore,
    pub folds: Vec<FoldScore>,
    pub oof_truth: Vec<f64>,
    pub oof_predictions: Vec<QuantileTriple>,
}

/// Decision returned by the per-fold callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldControl {
    Continue,
    Prune,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CvRun {
    Completed(CvOutcome),
    /// Stopped by the callback after `folds.len()` folds
    Pruned {
        partial: IntervalScore,
        folds: Vec<FoldScore>,
    },
}

/// Cross-validates one model family on a CV window.
#[derive(Debug)]
pub struct WalkForwardValidator<'a> {
    pub splitter: &'a WalkForward,
    pub registry: &'a ModelRegistry,
    pub family: &'a str,
}

impl WalkForwardValidator<'_> {
    /// Run every fold without early abandonment.
    pub fn evaluate(&self, rows: &[Observation], spec: &ModelSpec) -> Result<CvOutcome> {
        match self.evaluate_with(rows, spec, &mut |_, _| FoldControl::Continue)? {
            CvRun::Completed(outcome) => Ok(outcome),
            CvRun::Pruned { .. } => Err(ForecastError::InvalidParameter(
                "cross-validation pruned without a pruning callback".to_string(),
            )),
        }
    }

    /// Run the folds, reporting the pooled score so far after each one.
    ///
    /// The callback receives the fold index and the running pooled score; a
    /// `Prune` answer stops before the next fold.
    pub fn evaluate_with(
        &self,
        rows: &[Observation],
        spec: &ModelSpec,
        on_fold: &mut dyn FnMut(usize, &IntervalScore) -> FoldControl,
    ) -> Result<CvRun> {
        let mut rows = rows.to_vec();
        sort_chronologically(&mut rows);

        let weeks = distinct_weeks(&rows);
        let folds = self.splitter.folds(&weeks);
        if folds.is_empty() {
            return Err(ForecastError::InsufficientHistory {
                needed: self.splitter.min_weeks(),
                got: weeks.len(),
            });
        }

        let levels = spec.quantiles;
        let mut oof_truth = Vec::new();
        let mut oof_predictions = Vec::new();
        let mut scores = Vec::with_capacity(folds.len());

        for fold in &folds {
            let train = Dataset::from_observations(&rows_in_weeks(&rows, &fold.train_weeks));
            let validation =
                Dataset::from_observations(&rows_in_weeks(&rows, &fold.validation_weeks));

            let mut model = self.registry.build(self.family, spec)?;
            model.fit(&train, Some(&validation))?;
            let predictions = triples_from_predictions(&model.predict(&validation.features)?)?;

            let fold_score = mean_interval_score(&validation.targets, &predictions, &levels)?;
            scores.push(FoldScore {
                fold: fold.index,
                train_weeks: fold.train_weeks.clone(),
                validation_weeks: fold.validation_weeks.clone(),
                train_rows: train.len(),
                validation_rows: validation.len(),
                mae: mean_absolute_error(&validation.targets, &predictions),
                interval_score: fold_score.mwis,
                coverage: fold_score.coverage,
            });
            tracing::debug!(
                "Fold {}: train {} weeks ({} rows), validation {:?}, MWIS {:.4}",
                fold.index,
                fold.train_weeks.len(),
                train.len(),
                fold.validation_weeks.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
                fold_score.mwis
            );

            oof_truth.extend_from_slice(&validation.targets);
            oof_predictions.extend(predictions);

            let running = mean_interval_score(&oof_truth, &oof_predictions, &levels)?;
            let is_last = fold.index + 1 == folds.len();
            if !is_last && on_fold(fold.index, &running) == FoldControl::Prune {
                return Ok(CvRun::Pruned {
                    partial: running,
                    folds: scores,
                });
            }
        }

        let score = mean_interval_score(&oof_truth, &oof_predictions, &levels)?;
        Ok(CvRun::Completed(CvOutcome {
            score,
            folds: scores,
            oof_truth,
            oof_predictions,
        }))
    }
}
