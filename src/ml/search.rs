//! Sequential hyperparameter search over walk-forward CV.
//!
//! Candidates come from a seeded tree-structured Parzen estimator: after a
//! number of uniform startup trials, each parameter is drawn from a density
//! fitted to the best-ranked trials and chosen to maximize its ratio to the
//! density of the rest. Trials whose pooled coverage falls short of the
//! floor are kept but ranked behind every feasible trial.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Serialize;

use super::cv::{CvRun, FoldControl, FoldScore, WalkForwardValidator};
use super::model::ModelSpec;
use super::params::{ModelParams, ParamKey, ParamOverrides};
use super::scoring::QuantileLevels;
use crate::error::{ForecastError, Result};
use crate::observation::Observation;
use crate::traits::Clock;

/// Candidates drawn per parameter before picking the best ratio
const EI_CANDIDATES: usize = 24;
/// Share of ranked trials forming the "good" density
const GOOD_FRACTION: f64 = 0.1;
const MAX_GOOD_TRIALS: usize = 25;

// ==================== Search Space ====================

/// Sampling range of one hyperparameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParamRange {
    pub key: ParamKey,
    pub low: f64,
    pub high: f64,
    /// Sample uniformly in log space
    pub log: bool,
}

impl ParamRange {
    /// Build a range; an inverted range collapses onto `low` and a log range
    /// touching zero is sampled linearly.
    pub fn new(key: ParamKey, low: f64, high: f64, log: bool) -> Self {
        Self {
            key,
            low,
            high: high.max(low),
            log: log && low > 0.0,
        }
    }

    fn to_internal(&self, value: f64) -> f64 {
        if self.log { value.ln() } else { value }
    }

    fn from_internal(&self, value: f64) -> f64 {
        let raw = if self.log { value.exp() } else { value };
        let clamped = raw.clamp(self.low, self.high);
        if self.key.is_integer() {
            clamped.round()
        } else {
            clamped
        }
    }

    fn internal_bounds(&self) -> (f64, f64) {
        (self.to_internal(self.low), self.to_internal(self.high))
    }

    fn sample_uniform(&self, rng: &mut StdRng) -> f64 {
        let (a, b) = self.internal_bounds();
        if b <= a {
            return self.from_internal(a);
        }
        self.from_internal(rng.random_range(a..=b))
    }

    pub fn contains(&self, value: f64) -> bool {
        self.low <= value && value <= self.high
    }
}

/// Ranges explored by a study plus the values of every unexplored key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchSpace {
    base: ModelParams,
    ranges: Vec<ParamRange>,
    warm: bool,
}

impl SearchSpace {
    /// Wide ranges over every hyperparameter.
    pub fn cold_start() -> Self {
        use ParamKey::*;
        Self {
            base: ModelParams::default(),
            ranges: vec![
                ParamRange::new(NEstimators, 50.0, 1500.0, true),
                ParamRange::new(LearningRate, 5e-3, 0.1, true),
                ParamRange::new(Depth, 2.0, 12.0, false),
                ParamRange::new(L2LeafReg, 1e-8, 100.0, true),
                ParamRange::new(ModelSizeReg, 1e-8, 100.0, true),
                ParamRange::new(RandomStrength, 1e-8, 100.0, true),
                ParamRange::new(ColsampleBylevel, 0.1, 1.0, false),
                ParamRange::new(Subsample, 0.1, 1.0, false),
                ParamRange::new(EarlyStoppingRounds, 5.0, 1000.0, true),
            ],
            warm: false,
        }
    }

    /// Narrow ranges around `prior`; L2, model-size regularization and
    /// subsample stay pinned to the prior values.
    pub fn warm_start(prior: &ModelParams) -> Self {
        use ParamKey::*;
        let depth = prior.depth as f64;
        let early = prior.early_stopping_rounds as f64;
        let trees = prior.n_estimators as f64;
        Self {
            base: *prior,
            ranges: vec![
                ParamRange::new(
                    LearningRate,
                    prior.learning_rate * 0.5,
                    prior.learning_rate * 1.5,
                    true,
                ),
                ParamRange::new(Depth, (depth - 1.0).max(5.0), depth + 1.0, false),
                ParamRange::new(
                    RandomStrength,
                    prior.random_strength * 0.8,
                    prior.random_strength * 1.2,
                    true,
                ),
                ParamRange::new(
                    ColsampleBylevel,
                    prior.colsample_bylevel * 0.6,
                    (prior.colsample_bylevel * 1.4).min(1.0),
                    false,
                ),
                ParamRange::new(
                    EarlyStoppingRounds,
                    (early - 100.0).max(10.0),
                    early + 100.0,
                    true,
                ),
                ParamRange::new(NEstimators, (trees - 50.0).max(50.0), trees + 50.0, true),
            ],
            warm: true,
        }
    }

    pub fn base(&self) -> &ModelParams {
        &self.base
    }

    pub fn ranges(&self) -> &[ParamRange] {
        &self.ranges
    }

    pub fn is_warm(&self) -> bool {
        self.warm
    }

    /// Full parameter set for a trial's sampled values.
    pub fn resolve(&self, overrides: &ParamOverrides) -> ModelParams {
        self.base.with_overrides(overrides)
    }
}

// ==================== Trials ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    /// Scored on every fold and coverage met the floor
    Complete,
    /// Scored on every fold, coverage below the floor
    Infeasible,
    /// Abandoned after some folds
    Pruned,
}

/// One evaluated hyperparameter configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trial {
    pub number: usize,
    pub state: TrialState,
    /// Values sampled for the explored keys
    pub overrides: ParamOverrides,
    pub params: ModelParams,
    /// Pooled MWIS; partial when pruned
    pub mwis: f64,
    pub coverage: f64,
    pub folds: Vec<FoldScore>,
    /// Running pooled MWIS after each fold but the last
    pub intermediate: Vec<f64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Flat view of a trial for run records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialSummary {
    pub trial_number: usize,
    pub num_folds: usize,
    pub first_train_weeks_number: usize,
    pub last_train_weeks_number: usize,
    pub trial_state: TrialState,
    pub start_time: DateTime<Utc>,
    pub complete_time: DateTime<Utc>,
    pub mwis: f64,
    pub coverage: f64,
    pub fold_interval_scores: Vec<f64>,
    pub fold_mae: Vec<f64>,
    pub train_valid_weeks: Vec<(Vec<String>, Vec<String>)>,
}

impl Trial {
    pub fn is_finished(&self) -> bool {
        self.state != TrialState::Pruned
    }

    /// How far coverage falls short of `min_coverage`; zero when feasible.
    pub fn coverage_shortfall(&self, min_coverage: f64) -> f64 {
        (min_coverage - self.coverage).max(0.0)
    }

    pub fn summary(&self) -> TrialSummary {
        TrialSummary {
            trial_number: self.number,
            num_folds: self.folds.len(),
            first_train_weeks_number: self.folds.first().map_or(0, |f| f.train_weeks.len()),
            last_train_weeks_number: self.folds.last().map_or(0, |f| f.train_weeks.len()),
            trial_state: self.state,
            start_time: self.started_at,
            complete_time: self.completed_at,
            mwis: self.mwis,
            coverage: self.coverage,
            fold_interval_scores: self.folds.iter().map(|f| f.interval_score).collect(),
            fold_mae: self.folds.iter().map(|f| f.mae).collect(),
            train_valid_weeks: self
                .folds
                .iter()
                .map(|f| {
                    (
                        f.train_weeks.iter().map(|w| w.to_string()).collect(),
                        f.validation_weeks.iter().map(|w| w.to_string()).collect(),
                    )
                })
                .collect(),
        }
    }
}

/// Ordering used to split trials into good and bad: feasible by score,
/// then infeasible by shortfall, then pruned by partial score.
fn rank(a: &Trial, b: &Trial, min_coverage: f64) -> Ordering {
    let key = |t: &Trial| match t.state {
        TrialState::Complete => (0, t.mwis),
        TrialState::Infeasible => (1, t.coverage_shortfall(min_coverage)),
        TrialState::Pruned => (2, t.mwis),
    };
    let (tier_a, value_a) = key(a);
    let (tier_b, value_b) = key(b);
    tier_a.cmp(&tier_b).then(value_a.total_cmp(&value_b))
}

// ==================== Sampler ====================

/// Mixture of Gaussians over one parameter's internal range, with a wide
/// prior component.
struct Parzen {
    means: Vec<f64>,
    sigmas: Vec<f64>,
}

impl Parzen {
    fn fit(observations: &[f64], low: f64, high: f64) -> Self {
        let span = high - low;
        let n = observations.len().max(1) as f64;
        let bandwidth = (span * n.powf(-0.2)).clamp(span * 0.01, span);

        let mut means = observations.to_vec();
        let mut sigmas = vec![bandwidth; observations.len()];
        means.push((low + high) / 2.0);
        sigmas.push(span);
        Self { means, sigmas }
    }

    fn sample(&self, rng: &mut StdRng, low: f64, high: f64) -> f64 {
        let component = rng.random_range(0..self.means.len());
        let z: f64 = rng.sample(StandardNormal);
        (self.means[component] + z * self.sigmas[component]).clamp(low, high)
    }

    fn log_density(&self, x: f64) -> f64 {
        let total: f64 = self
            .means
            .iter()
            .zip(&self.sigmas)
            .map(|(mean, sigma)| {
                let u = (x - mean) / sigma;
                (-0.5 * u * u).exp() / sigma
            })
            .sum();
        (total / self.means.len() as f64).max(f64::MIN_POSITIVE).ln()
    }
}

/// Seeded tree-structured Parzen estimator.
#[derive(Debug)]
pub struct TpeSampler {
    rng: StdRng,
    n_startup_trials: usize,
    min_coverage: f64,
}

impl TpeSampler {
    pub fn new(seed: u64, n_startup_trials: usize, min_coverage: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            n_startup_trials,
            min_coverage,
        }
    }

    /// Values for every range of `space`, given the trials run so far.
    pub fn sample(&mut self, space: &SearchSpace, history: &[Trial]) -> ParamOverrides {
        if history.is_empty() || history.len() < self.n_startup_trials {
            return space
                .ranges()
                .iter()
                .map(|range| (range.key, range.sample_uniform(&mut self.rng)))
                .collect();
        }

        let mut ranked: Vec<&Trial> = history.iter().collect();
        ranked.sort_by(|a, b| rank(a, b, self.min_coverage));
        let n_good = ((GOOD_FRACTION * ranked.len() as f64).ceil() as usize)
            .clamp(1, MAX_GOOD_TRIALS)
            .min(ranked.len());
        let (good, bad) = ranked.split_at(n_good);

        space
            .ranges()
            .iter()
            .map(|range| (range.key, self.sample_range(range, good, bad)))
            .collect()
    }

    fn sample_range(&mut self, range: &ParamRange, good: &[&Trial], bad: &[&Trial]) -> f64 {
        let (low, high) = range.internal_bounds();
        if high <= low {
            return range.from_internal(low);
        }
        let observed = |trials: &[&Trial]| -> Vec<f64> {
            trials
                .iter()
                .filter_map(|t| t.overrides.get(&range.key))
                .map(|v| range.to_internal(*v))
                .collect()
        };
        let below = Parzen::fit(&observed(good), low, high);
        let above = Parzen::fit(&observed(bad), low, high);

        let mut best = low;
        let mut best_ratio = f64::NEG_INFINITY;
        for _ in 0..EI_CANDIDATES {
            let candidate = below.sample(&mut self.rng, low, high);
            let ratio = below.log_density(candidate) - above.log_density(candidate);
            if ratio > best_ratio {
                best_ratio = ratio;
                best = candidate;
            }
        }
        range.from_internal(best)
    }
}

// ==================== Pruner ====================

/// Abandons a trial whose running score is worse than the median of
/// finished trials at the same fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MedianPruner {
    /// Finished trials required before pruning starts
    pub n_startup_trials: usize,
    /// Folds always completed before pruning is considered
    pub n_warmup_steps: usize,
}

impl Default for MedianPruner {
    fn default() -> Self {
        Self {
            n_startup_trials: 5,
            n_warmup_steps: 0,
        }
    }
}

impl MedianPruner {
    pub fn should_prune(&self, step: usize, value: f64, history: &[Trial]) -> bool {
        if step < self.n_warmup_steps {
            return false;
        }
        let mut reference: Vec<f64> = history
            .iter()
            .filter(|t| t.is_finished())
            .filter_map(|t| t.intermediate.get(step).copied())
            .collect();
        if reference.is_empty() || reference.len() < self.n_startup_trials {
            return false;
        }
        reference.sort_by(f64::total_cmp);
        let mid = reference.len() / 2;
        let median = if reference.len() % 2 == 0 {
            (reference[mid - 1] + reference[mid]) / 2.0
        } else {
            reference[mid]
        };
        value > median
    }
}

// ==================== Study ====================

/// Budget and constraint settings of a study.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub n_trials: usize,
    pub timeout: Duration,
    pub seed: u64,
    pub n_startup_trials: usize,
    pub min_coverage: f64,
    pub pruner: Option<MedianPruner>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            n_trials: 30,
            timeout: Duration::from_secs(1800),
            seed: 2,
            n_startup_trials: 9,
            min_coverage: 0.8,
            pruner: Some(MedianPruner::default()),
        }
    }
}

impl SearchSettings {
    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.min_coverage && self.min_coverage < 1.0) {
            return Err(ForecastError::InvalidParameter(format!(
                "min_coverage should be between 0 and 1, got {}",
                self.min_coverage
            )));
        }
        if self.n_trials == 0 {
            return Err(ForecastError::InvalidParameter(
                "n_trials must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of a study.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best: Trial,
    pub trials: Vec<Trial>,
    /// No trial met the coverage floor; `best` is the lowest-MWIS trial
    pub used_fallback: bool,
}

/// Pick the feasible trial with the lowest MWIS, falling back to the
/// lowest-MWIS finished trial when none is feasible.
pub fn select_best(trials: &[Trial]) -> Result<(&Trial, bool)> {
    let by_score = |a: &&Trial, b: &&Trial| a.mwis.total_cmp(&b.mwis);

    if let Some(best) = trials
        .iter()
        .filter(|t| t.state == TrialState::Complete)
        .min_by(by_score)
    {
        return Ok((best, false));
    }

    let fallback = trials
        .iter()
        .filter(|t| t.is_finished())
        .min_by(by_score)
        .ok_or(ForecastError::NoCompletedTrials)?;
    tracing::warn!(
        "No trial reached the coverage floor; falling back to trial {} (MWIS {:.4}, coverage {:.3})",
        fallback.number,
        fallback.mwis,
        fallback.coverage
    );
    Ok((fallback, true))
}

/// Runs trials until the trial budget or the timeout is exhausted.
pub struct HyperparameterSearch<'a> {
    pub validator: WalkForwardValidator<'a>,
    pub settings: &'a SearchSettings,
    pub quantiles: QuantileLevels,
    pub clock: &'a dyn Clock,
}

impl HyperparameterSearch<'_> {
    pub fn run(&self, rows: &[Observation], space: &SearchSpace) -> Result<SearchOutcome> {
        self.settings.validate()?;
        let mut sampler = TpeSampler::new(
            self.settings.seed,
            self.settings.n_startup_trials,
            self.settings.min_coverage,
        );
        let started = self.clock.now_utc();
        let mut trials: Vec<Trial> = Vec::new();

        tracing::info!(
            "Starting {} search: up to {} trials, timeout {:?}",
            if space.is_warm() { "warm-start" } else { "cold-start" },
            self.settings.n_trials,
            self.settings.timeout
        );

        while trials.len() < self.settings.n_trials {
            let trial = self.run_trial(trials.len(), rows, space, &mut sampler, &trials)?;
            tracing::info!(
                "Trial {} {:?}: MWIS {:.4}, coverage {:.3}",
                trial.number,
                trial.state,
                trial.mwis,
                trial.coverage
            );
            trials.push(trial);

            let elapsed = (self.clock.now_utc() - started).to_std().unwrap_or_default();
            if elapsed >= self.settings.timeout {
                tracing::info!("Search timed out after {} trials", trials.len());
                break;
            }
        }

        let (best, used_fallback) = select_best(&trials)?;
        let best = best.clone();
        tracing::info!(
            "Best trial {}: MWIS {:.4}, coverage {:.3}",
            best.number,
            best.mwis,
            best.coverage
        );
        Ok(SearchOutcome {
            best,
            trials,
            used_fallback,
        })
    }

    fn run_trial(
        &self,
        number: usize,
        rows: &[Observation],
        space: &SearchSpace,
        sampler: &mut TpeSampler,
        history: &[Trial],
    ) -> Result<Trial> {
        let started_at = self.clock.now_utc();
        let overrides = sampler.sample(space, history);
        let params = space.resolve(&overrides);
        let spec = ModelSpec::new(params, self.quantiles, self.settings.seed);

        let mut intermediate = Vec::new();
        let pruner = self.settings.pruner;
        let run = self.validator.evaluate_with(rows, &spec, &mut |step, score| {
            intermediate.push(score.mwis);
            match pruner {
                Some(p) if p.should_prune(step, score.mwis, history) => FoldControl::Prune,
                _ => FoldControl::Continue,
            }
        })?;

        let (state, score, folds) = match run {
            CvRun::Completed(outcome) => {
                let state = if outcome.score.coverage >= self.settings.min_coverage {
                    TrialState::Complete
                } else {
                    TrialState::Infeasible
                };
                (state, outcome.score, outcome.folds)
            }
            CvRun::Pruned { partial, folds } => (TrialState::Pruned, partial, folds),
        };

        Ok(Trial {
            number,
            state,
            overrides,
            params,
            mwis: score.mwis,
            coverage: score.coverage,
            folds,
            intermediate,
            started_at,
            completed_at: self.clock.now_utc(),
        })
    }
}
