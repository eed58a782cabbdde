//! Histogram gradient-boosted trees, one ensemble per quantile level.
//!
//! Each ensemble starts at the empirical quantile of the targets and adds
//! trees whose splits follow the pinball-loss gradient and whose leaves move
//! towards the quantile of the residuals they hold. Calendar features are
//! split by category equality, the time of day by threshold.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::features::{Dataset, FeatureRow};
use super::model::{ModelSpec, QuantileRegressor};
use super::params::ModelParams;
use crate::error::{ForecastError, Result};

/// Maximum number of histogram bins per numeric feature
const MAX_BINS: usize = 64;
const CATEGORY_TOLERANCE: f64 = 1e-9;

// ==================== Trees ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        categorical: bool,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict(&self, x: &[f64]) -> f64 {
        let mut index = 0;
        while let Some(node) = self.nodes.get(index) {
            match node {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    categorical,
                    left,
                    right,
                } => {
                    let value = x.get(*feature).copied().unwrap_or(f64::NAN);
                    let goes_left = if *categorical {
                        (value - threshold).abs() < CATEGORY_TOLERANCE
                    } else {
                        value <= *threshold
                    };
                    index = if goes_left { *left } else { *right };
                }
            }
        }
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct QuantileEnsemble {
    level: f64,
    base: f64,
    trees: Vec<Tree>,
}

impl QuantileEnsemble {
    fn predict(&self, x: &[f64]) -> f64 {
        self.base + self.trees.iter().map(|tree| tree.predict(x)).sum::<f64>()
    }
}

// ==================== Binning ====================

#[derive(Debug, Clone)]
struct FeatureBins {
    /// Sorted upper edges (numeric) or distinct values (categorical)
    edges: Vec<f64>,
    categorical: bool,
}

impl FeatureBins {
    fn fit(column: &[f64], categorical: bool) -> Self {
        let mut values: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
        values.sort_by(f64::total_cmp);
        values.dedup();

        let edges = if categorical || values.len() <= MAX_BINS {
            values
        } else {
            let mut edges: Vec<f64> = (1..=MAX_BINS)
                .map(|k| values[k * values.len() / MAX_BINS - 1])
                .collect();
            edges.dedup();
            edges
        };
        Self { edges, categorical }
    }

    fn bin(&self, value: f64) -> usize {
        let Some(last) = self.edges.len().checked_sub(1) else {
            return 0;
        };
        if self.categorical {
            match self.edges.binary_search_by(|edge| edge.total_cmp(&value)) {
                Ok(i) => i,
                Err(i) => i.min(last),
            }
        } else {
            self.edges.partition_point(|edge| *edge < value).min(last)
        }
    }
}

struct TrainingMatrix<'a> {
    rows: Vec<Vec<f64>>,
    targets: &'a [f64],
    bins: Vec<FeatureBins>,
    /// Bin index per feature, then per row
    binned: Vec<Vec<usize>>,
}

impl<'a> TrainingMatrix<'a> {
    fn new(data: &'a Dataset, categorical: &[usize]) -> Self {
        let rows: Vec<Vec<f64>> = data.features.iter().map(FeatureRow::to_vec).collect();
        let bins: Vec<FeatureBins> = (0..FeatureRow::NUM_FEATURES)
            .map(|feature| {
                let column: Vec<f64> = rows.iter().map(|row| row[feature]).collect();
                FeatureBins::fit(&column, categorical.contains(&feature))
            })
            .collect();
        let binned = bins
            .iter()
            .enumerate()
            .map(|(feature, bins)| rows.iter().map(|row| bins.bin(row[feature])).collect())
            .collect();
        Self {
            rows,
            targets: &data.targets,
            bins,
            binned,
        }
    }
}

struct EvalSet<'a> {
    rows: Vec<Vec<f64>>,
    targets: &'a [f64],
}

// ==================== Tree Growing ====================

struct SplitCandidate {
    feature: usize,
    bin: usize,
    categorical: bool,
    score: f64,
}

impl SplitCandidate {
    fn goes_left(&self, bin: usize) -> bool {
        if self.categorical {
            bin == self.bin
        } else {
            bin <= self.bin
        }
    }
}

struct TreeGrower<'a> {
    matrix: &'a TrainingMatrix<'a>,
    gradients: &'a [f64],
    residuals: &'a [f64],
    /// Features allowed at each depth
    level_features: Vec<Vec<usize>>,
    params: &'a ModelParams,
    level: f64,
    noise_sd: f64,
    rng: &'a mut StdRng,
    nodes: Vec<Node>,
}

impl TreeGrower<'_> {
    fn build(mut self, rows: &[usize]) -> Tree {
        self.grow(rows, 0);
        Tree { nodes: self.nodes }
    }

    fn grow(&mut self, rows: &[usize], depth: usize) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node::Leaf { value: 0.0 });

        let split = if depth < self.params.depth && rows.len() >= 2 {
            self.best_split(rows, depth)
        } else {
            None
        };

        match split {
            Some(candidate) => {
                let binned = &self.matrix.binned[candidate.feature];
                let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
                    .iter()
                    .copied()
                    .partition(|row| candidate.goes_left(binned[*row]));
                let left = self.grow(&left_rows, depth + 1);
                let right = self.grow(&right_rows, depth + 1);
                self.nodes[index] = Node::Split {
                    feature: candidate.feature,
                    threshold: self.matrix.bins[candidate.feature].edges[candidate.bin],
                    categorical: candidate.categorical,
                    left,
                    right,
                };
            }
            None => {
                self.nodes[index] = Node::Leaf {
                    value: self.leaf_value(rows),
                };
            }
        }
        index
    }

    fn best_split(&mut self, rows: &[usize], depth: usize) -> Option<SplitCandidate> {
        let l2 = self.params.l2_leaf_reg;
        let total_sum: f64 = rows.iter().map(|row| self.gradients[*row]).sum();
        let total_n = rows.len();
        let parent = total_sum * total_sum / (total_n as f64 + l2);

        let features = self.level_features.get(depth).cloned().unwrap_or_default();
        let mut best: Option<SplitCandidate> = None;

        for feature in features {
            let bins = &self.matrix.bins[feature];
            let n_bins = bins.edges.len();
            if n_bins < 2 {
                continue;
            }
            let categorical = bins.categorical;

            let mut sums = vec![0.0; n_bins];
            let mut counts = vec![0usize; n_bins];
            for row in rows {
                let bin = self.matrix.binned[feature][*row];
                sums[bin] += self.gradients[*row];
                counts[bin] += 1;
            }

            let mut left_sum = 0.0;
            let mut left_n = 0;
            for bin in 0..n_bins {
                let (ls, ln) = if categorical {
                    (sums[bin], counts[bin])
                } else {
                    left_sum += sums[bin];
                    left_n += counts[bin];
                    (left_sum, left_n)
                };
                let rn = total_n - ln;
                if ln == 0 || rn == 0 {
                    continue;
                }
                let rs = total_sum - ls;
                let gain = ls * ls / (ln as f64 + l2) + rs * rs / (rn as f64 + l2) - parent;
                if gain <= self.params.model_size_reg {
                    continue;
                }
                let score = gain + self.noise();
                if best.as_ref().is_none_or(|current| score > current.score) {
                    best = Some(SplitCandidate {
                        feature,
                        bin,
                        categorical,
                        score,
                    });
                }
            }
        }
        best
    }

    fn noise(&mut self) -> f64 {
        if self.noise_sd > 0.0 {
            let z: f64 = self.rng.sample(StandardNormal);
            z * self.noise_sd
        } else {
            0.0
        }
    }

    fn leaf_value(&self, rows: &[usize]) -> f64 {
        if rows.is_empty() {
            return 0.0;
        }
        let mut values: Vec<f64> = rows.iter().map(|row| self.residuals[*row]).collect();
        let n = values.len() as f64;
        let shrink = n / (n + self.params.l2_leaf_reg);
        self.params.learning_rate * shrink * quantile_of(&mut values, self.level)
    }
}

/// Empirical quantile with linear interpolation; sorts `values` in place.
fn quantile_of(values: &mut [f64], level: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let position = level.clamp(0.0, 1.0) * (values.len() - 1) as f64;
    let lo = position.floor() as usize;
    let hi = position.ceil() as usize;
    values[lo] + (values[hi] - values[lo]) * (position - lo as f64)
}

fn pinball_loss(targets: &[f64], fitted: &[f64], level: f64) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    targets
        .iter()
        .zip(fitted)
        .map(|(y, f)| {
            let diff = y - f;
            if diff >= 0.0 {
                level * diff
            } else {
                (level - 1.0) * diff
            }
        })
        .sum::<f64>()
        / targets.len() as f64
}

// ==================== Model ====================

/// Gradient-boosted quantile regressor registered as `gbdt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedQuantiles {
    spec: ModelSpec,
    ensembles: Vec<QuantileEnsemble>,
}

impl GradientBoostedQuantiles {
    pub const FAMILY: &'static str = "gbdt";

    pub fn new(spec: ModelSpec) -> Self {
        Self {
            spec,
            ensembles: Vec::new(),
        }
    }

    pub fn is_fitted(&self) -> bool {
        !self.ensembles.is_empty()
    }

    /// Trees kept per quantile after early stopping.
    pub fn tree_counts(&self) -> Vec<usize> {
        self.ensembles.iter().map(|e| e.trees.len()).collect()
    }

    fn boost(
        &self,
        level: f64,
        train: &TrainingMatrix<'_>,
        eval: Option<&EvalSet<'_>>,
        rng: &mut StdRng,
    ) -> QuantileEnsemble {
        let params = &self.spec.params;
        let n = train.targets.len();
        let base = quantile_of(&mut train.targets.to_vec(), level);
        let n_columns = ((params.colsample_bylevel * FeatureRow::NUM_FEATURES as f64).ceil()
            as usize)
            .clamp(1, FeatureRow::NUM_FEATURES);

        let mut fitted = vec![base; n];
        let mut eval_fitted = eval
            .map(|e| vec![base; e.targets.len()])
            .unwrap_or_default();
        let mut best_loss = eval
            .map(|e| pinball_loss(e.targets, &eval_fitted, level))
            .unwrap_or(f64::INFINITY);
        let mut best_len = 0;
        let mut stale_rounds = 0;
        let mut trees = Vec::new();

        for iteration in 0..params.n_estimators {
            let residuals: Vec<f64> = train
                .targets
                .iter()
                .zip(&fitted)
                .map(|(y, f)| y - f)
                .collect();
            let gradients: Vec<f64> = residuals
                .iter()
                .map(|r| if *r > 0.0 { level } else { level - 1.0 })
                .collect();

            let mut sample: Vec<usize> = (0..n)
                .filter(|_| rng.random::<f64>() < params.subsample)
                .collect();
            if sample.is_empty() {
                sample = (0..n).collect();
            }
            let level_features = (0..params.depth)
                .map(|_| {
                    rand::seq::index::sample(&mut *rng, FeatureRow::NUM_FEATURES, n_columns)
                        .into_vec()
                })
                .collect();

            let progress = iteration as f64 / params.n_estimators as f64;
            let mean_sq_gradient =
                sample.iter().map(|row| gradients[*row].powi(2)).sum::<f64>() / sample.len() as f64;

            let tree = TreeGrower {
                matrix: train,
                gradients: &gradients,
                residuals: &residuals,
                level_features,
                params,
                level,
                noise_sd: params.random_strength * mean_sq_gradient * (1.0 - progress),
                rng: &mut *rng,
                nodes: Vec::new(),
            }
            .build(&sample);

            for (value, row) in fitted.iter_mut().zip(&train.rows) {
                *value += tree.predict(row);
            }

            if let Some(eval) = eval {
                for (value, row) in eval_fitted.iter_mut().zip(&eval.rows) {
                    *value += tree.predict(row);
                }
                trees.push(tree);

                let loss = pinball_loss(eval.targets, &eval_fitted, level);
                if loss < best_loss {
                    best_loss = loss;
                    best_len = trees.len();
                    stale_rounds = 0;
                } else {
                    stale_rounds += 1;
                    if stale_rounds >= params.early_stopping_rounds.max(1) {
                        break;
                    }
                }
            } else {
                trees.push(tree);
            }
        }

        if eval.is_some() {
            trees.truncate(best_len);
        }
        QuantileEnsemble { level, base, trees }
    }
}

impl QuantileRegressor for GradientBoostedQuantiles {
    fn family(&self) -> &str {
        Self::FAMILY
    }

    fn params(&self) -> &ModelParams {
        &self.spec.params
    }

    fn fit(&mut self, train: &Dataset, eval: Option<&Dataset>) -> Result<()> {
        self.spec.params.validate()?;
        if train.is_empty() {
            return Err(ForecastError::Fit("training set is empty".to_string()));
        }
        if train.features.len() != train.targets.len() {
            return Err(ForecastError::Fit(format!(
                "{} feature rows but {} targets",
                train.features.len(),
                train.targets.len()
            )));
        }
        if train.targets.iter().any(|y| !y.is_finite()) {
            return Err(ForecastError::Fit("training targets must be finite".to_string()));
        }

        let matrix = TrainingMatrix::new(train, &self.spec.categorical_features);
        let eval_set = eval.filter(|e| !e.is_empty()).map(|e| EvalSet {
            rows: e.features.iter().map(FeatureRow::to_vec).collect(),
            targets: &e.targets,
        });
        let mut rng = StdRng::seed_from_u64(self.spec.seed);

        let ensembles: Vec<QuantileEnsemble> = self
            .spec
            .quantiles
            .levels()
            .iter()
            .map(|level| self.boost(*level, &matrix, eval_set.as_ref(), &mut rng))
            .collect();

        tracing::debug!(
            "Fitted {} on {} rows, trees per quantile {:?}",
            Self::FAMILY,
            train.len(),
            ensembles.iter().map(|e| e.trees.len()).collect::<Vec<_>>()
        );
        self.ensembles = ensembles;
        Ok(())
    }

    fn predict(&self, features: &[FeatureRow]) -> Result<Vec<Vec<f64>>> {
        if !self.is_fitted() {
            return Err(ForecastError::Fit(
                "model must be fitted before predicting".to_string(),
            ));
        }
        Ok(features
            .iter()
            .map(|row| {
                let x = row.to_vec();
                self.ensembles.iter().map(|e| e.predict(&x)).collect()
            })
            .collect())
    }

    fn to_artifact(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::scoring::QuantileLevels;

    fn row(minutes: f64, weekday: f64) -> FeatureRow {
        FeatureRow {
            minutes_from_daystart: minutes,
            weekday,
            holiday: 0.0,
            bridge_day: 0.0,
        }
    }

    /// Daytime rows near 50, night rows near 10, with deterministic jitter.
    fn day_night(n: usize) -> Dataset {
        let mut data = Dataset::default();
        for i in 0..n {
            let jitter = (i * 37 % 11) as f64 - 5.0;
            let (minutes, level) = if i % 2 == 0 { (600.0, 50.0) } else { (120.0, 10.0) };
            data.features.push(row(minutes, (i % 7) as f64));
            data.targets.push(level + jitter);
        }
        data
    }

    fn quiet_params() -> ModelParams {
        ModelParams {
            n_estimators: 150,
            learning_rate: 0.1,
            depth: 3,
            l2_leaf_reg: 1.0,
            model_size_reg: 0.0,
            random_strength: 0.0,
            colsample_bylevel: 1.0,
            subsample: 1.0,
            early_stopping_rounds: 20,
        }
    }

    fn model(params: ModelParams) -> GradientBoostedQuantiles {
        GradientBoostedQuantiles::new(ModelSpec::new(params, QuantileLevels::default(), 3))
    }

    // ==================== Helper Tests ====================

    #[test]
    fn test_quantile_of_interpolates() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0];
        assert_eq!(quantile_of(&mut values, 0.5), 2.5);
        assert_eq!(quantile_of(&mut values, 0.0), 1.0);
        assert_eq!(quantile_of(&mut values, 1.0), 4.0);
    }

    #[test]
    fn test_pinball_loss_is_asymmetric() {
        // under-prediction costs q, over-prediction costs 1 - q
        assert!((pinball_loss(&[10.0], &[8.0], 0.9) - 1.8).abs() < 1e-12);
        assert!((pinball_loss(&[10.0], &[12.0], 0.9) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_numeric_bins_cap_at_max() {
        let column: Vec<f64> = (0..1440).map(f64::from).collect();
        let bins = FeatureBins::fit(&column, false);
        assert_eq!(bins.edges.len(), MAX_BINS);
        assert_eq!(bins.bin(-5.0), 0);
        assert_eq!(bins.bin(5000.0), MAX_BINS - 1);
    }

    #[test]
    fn test_categorical_bins_keep_distinct_values() {
        let bins = FeatureBins::fit(&[3.0, 0.0, 6.0, 3.0], true);
        assert_eq!(bins.edges, vec![0.0, 3.0, 6.0]);
        assert_eq!(bins.bin(3.0), 1);
    }

    // ==================== Fit / Predict Tests ====================

    #[test]
    fn test_learns_day_night_levels() {
        let data = day_night(280);
        let mut gbdt = model(quiet_params());
        gbdt.fit(&data, None).unwrap();

        let preds = gbdt.predict(&[row(600.0, 2.0), row(120.0, 2.0)]).unwrap();
        let (day, night) = (&preds[0], &preds[1]);

        assert!((day[1] - 50.0).abs() < 3.0, "day median {}", day[1]);
        assert!((night[1] - 10.0).abs() < 3.0, "night median {}", night[1]);
        assert!(day[0] < day[1] && day[1] < day[2]);
        assert!(night[0] < night[1] && night[1] < night[2]);
    }

    #[test]
    fn test_predict_returns_three_columns() {
        let data = day_night(50);
        let mut gbdt = model(quiet_params());
        gbdt.fit(&data, None).unwrap();

        let preds = gbdt.predict(&data.features).unwrap();
        assert_eq!(preds.len(), data.len());
        assert!(preds.iter().all(|p| p.len() == 3 && p.iter().all(|v| v.is_finite())));
    }

    #[test]
    fn test_predict_before_fit_fails() {
        let gbdt = model(quiet_params());
        assert!(matches!(
            gbdt.predict(&[row(0.0, 0.0)]),
            Err(ForecastError::Fit(_))
        ));
    }

    #[test]
    fn test_fit_rejects_empty_training_set() {
        let mut gbdt = model(quiet_params());
        assert!(gbdt.fit(&Dataset::default(), None).is_err());
    }

    #[test]
    fn test_early_stopping_truncates_to_best_iteration() {
        let train = day_night(140);
        // day and night levels swapped, so fitting the training data hurts
        let mut eval = day_night(70);
        eval.targets.iter_mut().for_each(|y| *y = 60.0 - *y);
        let params = ModelParams {
            n_estimators: 500,
            early_stopping_rounds: 5,
            ..quiet_params()
        };
        let mut gbdt = model(params);
        gbdt.fit(&train, Some(&eval)).unwrap();

        assert!(gbdt.tree_counts().iter().all(|count| *count < 500));
    }

    #[test]
    fn test_same_seed_is_deterministic() {
        let data = day_night(120);
        let params = ModelParams {
            subsample: 0.7,
            colsample_bylevel: 0.5,
            random_strength: 0.5,
            n_estimators: 40,
            ..quiet_params()
        };
        let mut first = model(params);
        let mut second = model(params);
        first.fit(&data, None).unwrap();
        second.fit(&data, None).unwrap();

        assert_eq!(
            first.predict(&data.features).unwrap(),
            second.predict(&data.features).unwrap()
        );
    }

    #[test]
    fn test_artifact_round_trip() {
        let data = day_night(60);
        let mut gbdt = model(quiet_params());
        gbdt.fit(&data, None).unwrap();

        let artifact = gbdt.to_artifact().unwrap();
        let restored: GradientBoostedQuantiles = serde_json::from_value(artifact).unwrap();

        assert_eq!(restored.tree_counts(), gbdt.tree_counts());
        let before = gbdt.predict(&data.features).unwrap();
        let after = restored.predict(&data.features).unwrap();
        for (a, b) in before.iter().flatten().zip(after.iter().flatten()) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
