//! Weighted interval score and coverage of central prediction intervals.

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

const LEVEL_TOLERANCE: f64 = 1e-9;

/// The three quantile levels `[α, 0.5, 1 − α]` of a central interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantileLevels {
    alpha: f64,
}

impl QuantileLevels {
    /// Levels `[alpha, 0.5, 1 − alpha]`.
    pub fn from_alpha(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha < 0.5) {
            return Err(ForecastError::InvalidParameter(format!(
                "alpha must be in (0, 0.5), got {alpha}"
            )));
        }
        Ok(Self { alpha })
    }

    /// Validate explicit levels: exactly three, symmetric, median in the middle.
    pub fn from_levels(levels: &[f64]) -> Result<Self> {
        let [lower, median, upper] = levels else {
            return Err(ForecastError::InvalidParameter(format!(
                "expected exactly 3 quantile levels, got {}",
                levels.len()
            )));
        };
        if (median - 0.5).abs() > LEVEL_TOLERANCE || (lower + upper - 1.0).abs() > LEVEL_TOLERANCE
        {
            return Err(ForecastError::InvalidParameter(format!(
                "quantile levels {levels:?} are not a symmetric central interval"
            )));
        }
        Self::from_alpha(*lower)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn levels(&self) -> [f64; 3] {
        [self.alpha, 0.5, 1.0 - self.alpha]
    }

    /// Output column names, e.g. `forecast_q_5`.
    pub fn column_names(&self) -> [String; 3] {
        self.levels()
            .map(|q| format!("forecast_q_{}", (q * 100.0).round() as u32))
    }
}

impl Default for QuantileLevels {
    fn default() -> Self {
        Self { alpha: 0.05 }
    }
}

/// One row of quantile predictions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantileTriple {
    pub lower: f64,
    pub median: f64,
    pub upper: f64,
}

impl TryFrom<&[f64]> for QuantileTriple {
    type Error = ForecastError;

    fn try_from(row: &[f64]) -> Result<Self> {
        match row {
            [lower, median, upper] => Ok(Self {
                lower: *lower,
                median: *median,
                upper: *upper,
            }),
            _ => Err(ForecastError::PredictionShape {
                expected: 3,
                got: row.len(),
            }),
        }
    }
}

impl QuantileTriple {
    /// Interval bounds ordered low to high.
    pub fn bounds(&self) -> (f64, f64) {
        (self.lower.min(self.upper), self.lower.max(self.upper))
    }

    pub fn covers(&self, truth: f64) -> bool {
        let (lo, hi) = self.bounds();
        lo <= truth && truth <= hi
    }
}

/// Convert raw model output to triples, rejecting any row without exactly
/// three columns.
pub fn triples_from_predictions(raw: &[Vec<f64>]) -> Result<Vec<QuantileTriple>> {
    raw.iter()
        .map(|row| QuantileTriple::try_from(row.as_slice()))
        .collect()
}

/// Weighted interval score of one prediction.
///
/// Each quantile at level `q` is penalized by `2(1 − q)(pred − truth)` when
/// the truth does not exceed it and by `2q(truth − pred)` otherwise; the
/// three penalties are summed and scaled by `2 / 3`.
pub fn interval_score(truth: f64, pred: &QuantileTriple, levels: &QuantileLevels) -> f64 {
    let penalty = |value: f64, q: f64| {
        if truth <= value {
            2.0 * (1.0 - q) * (value - truth)
        } else {
            2.0 * q * (truth - value)
        }
    };

    let [lo, mid, hi] = levels.levels();
    let sum = penalty(pred.lower, lo) + penalty(pred.median, mid) + penalty(pred.upper, hi);
    2.0 * sum / 3.0
}

/// Aggregate of interval scores over a set of rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntervalScore {
    /// Mean weighted interval score
    pub mwis: f64,
    /// Share of truths inside `[lower, upper]`
    pub coverage: f64,
    pub count: usize,
}

/// Mean interval score and empirical coverage over paired rows.
pub fn mean_interval_score(
    truth: &[f64],
    preds: &[QuantileTriple],
    levels: &QuantileLevels,
) -> Result<IntervalScore> {
    if truth.len() != preds.len() {
        return Err(ForecastError::PredictionShape {
            expected: truth.len(),
            got: preds.len(),
        });
    }
    if truth.is_empty() {
        return Err(ForecastError::InvalidParameter(
            "cannot score an empty set of predictions".to_string(),
        ));
    }

    let n = truth.len() as f64;
    let total: f64 = truth
        .iter()
        .zip(preds)
        .map(|(y, p)| interval_score(*y, p, levels))
        .sum();
    let covered = truth.iter().zip(preds).filter(|(y, p)| p.covers(**y)).count();

    Ok(IntervalScore {
        mwis: total / n,
        coverage: covered as f64 / n,
        count: truth.len(),
    })
}

/// Mean absolute error of the median predictions.
pub fn mean_absolute_error(truth: &[f64], preds: &[QuantileTriple]) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }
    truth
        .iter()
        .zip(preds)
        .map(|(y, p)| (y - p.median).abs())
        .sum::<f64>()
        / truth.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    fn triple(lower: f64, median: f64, upper: f64) -> QuantileTriple {
        QuantileTriple {
            lower,
            median,
            upper,
        }
    }

    fn levels() -> QuantileLevels {
        QuantileLevels::from_alpha(0.05).unwrap()
    }

    // ==================== Quantile Level Tests ====================

    #[test]
    fn test_levels_from_alpha() {
        let [lo, mid, hi] = levels().levels();
        assert!((lo - 0.05).abs() < EPS);
        assert_eq!(mid, 0.5);
        assert!((hi - 0.95).abs() < EPS);
    }

    #[test]
    fn test_levels_column_names() {
        let explicit = QuantileLevels::from_levels(&[0.05, 0.5, 0.95]).unwrap();
        assert_eq!(explicit, levels());
        assert_eq!(
            explicit.column_names(),
            ["forecast_q_5", "forecast_q_50", "forecast_q_95"].map(String::from)
        );
    }

    #[test]
    fn test_levels_reject_bad_shapes() {
        assert!(QuantileLevels::from_levels(&[0.05, 0.95]).is_err());
        assert!(QuantileLevels::from_levels(&[0.05, 0.4, 0.95]).is_err());
        assert!(QuantileLevels::from_levels(&[0.05, 0.5, 0.9]).is_err());
        assert!(QuantileLevels::from_alpha(0.7).is_err());
    }

    #[test]
    fn test_triple_rejects_wrong_width() {
        let raw = vec![vec![1.0, 2.0, 3.0], vec![1.0, 2.0]];
        let result = triples_from_predictions(&raw);
        assert!(matches!(
            result,
            Err(ForecastError::PredictionShape { expected: 3, got: 2 })
        ));
    }

    // ==================== Interval Score Tests ====================

    #[test]
    fn test_score_with_truth_at_median() {
        // 2*0.05*5 + 0 + 2*0.05*5 = 1, scaled by 2/3
        let score = interval_score(10.0, &triple(5.0, 10.0, 15.0), &levels());
        assert!((score - 2.0 / 3.0).abs() < EPS);
    }

    #[test]
    fn test_score_above_upper_bound() {
        // 2*0.05*15 + 2*0.5*10 + 2*0.95*5 = 21, scaled by 2/3
        let score = interval_score(20.0, &triple(5.0, 10.0, 15.0), &levels());
        assert!((score - 14.0).abs() < EPS);
    }

    #[test]
    fn test_mean_score_and_coverage() {
        let preds = [triple(5.0, 10.0, 15.0)];
        let inside = mean_interval_score(&[10.0], &preds, &levels()).unwrap();
        let outside = mean_interval_score(&[20.0], &preds, &levels()).unwrap();

        assert_eq!(inside.coverage, 1.0);
        assert_eq!(outside.coverage, 0.0);
        assert!(outside.mwis > inside.mwis);
        assert_eq!(outside.count, 1);
    }

    #[test]
    fn test_mean_score_is_arithmetic_mean() {
        let preds = [triple(5.0, 10.0, 15.0), triple(5.0, 10.0, 15.0)];
        let score = mean_interval_score(&[10.0, 20.0], &preds, &levels()).unwrap();
        assert!((score.mwis - (2.0 / 3.0 + 14.0) / 2.0).abs() < EPS);
        assert_eq!(score.coverage, 0.5);
    }

    #[test]
    fn test_coverage_tolerates_crossed_bounds() {
        let preds = [triple(15.0, 10.0, 5.0)];
        let score = mean_interval_score(&[12.0], &preds, &levels()).unwrap();
        assert_eq!(score.coverage, 1.0);
    }

    #[test]
    fn test_coverage_bounds_are_inclusive() {
        let preds = [triple(5.0, 10.0, 15.0)];
        let score = mean_interval_score(&[15.0], &preds, &levels()).unwrap();
        assert_eq!(score.coverage, 1.0);
    }

    #[test]
    fn test_mean_score_rejects_mismatched_lengths() {
        let preds = [triple(1.0, 2.0, 3.0)];
        assert!(mean_interval_score(&[1.0, 2.0], &preds, &levels()).is_err());
        assert!(mean_interval_score(&[], &[], &levels()).is_err());
    }

    #[test]
    fn test_mean_absolute_error_uses_median() {
        let preds = [triple(0.0, 4.0, 9.0), triple(0.0, 6.0, 9.0)];
        assert!((mean_absolute_error(&[5.0, 5.0], &preds) - 1.0).abs() < EPS);
    }

    // ==================== Property-Based Tests ====================

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn score_is_non_negative(
                y in -100.0f64..100.0,
                lo in -100.0f64..0.0,
                width in 0.0f64..50.0,
                alpha in 0.01f64..0.49,
            ) {
                let pred = triple(lo, lo + width / 2.0, lo + width);
                let levels = QuantileLevels::from_alpha(alpha).unwrap();
                prop_assert!(interval_score(y, &pred, &levels) >= 0.0);
            }

            #[test]
            fn score_is_smallest_at_median(offset in -30.0f64..30.0) {
                let pred = triple(5.0, 10.0, 15.0);
                let at_median = interval_score(10.0, &pred, &levels());
                prop_assert!(interval_score(10.0 + offset, &pred, &levels()) >= at_median - EPS);
            }

            #[test]
            fn score_grows_moving_away_beyond_bounds(
                start in 0.0f64..20.0,
                step in 0.1f64..20.0,
            ) {
                let pred = triple(5.0, 10.0, 15.0);
                let up = interval_score(15.0 + start, &pred, &levels());
                let further_up = interval_score(15.0 + start + step, &pred, &levels());
                let down = interval_score(5.0 - start, &pred, &levels());
                let further_down = interval_score(5.0 - start - step, &pred, &levels());
                prop_assert!(further_up > up);
                prop_assert!(further_down > down);
            }

            #[test]
            fn coverage_is_a_share(
                truths in proptest::collection::vec(-10.0f64..10.0, 1..50),
            ) {
                let preds: Vec<_> = truths.iter().map(|_| triple(-5.0, 0.0, 5.0)).collect();
                let score = mean_interval_score(&truths, &preds, &levels()).unwrap();
                prop_assert!((0.0..=1.0).contains(&score.coverage));
            }
        }
    }
}
