//! Per-floor pipeline: split, augment, search, select, record and forecast.

use chrono::{Datelike, NaiveDate};

use crate::augment::{AugmentInput, augment_cv_window};
use crate::error::{ForecastError, Result};
use crate::forecast::{forecast_window, generate_forecast};
use crate::ml::cv::{WalkForward, WalkForwardValidator};
use crate::ml::model::{ModelRegistry, ModelSpec};
use crate::ml::params::ModelParams;
use crate::ml::persistence::{ModelRepository, RunRecord, RunTags, previous_run_date};
use crate::ml::scoring::QuantileLevels;
use crate::ml::search::{HyperparameterSearch, SearchSettings, SearchSpace};
use crate::ml::selection::{Incumbent, ModelLineage, ModelSelector, TestMetrics, Winner};
use crate::observation::{CalendarRow, Observation, sort_chronologically};
use crate::split::split_cv_test;
use crate::storage::ForecastRecord;
use crate::traits::Clock;

/// Whether this run competes against the floor's previous model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// No previous model exists; search from scratch
    FirstModel,
    /// A model recorded one week earlier must exist
    Continuation,
}

/// Everything a floor run needs besides data and collaborators.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub cv_weeks: usize,
    pub test_weeks: usize,
    pub walk_forward: WalkForward,
    pub search: SearchSettings,
    pub quantiles: QuantileLevels,
    pub holiday_weeks: usize,
    pub bridge_day_weeks: usize,
    pub min_improvement_percent: f64,
    pub model_family: String,
}

/// What one floor run produced.
#[derive(Debug, Clone)]
pub struct FloorReport {
    pub floor: u32,
    pub run_id: String,
    pub run_name: String,
    pub winner: Winner,
    pub params: ModelParams,
    pub metrics: TestMetrics,
    pub improvement_percent: Option<f64>,
    pub trials: usize,
    /// No trial met the coverage floor
    pub used_fallback: bool,
    pub forecast: Vec<ForecastRecord>,
}

/// Latest observation date across all floors; the run is tagged with it.
pub fn latest_date(rows: &[Observation]) -> Option<NaiveDate> {
    rows.iter().map(CalendarRow::date).max()
}

/// Run name under which the production model is recorded.
pub fn run_name(winner: Winner, run_date: NaiveDate, floor: u32) -> String {
    let prefix = match winner {
        Winner::Challenger => "study_model",
        Winner::Incumbent => "prev_model",
    };
    format!("{prefix}_{}_{floor}", run_date.iso_week().week())
}

pub struct FloorPipeline<'a> {
    pub settings: &'a PipelineSettings,
    pub registry: &'a ModelRegistry,
    pub repository: &'a dyn ModelRepository,
    pub clock: &'a dyn Clock,
}

impl FloorPipeline<'_> {
    /// Resolve the floor's lineage; a continuation without a previous run is
    /// fatal.
    pub fn lineage(&self, floor: u32, run_date: NaiveDate, mode: RunMode) -> Result<ModelLineage> {
        if mode == RunMode::FirstModel {
            return Ok(ModelLineage::Bootstrap);
        }
        let record = self
            .repository
            .find_previous(floor, run_date)?
            .ok_or(ForecastError::MissingIncumbent {
                floor,
                run_date: previous_run_date(run_date),
            })?;
        let params = record.model_params()?;
        let model = self.registry.load(&record.model_family, record.artifact)?;
        Ok(ModelLineage::Continuation(Incumbent {
            run_id: record.run_id,
            params,
            model,
        }))
    }

    pub fn run_floor(
        &self,
        history: &[Observation],
        floor: u32,
        run_date: NaiveDate,
        mode: RunMode,
    ) -> Result<FloorReport> {
        let settings = self.settings;
        tracing::info!("Floor {}: starting {:?} run for {}", floor, mode, run_date);

        let lineage = self.lineage(floor, run_date, mode)?;

        let mut rows: Vec<Observation> =
            history.iter().filter(|row| row.floor == floor).cloned().collect();
        sort_chronologically(&mut rows);

        let split = split_cv_test(&rows, settings.cv_weeks, settings.test_weeks)?;
        let window = forecast_window(&split.test)?;
        let cv = augment_cv_window(
            AugmentInput {
                cv: &split.cv,
                test: &split.test,
                forecast_window: &window,
                history: &split.history,
            },
            settings.holiday_weeks,
            settings.bridge_day_weeks,
        );

        let space = match lineage.prior_params() {
            Some(prior) => SearchSpace::warm_start(prior),
            None => SearchSpace::cold_start(),
        };
        let search = HyperparameterSearch {
            validator: WalkForwardValidator {
                splitter: &settings.walk_forward,
                registry: self.registry,
                family: &settings.model_family,
            },
            settings: &settings.search,
            quantiles: settings.quantiles,
            clock: self.clock,
        };
        let outcome = search.run(&cv, &space)?;

        let selector = ModelSelector {
            registry: self.registry,
            family: &settings.model_family,
            spec: ModelSpec::new(outcome.best.params, settings.quantiles, settings.search.seed),
            min_improvement_percent: settings.min_improvement_percent,
        };
        let decision = selector.decide(
            &outcome.best.params,
            &outcome.best.overrides,
            &cv,
            &split.test,
            &lineage,
        )?;
        decision.params.validate()?;

        let record = RunRecord::new(
            run_name(decision.winner, run_date, floor),
            self.clock.now_utc(),
            RunTags::for_floor(floor, run_date),
            settings.model_family.clone(),
            &decision.params,
            decision.metrics.mwis,
            decision.metrics.mae,
            decision.production_model.to_artifact()?,
        )
        .with_trial(&outcome.best.summary())?;
        self.repository.record(&record)?;

        let forecast = generate_forecast(decision.production_model.as_ref(), &window)?;
        tracing::info!(
            "Floor {}: {} recorded as {}, {} forecast rows",
            floor,
            decision.winner,
            record.run_name,
            forecast.len()
        );

        Ok(FloorReport {
            floor,
            run_id: record.run_id,
            run_name: record.run_name,
            winner: decision.winner,
            params: decision.params,
            metrics: decision.metrics,
            improvement_percent: decision.improvement_percent,
            trials: outcome.trials.len(),
            used_fallback: outcome.used_fallback,
            forecast,
        })
    }

    /// Run every floor in turn. A failing floor is logged and reported while
    /// the remaining floors still run.
    pub fn run_floors(
        &self,
        history: &[Observation],
        floors: &[u32],
        run_date: NaiveDate,
        mode: RunMode,
    ) -> Vec<(u32, Result<FloorReport>)> {
        floors
            .iter()
            .map(|&floor| {
                let result = self.run_floor(history, floor, run_date, mode);
                if let Err(e) = &result {
                    if e.is_fatal() {
                        tracing::error!("Floor {} aborted: {}", floor, e);
                    } else {
                        tracing::warn!("Floor {} failed: {}", floor, e);
                    }
                }
                (floor, result)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone};

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_run_name_uses_iso_week() {
        assert_eq!(
            run_name(Winner::Challenger, date(2024, 6, 9), 3),
            "study_model_23_3"
        );
        assert_eq!(
            run_name(Winner::Incumbent, date(2024, 12, 30), 1),
            "prev_model_1_1"
        );
    }

    #[test]
    fn test_latest_date_spans_floors() {
        let tz = FixedOffset::east_opt(3600).unwrap();
        let rows = vec![
            Observation::new(tz.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap(), 1, 1.0),
            Observation::new(tz.with_ymd_and_hms(2024, 3, 9, 9, 0, 0).unwrap(), 4, 1.0),
            Observation::new(tz.with_ymd_and_hms(2024, 3, 6, 9, 0, 0).unwrap(), 1, 1.0),
        ];
        assert_eq!(latest_date(&rows), Some(date(2024, 3, 9)));
        assert_eq!(latest_date(&[]), None);
    }
}
