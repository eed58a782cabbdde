use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::ml::cv::{WalkForward, WindowPolicy};
use crate::ml::scoring::QuantileLevels;
use crate::ml::search::{MedianPruner, SearchSettings};
use crate::pipeline::PipelineSettings;
use crate::storage::{ForecastRecord, WriteMode};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub cross_validation: CrossValidationConfig,
    pub backfill: BackfillConfig,
    pub selection: SelectionConfig,
    pub quantiles: QuantilesConfig,
    pub model: ModelConfig,
    pub storage: StorageConfig,
    pub preprocess: PreprocessConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    pub floors: Vec<u32>,
    pub cv_weeks: usize,
    pub test_weeks: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            floors: vec![1, 3, 4, 5],
            cv_weeks: 15,
            test_weeks: 1,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrossValidationConfig {
    pub window_policy: WindowPolicy,
    /// Validation offsets in weeks
    pub forecast_weeks: Vec<usize>,
    pub train_weeks: usize,
    pub step_weeks: usize,
    pub n_trials: usize,
    pub timeout_secs: u64,
    pub seed: u64,
    pub n_startup_trials: usize,
    pub min_coverage: f64,
    pub pruning: bool,
}

impl Default for CrossValidationConfig {
    fn default() -> Self {
        Self {
            window_policy: WindowPolicy::Expanding,
            forecast_weeks: vec![1, 2],
            train_weeks: 9,
            step_weeks: 1,
            n_trials: 30,
            timeout_secs: 1800,
            seed: 2,
            n_startup_trials: 9,
            min_coverage: 0.8,
            pruning: true,
        }
    }
}

impl CrossValidationConfig {
    pub fn walk_forward(&self) -> Result<WalkForward> {
        WalkForward::new(
            self.window_policy,
            self.train_weeks,
            self.step_weeks,
            self.forecast_weeks.clone(),
        )
        .context("invalid cross_validation windows")
    }

    pub fn search_settings(&self) -> Result<SearchSettings> {
        let settings = SearchSettings {
            n_trials: self.n_trials,
            timeout: Duration::from_secs(self.timeout_secs),
            seed: self.seed,
            n_startup_trials: self.n_startup_trials,
            min_coverage: self.min_coverage,
            pruner: self.pruning.then(MedianPruner::default),
        };
        settings
            .validate()
            .context("invalid cross_validation search settings")?;
        Ok(settings)
    }
}

/// Weeks to borrow from older history when the upcoming weeks contain
/// holidays or bridge days the CV window barely covers.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct BackfillConfig {
    pub holiday_weeks: usize,
    pub bridge_day_weeks: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            holiday_weeks: 3,
            bridge_day_weeks: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct SelectionConfig {
    pub min_improvement_percent: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_improvement_percent: 0.1,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuantilesConfig {
    pub levels: Vec<f64>,
}

impl Default for QuantilesConfig {
    fn default() -> Self {
        Self {
            levels: vec![0.05, 0.5, 0.95],
        }
    }
}

impl QuantilesConfig {
    /// Validated levels; they must also match the forecast columns.
    pub fn quantile_levels(&self) -> Result<QuantileLevels> {
        let levels =
            QuantileLevels::from_levels(&self.levels).context("invalid quantiles.levels")?;
        ForecastRecord::check_levels(&levels)
            .context("quantiles.levels do not fit the forecast schema")?;
        Ok(levels)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub family: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            family: "gbdt".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Merged local forecast file
    pub forecast_csv: PathBuf,
    /// Year-week partitioned forecast table, written in addition when set
    pub partition_dir: Option<PathBuf>,
    pub write_mode: WriteMode,
    /// Root of the run registry
    pub model_dir: PathBuf,
    pub experiment: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            forecast_csv: PathBuf::from("data/forecast_data.csv"),
            partition_dir: None,
            write_mode: WriteMode::Append,
            model_dir: PathBuf::from("data/runs"),
            experiment: "floor_forecasts".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PreprocessConfig {
    /// Raw energy counter units per kWh
    pub energy_scale_factor: f64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            energy_scale_factor: 100.0,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        // Load .env file (silently ignore if not present)
        let _ = dotenvy::dotenv();

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("floorcast");

        let builder = Config::builder()
            // 1. Load default values
            // Pipeline
            .set_default("pipeline.floors", vec![1, 3, 4, 5])?
            .set_default("pipeline.cv_weeks", 15)?
            .set_default("pipeline.test_weeks", 1)?
            // Cross validation
            .set_default("cross_validation.window_policy", "expanding_window")?
            .set_default("cross_validation.forecast_weeks", vec![1, 2])?
            .set_default("cross_validation.train_weeks", 9)?
            .set_default("cross_validation.step_weeks", 1)?
            .set_default("cross_validation.n_trials", 30)?
            .set_default("cross_validation.timeout_secs", 1800)?
            .set_default("cross_validation.seed", 2)?
            .set_default("cross_validation.n_startup_trials", 9)?
            .set_default("cross_validation.min_coverage", 0.8)?
            .set_default("cross_validation.pruning", true)?
            // Backfill
            .set_default("backfill.holiday_weeks", 3)?
            .set_default("backfill.bridge_day_weeks", 2)?
            // Selection
            .set_default("selection.min_improvement_percent", 0.1)?
            // Quantiles
            .set_default("quantiles.levels", vec![0.05, 0.5, 0.95])?
            // Model
            .set_default("model.family", "gbdt")?
            // Storage
            .set_default("storage.forecast_csv", "data/forecast_data.csv")?
            .set_default("storage.partition_dir", None::<String>)?
            .set_default("storage.write_mode", "append")?
            .set_default("storage.model_dir", "data/runs")?
            .set_default("storage.experiment", "floor_forecasts")?
            // Preprocess
            .set_default("preprocess.energy_scale_factor", 100.0)?

            // 2. Load from local config file (optional, lowest priority)
            .add_source(File::from(PathBuf::from("floorcast.toml")).required(false))

            // 3. Load from user config directory (optional, overrides local)
            .add_source(File::from(config_dir.join("config.toml")).required(false))

            // 4. Load from Environment variables (FLOORCAST__SELECTION__MIN_IMPROVEMENT_PERCENT=...)
            .add_source(Environment::with_prefix("FLOORCAST").separator("__"));

        let s = builder.build()?;
        Ok(s.try_deserialize()?)
    }

    /// Validated settings for the floor pipeline.
    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        Ok(PipelineSettings {
            cv_weeks: self.pipeline.cv_weeks,
            test_weeks: self.pipeline.test_weeks,
            walk_forward: self.cross_validation.walk_forward()?,
            search: self.cross_validation.search_settings()?,
            quantiles: self.quantiles.quantile_levels()?,
            holiday_weeks: self.backfill.holiday_weeks,
            bridge_day_weeks: self.backfill.bridge_day_weeks,
            min_improvement_percent: self.selection.min_improvement_percent,
            model_family: self.model.family.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Default Value Tests ====================

    #[test]
    fn test_pipeline_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.floors, vec![1, 3, 4, 5]);
        assert_eq!(config.cv_weeks, 15);
        assert_eq!(config.test_weeks, 1);
    }

    #[test]
    fn test_cross_validation_defaults_build_settings() {
        let config = CrossValidationConfig::default();
        let walk = config.walk_forward().unwrap();
        assert_eq!(walk.policy, WindowPolicy::Expanding);
        assert_eq!(walk.horizon, vec![1, 2]);
        assert_eq!(walk.window_weeks, 9);

        let settings = config.search_settings().unwrap();
        assert_eq!(settings, SearchSettings::default());
    }

    #[test]
    fn test_search_settings_without_pruning() {
        let config = CrossValidationConfig {
            pruning: false,
            ..Default::default()
        };
        assert!(config.search_settings().unwrap().pruner.is_none());
    }

    #[test]
    fn test_invalid_cross_validation_is_rejected() {
        let config = CrossValidationConfig {
            min_coverage: 1.5,
            ..Default::default()
        };
        assert!(config.search_settings().is_err());

        let config = CrossValidationConfig {
            forecast_weeks: vec![],
            ..Default::default()
        };
        assert!(config.walk_forward().is_err());
    }

    #[test]
    fn test_quantile_levels_validation() {
        let levels = QuantilesConfig::default().quantile_levels().unwrap();
        assert_eq!(levels.levels(), [0.05, 0.5, 0.95]);

        let asymmetric = QuantilesConfig {
            levels: vec![0.1, 0.5, 0.95],
        };
        assert!(asymmetric.quantile_levels().is_err());

        let four = QuantilesConfig {
            levels: vec![0.05, 0.25, 0.75, 0.95],
        };
        assert!(four.quantile_levels().is_err());
    }

    #[test]
    fn test_quantile_levels_outside_forecast_schema_are_rejected() {
        let config = AppConfig {
            quantiles: QuantilesConfig {
                levels: vec![0.1, 0.5, 0.9],
            },
            ..test_config()
        };
        let err = config.pipeline_settings().unwrap_err();
        assert!(format!("{err:#}").contains("forecast_q_10"));
    }

    fn test_config() -> AppConfig {
        AppConfig {
            pipeline: PipelineConfig::default(),
            cross_validation: CrossValidationConfig::default(),
            backfill: BackfillConfig::default(),
            selection: SelectionConfig::default(),
            quantiles: QuantilesConfig::default(),
            model: ModelConfig::default(),
            storage: StorageConfig::default(),
            preprocess: PreprocessConfig::default(),
        }
    }

    #[test]
    fn test_other_defaults() {
        assert_eq!(BackfillConfig::default().holiday_weeks, 3);
        assert_eq!(BackfillConfig::default().bridge_day_weeks, 2);
        assert_eq!(SelectionConfig::default().min_improvement_percent, 0.1);
        assert_eq!(ModelConfig::default().family, "gbdt");
        assert_eq!(PreprocessConfig::default().energy_scale_factor, 100.0);
        assert_eq!(StorageConfig::default().write_mode, WriteMode::Append);
    }

    // ==================== Config Loading Tests ====================

    #[test]
    fn test_config_load_with_defaults() {
        let config = AppConfig::load().expect("Config should load");

        assert!(!config.pipeline.floors.is_empty());
        assert!(config.cross_validation.walk_forward().is_ok());

        let settings = config.pipeline_settings().expect("settings should validate");
        assert_eq!(settings.quantiles.alpha(), 0.05);
        assert_eq!(settings.model_family, "gbdt");
        assert_eq!(config.quantiles.levels.len(), 3);
        assert!(config.storage.partition_dir.is_none());
    }

    // ==================== Environment Variable Override Tests ====================

    /// Helper to safely set and remove environment variables in tests.
    fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        // SAFETY: Test environment, variables are unique per test
        for (key, value) in vars {
            unsafe {
                std::env::set_var(key, value);
            }
        }
        let result = f();
        for (key, _) in vars {
            unsafe {
                std::env::remove_var(key);
            }
        }
        result
    }

    #[test]
    fn test_env_var_overrides_selection_and_policy() {
        let vars = [
            ("FLOORCAST__SELECTION__MIN_IMPROVEMENT_PERCENT", "2.5"),
            ("FLOORCAST__CROSS_VALIDATION__WINDOW_POLICY", "sliding_window"),
            ("FLOORCAST__CROSS_VALIDATION__N_TRIALS", "12"),
        ];

        let config = with_env_vars(&vars, || AppConfig::load().expect("Config should load"));

        assert_eq!(config.selection.min_improvement_percent, 2.5);
        assert_eq!(config.cross_validation.window_policy, WindowPolicy::Sliding);
        assert_eq!(config.cross_validation.n_trials, 12);
    }

    #[test]
    fn test_env_var_overrides_storage() {
        let vars = [
            ("FLOORCAST__STORAGE__WRITE_MODE", "overwrite"),
            ("FLOORCAST__STORAGE__EXPERIMENT", "nightly"),
        ];

        let config = with_env_vars(&vars, || AppConfig::load().expect("Config should load"));

        assert_eq!(config.storage.write_mode, WriteMode::Overwrite);
        assert_eq!(config.storage.experiment, "nightly");
    }
}
