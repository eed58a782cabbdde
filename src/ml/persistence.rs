//! Run records and the repository that finds a floor's previous model

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::params::ModelParams;
use super::search::TrialSummary;
use crate::error::{ForecastError, Result};

/// Tags a run is looked up by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTags {
    /// Latest observation date the run was trained on
    pub run_date: NaiveDate,
    /// `final_model_<floor>`
    pub model_version: String,
}

impl RunTags {
    pub fn for_floor(floor: u32, run_date: NaiveDate) -> Self {
        Self {
            run_date,
            model_version: model_version_tag(floor),
        }
    }
}

/// Version tag under which a floor's production models are recorded.
pub fn model_version_tag(floor: u32) -> String {
    format!("final_model_{floor}")
}

/// Persisted production model of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Version for backward compatibility
    pub version: u32,
    pub run_id: String,
    /// `study_model_<week>_<floor>` or `prev_model_<week>_<floor>`
    pub run_name: String,
    pub created_at: DateTime<Utc>,
    pub tags: RunTags,
    pub model_family: String,
    /// Flat hyperparameters, every key of `ModelParams`
    pub params: BTreeMap<String, f64>,
    /// Test metrics, `MWIS_test` and `MAE_test`
    pub metrics: BTreeMap<String, f64>,
    /// Best search trial, when one ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial: Option<serde_json::Value>,
    /// Serialized fitted model
    pub artifact: serde_json::Value,
}

impl RunRecord {
    /// Current version number
    pub const CURRENT_VERSION: u32 = 1;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_name: String,
        created_at: DateTime<Utc>,
        tags: RunTags,
        model_family: String,
        params: &ModelParams,
        mwis: f64,
        mae: f64,
        artifact: serde_json::Value,
    ) -> Self {
        let run_id = format!(
            "{}_{}",
            created_at.format("%Y%m%dT%H%M%S%3f"),
            run_name
        );
        Self {
            version: Self::CURRENT_VERSION,
            run_id,
            run_name,
            created_at,
            tags,
            model_family,
            params: params.to_map(),
            metrics: BTreeMap::from([
                ("MWIS_test".to_string(), mwis),
                ("MAE_test".to_string(), mae),
            ]),
            trial: None,
            artifact,
        }
    }

    pub fn with_trial(mut self, summary: &TrialSummary) -> Result<Self> {
        self.trial = Some(serde_json::to_value(summary)?);
        Ok(self)
    }

    /// Typed hyperparameters; fails when a key is missing.
    pub fn model_params(&self) -> Result<ModelParams> {
        ModelParams::from_map(&self.params)
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Run {} ({}): {} for {}, MWIS_test={}, created {}",
            self.run_name,
            self.run_id,
            self.model_family,
            self.tags.run_date,
            self.metrics
                .get("MWIS_test")
                .map(|v| format!("{v:.4}"))
                .unwrap_or_else(|| "N/A".to_string()),
            self.created_at.format("%Y-%m-%d %H:%M UTC")
        )
    }
}

/// Store of run records.
pub trait ModelRepository {
    /// Most recent run recorded for `floor` with a run date one week before
    /// `as_of`.
    fn find_previous(&self, floor: u32, as_of: NaiveDate) -> Result<Option<RunRecord>>;

    fn record(&self, run: &RunRecord) -> Result<()>;
}

/// Run date a continuation run looks up for `as_of`.
pub fn previous_run_date(as_of: NaiveDate) -> NaiveDate {
    as_of - Duration::weeks(1)
}

/// Keeps each run as a JSON file under `<root>/<experiment>/`.
#[derive(Debug, Clone)]
pub struct FileModelRepository {
    dir: PathBuf,
}

impl FileModelRepository {
    pub fn new(root: &Path, experiment: &str) -> Self {
        Self {
            dir: root.join(experiment),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load(path: &Path) -> Result<RunRecord> {
        let bytes = fs::read(path)?;
        let record: RunRecord = serde_json::from_slice(&bytes)?;

        if record.version > RunRecord::CURRENT_VERSION {
            return Err(ForecastError::InvalidParameter(format!(
                "run record {} has version {}, newest supported is {}",
                path.display(),
                record.version,
                RunRecord::CURRENT_VERSION
            )));
        }
        Ok(record)
    }

    /// Every readable record, skipping files that fail to parse.
    pub fn runs(&self) -> Result<Vec<RunRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match Self::load(&path) {
                Ok(record) => runs.push(record),
                Err(e) => tracing::warn!("Skipping run record {}: {}", path.display(), e),
            }
        }
        Ok(runs)
    }
}

impl ModelRepository for FileModelRepository {
    fn find_previous(&self, floor: u32, as_of: NaiveDate) -> Result<Option<RunRecord>> {
        let wanted = RunTags::for_floor(floor, previous_run_date(as_of));
        let found = self
            .runs()?
            .into_iter()
            .filter(|run| run.tags == wanted)
            .max_by_key(|run| run.created_at);

        match &found {
            Some(run) => tracing::info!("Found previous run: {}", run.summary()),
            None => tracing::debug!(
                "No run tagged {} on {}",
                wanted.model_version,
                wanted.run_date
            ),
        }
        Ok(found)
    }

    fn record(&self, run: &RunRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.json", run.run_id));
        fs::write(&path, serde_json::to_vec_pretty(run)?)?;
        tracing::info!("Recorded run {} at {}", run.run_name, path.display());
        Ok(())
    }
}
