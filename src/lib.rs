//! Floorcast Library
//!
//! Two-week quantile forecasts of per-floor power demand, with walk-forward
//! cross-validation and champion/challenger model selection.

pub mod augment;
pub mod calendar;
pub mod config;
pub mod error;
pub mod forecast;
pub mod ml;
pub mod observation;
pub mod pipeline;
pub mod preprocess;
pub mod split;
pub mod storage;
pub mod traits;

// Re-export commonly used types
pub use augment::{AugmentInput, Backfill, CalendarFlag, augment_cv_window, backfill_flagged_weeks};
pub use config::AppConfig;
pub use error::{ForecastError, Result};
pub use forecast::{ForecastSlot, forecast_window, generate_forecast};
pub use observation::{CalendarRow, Observation, TimeFeatures, YearWeek};
pub use pipeline::{FloorPipeline, FloorReport, PipelineSettings, RunMode};
pub use split::{WeekSplit, split_cv_test};
pub use storage::{ForecastRecord, ForecastStore, LocalCsvStore, PartitionedCsvStore, WriteMode};
pub use traits::{Clock, MockClock, SystemClock};
