//! Error types shared by every stage of the forecasting pipeline.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, ForecastError>;

/// Errors raised by the forecasting pipeline.
///
/// Variants marked fatal indicate a configuration or integration defect and
/// abort the run for the affected floor.
#[derive(Error, Debug)]
pub enum ForecastError {
    /// Not enough distinct calendar weeks for the requested windows.
    #[error("insufficient history: need {needed} distinct weeks, got {got}")]
    InsufficientHistory { needed: usize, got: usize },

    /// A configuration or call parameter is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The model did not return one lower/median/upper triple per row (fatal).
    #[error("prediction shape mismatch: expected {expected} quantiles per row, got {got}")]
    PredictionShape { expected: usize, got: usize },

    /// No constructor registered for the requested model family (fatal).
    #[error("model family '{0}' is not supported")]
    UnsupportedModel(String),

    /// A continuation run found no previous model for the floor (fatal).
    #[error("no previous model found for floor {floor} (run date {run_date})")]
    MissingIncumbent { floor: u32, run_date: chrono::NaiveDate },

    /// A stored parameter set lacks a required key (fatal).
    #[error("parameter set is missing required key '{0}'")]
    IncompleteParams(String),

    /// The search finished without a single scored trial.
    #[error("hyperparameter search produced no completed trials")]
    NoCompletedTrials,

    /// The regressor failed to fit.
    #[error("model fitting failed: {0}")]
    Fit(String),

    /// A timestamp could not be parsed or localized.
    #[error("timestamp error: {0}")]
    Timestamp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ForecastError {
    /// Whether the error signals a defect rather than a data condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ForecastError::PredictionShape { .. }
                | ForecastError::UnsupportedModel(_)
                | ForecastError::MissingIncumbent { .. }
                | ForecastError::IncompleteParams(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_descriptive() {
        let err = ForecastError::InsufficientHistory { needed: 16, got: 4 };
        assert_eq!(
            err.to_string(),
            "insufficient history: need 16 distinct weeks, got 4"
        );

        let err = ForecastError::PredictionShape {
            expected: 3,
            got: 1,
        };
        assert_eq!(
            err.to_string(),
            "prediction shape mismatch: expected 3 quantiles per row, got 1"
        );

        let err = ForecastError::UnsupportedModel("lightgbm".to_string());
        assert_eq!(err.to_string(), "model family 'lightgbm' is not supported");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ForecastError::UnsupportedModel("x".into()).is_fatal());
        assert!(ForecastError::IncompleteParams("depth".into()).is_fatal());
        assert!(!ForecastError::NoCompletedTrials.is_fatal());
        assert!(!ForecastError::InvalidParameter("x".into()).is_fatal());
    }
}
