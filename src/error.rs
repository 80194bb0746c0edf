use crate::models::Timeframe;
use chrono::NaiveDate;
use thiserror::Error;

/// Failures of a single unit of work (one symbol run or one cross-section).
/// None of these abort a batch; the orchestrator records them and moves on.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("data gap in {symbol} {timeframe} bars between {previous} and {next}")]
    DataGap {
        symbol: String,
        timeframe: Timeframe,
        previous: NaiveDate,
        next: NaiveDate,
    },

    #[error("{symbol} {timeframe} bars are not strictly ascending ({previous} followed by {next})")]
    NonMonotonicDates {
        symbol: String,
        timeframe: Timeframe,
        previous: NaiveDate,
        next: NaiveDate,
    },

    #[error("corrupt bar for {symbol} on {date}: {field} is not a finite number")]
    CorruptBar {
        symbol: String,
        date: NaiveDate,
        field: &'static str,
    },

    #[error("invariant violation for {symbol} on {date}: {reason}")]
    InvariantViolation {
        symbol: String,
        date: NaiveDate,
        reason: String,
    },

    #[error("provider unavailable for {context} after {attempts} attempt(s): {message}")]
    ProviderUnavailable {
        context: String,
        attempts: u32,
        message: String,
    },

    #[error("run for {symbol} exceeded {seconds}s and was discarded")]
    Timeout { symbol: String, seconds: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("worker for {symbol} stopped unexpectedly: {message}")]
    Worker { symbol: String, message: String },
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::DataGap { .. } => "data_gap",
            EngineError::NonMonotonicDates { .. } => "non_monotonic_dates",
            EngineError::CorruptBar { .. } => "corrupt_bar",
            EngineError::InvariantViolation { .. } => "invariant_violation",
            EngineError::ProviderUnavailable { .. } => "provider_unavailable",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Storage(_) => "storage",
            EngineError::Worker { .. } => "worker",
        }
    }

    /// Only transport-level failures are worth retrying; data problems repeat.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ProviderUnavailable { .. } | EngineError::Storage(_)
        )
    }
}

impl From<tokio_postgres::Error> for EngineError {
    fn from(err: tokio_postgres::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
