//! Common error types for Tally components.

use thiserror::Error;

use crate::types::{CaptchaCategory, TaskName, TaskStatus};

/// Common errors across Tally components
#[derive(Debug, Error)]
pub enum TallyError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A run of this task is already in progress
    #[error("Task already running: {0}")]
    TaskAlreadyRunning(TaskName),

    /// Primary store read failed
    #[error("Store read error: {0}")]
    StoreRead(String),

    /// Primary store write failed
    #[error("Store write error: {0}")]
    StoreWrite(String),

    /// Task record is already Completed or Failed
    #[error("Invalid transition of task record {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// External sink rejected or failed the batch
    #[error("Sink delivery error: {0}")]
    SinkDelivery(String),

    /// Dataset does not meet the configured solved/unsolved thresholds
    #[error("Dataset validation error: expected at least {required} {category} captchas, found {found}")]
    DatasetValidation {
        category: CaptchaCategory,
        required: usize,
        found: usize,
    },

    /// Dataset is structurally malformed
    #[error("Invalid dataset: {0}")]
    InvalidDataset(String),

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config(_) => 500,
            Self::TaskAlreadyRunning(_) => 409,
            Self::StoreRead(_) => 503,
            Self::StoreWrite(_) => 503,
            Self::InvalidTransition { .. } => 409,
            Self::SinkDelivery(_) => 502,
            Self::DatasetValidation { .. } => 422,
            Self::InvalidDataset(_) => 422,
            Self::InvalidInput(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    /// Returns true if a later scheduled run may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TaskAlreadyRunning(_)
                | Self::StoreRead(_)
                | Self::StoreWrite(_)
                | Self::SinkDelivery(_)
        )
    }
}
