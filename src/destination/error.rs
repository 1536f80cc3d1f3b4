use thiserror::Error;

use crate::retry::RetryAction;

/// Typed PostgREST errors.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("Destination returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Destination request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected destination payload: {0}")]
    Decode(String),
}

impl DestinationError {
    /// Writes are retried on throttling, server errors and network failures.
    /// Constraint violations and other 4xx answers will not improve on retry.
    pub fn retry_action(&self) -> RetryAction {
        match self {
            DestinationError::HttpStatus { status, .. } => match *status {
                408 | 429 => RetryAction::Retry,
                s if s >= 500 => RetryAction::Retry,
                _ => RetryAction::Abort,
            },
            DestinationError::Transport(_) => RetryAction::Retry,
            DestinationError::Decode(_) => RetryAction::Abort,
        }
    }
}
