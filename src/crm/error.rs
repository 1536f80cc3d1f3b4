use thiserror::Error;

use crate::retry::RetryAction;

/// Typed SprintHub errors enabling retry classification.
#[derive(Debug, Error)]
pub enum CrmError {
    #[error("SprintHub returned HTTP {status} for stage {stage_id} page {page}")]
    HttpStatus { status: u16, stage_id: u32, page: u32 },

    #[error("SprintHub request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected SprintHub payload: {0}")]
    Decode(String),
}

impl CrmError {
    /// 401/403 are treated as token/quota hiccups on this vendor and get the
    /// longer throttle backoff; network failures and 5xx get the regular one.
    pub fn retry_action(&self) -> RetryAction {
        match self {
            CrmError::HttpStatus { status, .. } => match *status {
                401 | 403 | 429 => RetryAction::Throttled,
                s if s >= 500 => RetryAction::Retry,
                _ => RetryAction::Abort,
            },
            CrmError::Transport(_) => RetryAction::Retry,
            CrmError::Decode(_) => RetryAction::Abort,
        }
    }
}
