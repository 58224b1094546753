//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while placing or removing containers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    State(#[from] corral_state::StateError),

    #[error("runtime gateway error: {0}")]
    Gateway(String),
}

impl SchedulerError {
    pub(crate) fn gateway(e: anyhow::Error) -> Self {
        SchedulerError::Gateway(format!("{e:#}"))
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
