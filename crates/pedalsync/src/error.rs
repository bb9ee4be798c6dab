//! Error types shared across the session core.

use pedalconf::ConfigError;
use thiserror::Error;

use crate::session::SessionState;

/// Errors returned by [`SessionStateManager`](crate::SessionStateManager) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session loaded")]
    NoSessionLoaded,

    #[error("cannot start a session while {0}")]
    InvalidState(SessionState),

    #[error("a session is already started")]
    AlreadyStarted,

    #[error("no active session")]
    NoActiveSession,

    #[error("session start was cancelled by a stop request")]
    StartAborted,

    #[error("failed to load session config: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to build session: {0:#}")]
    Build(#[source] anyhow::Error),

    #[error("sensor connect failed: {0:#}")]
    Connect(#[source] anyhow::Error),
}

impl SessionError {
    /// Precondition failures leave the manager exactly as it was.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SessionError::NoSessionLoaded
                | SessionError::InvalidState(_)
                | SessionError::AlreadyStarted
                | SessionError::NoActiveSession
        )
    }
}

/// Outcome of a task tracked by a [`ShutdownCoordinator`](crate::ShutdownCoordinator).
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task stopped because its token was cancelled. Never recorded as a failure.
    #[error("task cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}
