//! Session error types.

use std::time::Duration;

use repl_bridge_core::{CorrelationId, OutputEvent, SpawnError};
use repl_bridge_protocol::{CommandBuildError, EncodeError};
use thiserror::Error;
use uuid::Uuid;

/// Session manager error.
///
/// Evaluation errors raised by user code are not represented here; they
/// arrive as `EventKind::Error` events.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session setup did not complete within {0:?}")]
    SetupTimeout(Duration),
    #[error("Request {request} timed out after {timeout:?}")]
    ExecutionTimeout {
        request: CorrelationId,
        timeout: Duration,
        /// Everything observed before the deadline.
        events: Vec<OutputEvent>,
    },
    #[error("Session closed")]
    SessionClosed,
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),
    #[error("Command error: {0}")]
    Command(#[from] CommandBuildError),
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown session: {0}")]
    UnknownSession(Uuid),
}

impl SessionError {
    /// Partial events carried by a timeout.
    #[must_use]
    pub fn partial_events(&self) -> Option<&[OutputEvent]> {
        match self {
            Self::ExecutionTimeout { events, .. } => Some(events),
            _ => None,
        }
    }
}
