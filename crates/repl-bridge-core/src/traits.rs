//! Core traits for spawning and controlling interpreter processes.

use std::{io, path::PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::SessionContext;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process spawned, helpers not yet confirmed.
    Starting,
    /// Idle and accepting requests.
    Ready,
    /// A request is outstanding.
    Executing,
    /// Process exited. Terminal.
    Closed,
}

impl SessionState {
    /// Whether the lifecycle permits moving to `next`.
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Ready)
                | (Self::Ready, Self::Executing)
                | (Self::Executing, Self::Ready)
                | (Self::Starting | Self::Ready | Self::Executing, Self::Closed)
        )
    }
}

/// How structured output travels back from the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Helper appends framed records to a log artifact.
    SideLog,
    /// Output is scraped from the same stream the human sees.
    Scrape,
}

/// Requested channel; `Auto` lets the session report what it can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPreference {
    #[default]
    Auto,
    SideLog,
    Scrape,
}

/// What a spawned process supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Input is echoed back on the output stream (terminal line discipline).
    pub echoes_input: bool,
    /// The terminal can be resized.
    pub resizable: bool,
}

/// Interpreter invocation.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Control half of a running process.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Write raw bytes to the process input.
    async fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Resize the terminal, if any.
    fn resize(&self, cols: u16, rows: u16) -> io::Result<()>;

    /// Terminate the process.
    fn kill(&self) -> io::Result<()>;
}

/// A freshly spawned interpreter.
pub struct SpawnedSession {
    /// Input and lifecycle control.
    pub control: Box<dyn ProcessControl>,
    /// Raw output chunks; closes at EOF.
    pub output: mpsc::UnboundedReceiver<Bytes>,
    /// Fires once with the exit code when the process ends.
    pub exit: oneshot::Receiver<Option<i32>>,
    pub capabilities: Capabilities,
    pub pid: Option<u32>,
}

/// Spawn error.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Trait for process backends.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Spawn an interpreter for the given session.
    async fn spawn(
        &self,
        spec: &LaunchSpec,
        ctx: &SessionContext,
    ) -> Result<SpawnedSession, SpawnError>;
}
