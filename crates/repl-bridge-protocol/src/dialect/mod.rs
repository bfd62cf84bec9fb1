//! Language-specific instrumentation.

mod r;

use std::{path::PathBuf, sync::Arc};

use repl_bridge_core::{CaptureMode, CorrelationId, Language, SessionContext};

pub use r::RDialect;

use crate::{channel::ScrapeMarkers, command::InterpreterCommand};

/// Prompt strings the interpreter prints before reading a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompts {
    pub primary: String,
    pub continuation: String,
}

impl Prompts {
    /// Whether `line` is an echo of input typed at either prompt.
    #[must_use]
    pub fn is_echo(&self, line: &str) -> bool {
        [&self.primary, &self.continuation].into_iter().any(|p| {
            line.starts_with(p.as_str()) || (!p.trim().is_empty() && line == p.trim_end())
        })
    }
}

/// Setup script and the line that makes the interpreter load it.
#[derive(Debug, Clone)]
pub struct SetupInjection {
    /// Where the script must be written before `line` is sent.
    pub file: PathBuf,
    pub script: String,
    /// Input line that loads `file`, newline terminated.
    pub line: String,
}

/// Everything needed to instrument one interpreter language.
pub trait Dialect: Send + Sync {
    fn language(&self) -> Language;

    /// Interpreter invocation for an interactive session.
    fn command(&self) -> InterpreterCommand;

    fn prompts(&self) -> Prompts;

    /// Helper definitions plus the readiness handshake.
    fn setup(&self, ctx: &SessionContext) -> SetupInjection;

    /// Input text for one request on the side-log channel.
    ///
    /// `None` selects the uniform helper that captures every output kind.
    fn encode_side_log(
        &self,
        ctx: &SessionContext,
        id: &CorrelationId,
        code: &str,
        mode: Option<CaptureMode>,
    ) -> String;

    /// Input text for one request on the scrape channel.
    fn encode_scrape(
        &self,
        ctx: &SessionContext,
        id: &CorrelationId,
        code: &str,
        mode: CaptureMode,
    ) -> String;

    /// Markers the scrape parser watches for while `id` executes.
    fn scrape_markers(&self, ctx: &SessionContext, id: &CorrelationId) -> ScrapeMarkers;

    /// Best-effort guess of the capture mode from the code text.
    fn infer_capture(&self, code: &str) -> CaptureMode;
}

/// Dialect for `language`.
#[must_use]
pub fn dialect_for(language: Language) -> Arc<dyn Dialect> {
    match language {
        Language::R => Arc::new(RDialect::new()),
    }
}
