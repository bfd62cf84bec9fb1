//! Request instrumentation.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use repl_bridge_core::{CaptureMode, ChannelKind, CorrelationId, SessionContext};
use thiserror::Error;

use crate::{channel::ScrapeMarkers, dialect::Dialect};

/// Encode error.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Code contains a NUL byte")]
    NulByte,
}

/// One caller-submitted unit of code.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: CorrelationId,
    pub code: String,
    /// Capture mode the caller asked for, if any.
    pub mode: Option<CaptureMode>,
    pub submitted_at: Instant,
    pub deadline: Instant,
}

/// A request ready to be written to the session.
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    pub request: Request,
    /// Exact session input.
    pub text: String,
    /// Present on the scrape channel only.
    pub markers: Option<ScrapeMarkers>,
}

/// Wraps caller code for a session's dialect and helper context.
#[derive(Clone)]
pub struct Encoder {
    dialect: Arc<dyn Dialect>,
    ctx: Arc<SessionContext>,
}

impl Encoder {
    #[must_use]
    pub fn new(dialect: Arc<dyn Dialect>, ctx: Arc<SessionContext>) -> Self {
        Self { dialect, ctx }
    }

    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Encode `code` for `channel`, minting a fresh correlation id.
    ///
    /// # Errors
    /// Returns error if the code cannot be embedded in session input.
    pub fn encode(
        &self,
        code: &str,
        mode: Option<CaptureMode>,
        channel: ChannelKind,
        timeout: Duration,
    ) -> Result<EncodedRequest, EncodeError> {
        if code.contains('\0') {
            return Err(EncodeError::NulByte);
        }

        let id = CorrelationId::new();
        let (text, markers) = match channel {
            ChannelKind::SideLog => (
                self.dialect.encode_side_log(&self.ctx, &id, code, mode),
                None,
            ),
            ChannelKind::Scrape => {
                let mode = mode.unwrap_or_else(|| self.dialect.infer_capture(code));
                (
                    self.dialect.encode_scrape(&self.ctx, &id, code, mode),
                    Some(self.dialect.scrape_markers(&self.ctx, &id)),
                )
            }
        };

        let submitted_at = Instant::now();
        tracing::debug!(request = %id, ?channel, ?mode, "Encoded request");
        Ok(EncodedRequest {
            request: Request {
                id,
                code: code.to_string(),
                mode,
                submitted_at,
                deadline: submitted_at + timeout,
            },
            text,
            markers,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use repl_bridge_core::{ChannelPreference, Language, SessionKey};

    use super::*;
    use crate::dialect::dialect_for;

    fn encoder() -> Encoder {
        let ctx = SessionContext::new(
            SessionKey::new(Language::R, "/work"),
            Path::new("/tmp/rb"),
            ChannelPreference::Auto,
        );
        Encoder::new(dialect_for(Language::R), Arc::new(ctx))
    }

    #[test]
    fn test_ids_are_unique_and_embedded() {
        let enc = encoder();
        let a = enc
            .encode("x <- 1", None, ChannelKind::SideLog, Duration::from_secs(5))
            .unwrap();
        let b = enc
            .encode("x <- 1", None, ChannelKind::SideLog, Duration::from_secs(5))
            .unwrap();
        assert_ne!(a.request.id, b.request.id);
        assert!(a.text.contains(a.request.id.as_str()));
        assert!(a.markers.is_none());
        assert!(a.request.deadline > a.request.submitted_at);
    }

    #[test]
    fn test_scrape_uses_heuristic_when_mode_absent() {
        let enc = encoder();
        let req = enc
            .encode("plot(1:10)", None, ChannelKind::Scrape, Duration::from_secs(5))
            .unwrap();
        assert!(req.text.contains(".RB_capture_plot({"));
        let markers = req.markers.unwrap();
        assert_eq!(markers.end_sentinel, format!(".RB_e_{}", req.request.id));

        let req = enc
            .encode("plot(1:10)", Some(CaptureMode::Plain), ChannelKind::Scrape, Duration::from_secs(5))
            .unwrap();
        assert!(!req.text.contains("capture_plot"));
    }

    #[test]
    fn test_side_log_uses_uniform_helper_when_mode_absent() {
        let enc = encoder();
        let req = enc
            .encode("plot(1:10)", None, ChannelKind::SideLog, Duration::from_secs(5))
            .unwrap();
        assert!(req.text.contains("\"auto\""));
        assert_eq!(req.request.mode, None);
    }

    #[test]
    fn test_nul_byte_rejected() {
        let err = encoder()
            .encode("x\0", None, ChannelKind::SideLog, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, EncodeError::NulByte));
    }
}
