//! Result channels: how records travel back from the session.

mod ready;
mod scrape;
mod sidelog;

use async_trait::async_trait;
use repl_bridge_core::{ChannelKind, CorrelationId, Record, SessionContext};

pub use ready::{ReadyScanner, ready_file_matches};
pub use scrape::{ScrapeChannel, ScrapeMarkers, ScrapeParser};
pub use sidelog::{SideLogParser, SideLogTail};

/// Source of records for in-flight requests.
///
/// Exactly one implementation is active per session, picked during setup.
#[async_trait]
pub trait Channel: Send {
    fn kind(&self) -> ChannelKind;

    /// A request is about to be written.
    fn arm(&mut self, id: &CorrelationId, markers: Option<ScrapeMarkers>);

    /// Stop collecting for `id`.
    fn disarm(&mut self, id: &CorrelationId);

    /// Display-cleaned stream text.
    fn on_stream(&mut self, text: &str) -> Vec<Record>;

    /// Periodic check of out-of-band artifacts.
    async fn poll(&mut self) -> std::io::Result<Vec<Record>>;

    /// Give up on `id`: return whatever was collected for it so far and
    /// stop collecting.
    async fn drain_partial(&mut self, id: &CorrelationId) -> std::io::Result<Vec<Record>>;
}

/// Open the channel of `kind` for a session.
#[must_use]
pub fn open(kind: ChannelKind, ctx: &SessionContext) -> Box<dyn Channel> {
    match kind {
        ChannelKind::SideLog => Box::new(SideLogTail::new(ctx.side_log.clone())),
        ChannelKind::Scrape => Box::new(ScrapeChannel::new()),
    }
}
