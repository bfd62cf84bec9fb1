//! Broadcast + history of the human-facing session output.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, future};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default history size limit (4 MB).
pub const DEFAULT_HISTORY_BYTES: usize = 4 * 1024 * 1024;

/// Message delivered to live-view subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewMsg {
    /// Display-cleaned session output.
    Output { text: String },
    /// The underlying process exited.
    Exited { code: Option<i32> },
}

impl ViewMsg {
    fn approx_bytes(&self) -> usize {
        match self {
            Self::Output { text } => text.len(),
            Self::Exited { .. } => 8,
        }
    }
}

struct StoredMsg {
    msg: ViewMsg,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredMsg>,
    total_bytes: usize,
}

/// Live view with bounded replay history.
///
/// Surfaces attaching late receive the retained history first and
/// then follow the live stream.
pub struct LiveView {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<ViewMsg>,
    history_limit: usize,
}

impl Default for LiveView {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_BYTES)
    }
}

impl LiveView {
    /// Create a live view retaining at most `history_limit` bytes.
    #[must_use]
    pub fn new(history_limit: usize) -> Self {
        let (sender, _) = broadcast::channel(4096);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(64),
                total_bytes: 0,
            }),
            sender,
            history_limit,
        }
    }

    /// Publish to subscribers and append to history.
    pub fn push(&self, msg: ViewMsg) {
        let _ = self.sender.send(msg.clone());
        let bytes = msg.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.total_bytes.saturating_add(bytes) > self.history_limit {
            let Some(front) = inner.history.pop_front() else {
                break;
            };
            inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
        }
        inner.history.push_back(StoredMsg { msg, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Publish a chunk of cleaned output. Empty chunks are ignored.
    pub fn push_output<S: Into<String>>(&self, text: S) {
        let text = text.into();
        if !text.is_empty() {
            self.push(ViewMsg::Output { text });
        }
    }

    /// Publish process exit.
    pub fn push_exited(&self, code: Option<i32>) {
        self.push(ViewMsg::Exited { code });
    }

    /// Receiver for live updates only.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ViewMsg> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained history.
    #[must_use]
    pub fn history(&self) -> Vec<ViewMsg> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.msg.clone())
            .collect()
    }

    /// Concatenated output text currently in history.
    #[must_use]
    pub fn transcript(&self) -> String {
        self.history()
            .into_iter()
            .filter_map(|m| match m {
                ViewMsg::Output { text } => Some(text),
                ViewMsg::Exited { .. } => None,
            })
            .collect()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, ViewMsg> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| future::ready(res.ok()));

        Box::pin(hist.chain(live))
    }
}
