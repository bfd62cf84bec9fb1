//! Heuristic extraction of results from the echoed terminal stream.

use std::mem;

use async_trait::async_trait;
use regex::Regex;
use repl_bridge_core::{ChannelKind, CorrelationId, Record, RecordType};

use super::Channel;
use crate::dialect::Prompts;

/// Stream markers for one scraped request.
#[derive(Debug, Clone)]
pub struct ScrapeMarkers {
    /// Name assigned before the code runs.
    pub start_sentinel: String,
    /// Name assigned after the code ran; its echo completes the request.
    pub end_sentinel: String,
    /// Echoed capture-wrapper calls.
    pub wrapper_prefixes: Vec<String>,
    pub plot_open: String,
    pub plot_close: String,
    pub html_open: String,
    pub html_close: String,
    pub prompts: Prompts,
    /// Matches the interpreter's error framing, which is removed.
    pub error_prefix: Regex,
    /// Lines opening a warning block.
    pub warning_prefixes: Vec<String>,
}

/// Accumulates cleaned stream text for one request until its end
/// sentinel has been echoed and the interpreter is back at its prompt.
#[derive(Debug)]
pub struct ScrapeParser {
    id: CorrelationId,
    markers: ScrapeMarkers,
    buf: String,
    done: bool,
}

impl ScrapeParser {
    #[must_use]
    pub fn new(id: CorrelationId, markers: ScrapeMarkers) -> Self {
        Self {
            id,
            markers,
            buf: String::new(),
            done: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &CorrelationId {
        &self.id
    }

    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.done
    }

    /// Feed cleaned text. Once complete, returns the request's records
    /// followed by a `CELL_END`; returns `None` before that and after.
    pub fn push(&mut self, text: &str) -> Option<Vec<Record>> {
        if self.done {
            return None;
        }
        self.buf.extend(text.chars().filter(|&c| c != '\r'));

        let end_line = self.end_line()?;
        let tail = self.buf[end_line..]
            .split_once('\n')
            .map(|(_, rest)| rest)?;
        if tail.trim_end() != self.markers.prompts.primary.trim_end() {
            return None;
        }

        self.done = true;
        let body = mem::take(&mut self.buf);
        let mut records = self.segment(&body[..end_line]);
        records.push(Record::new(RecordType::CellEnd, self.id.clone(), ""));
        Some(records)
    }

    /// Segment whatever arrived so far, without waiting for completion.
    /// The parser is done afterwards.
    pub fn drain(&mut self) -> Vec<Record> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let body = mem::take(&mut self.buf);
        self.segment(&body)
    }

    /// Byte offset of the start of the last line echoing the end sentinel.
    fn end_line(&self) -> Option<usize> {
        let at = self.buf.rfind(&self.markers.end_sentinel)?;
        Some(self.buf[..at].rfind('\n').map_or(0, |nl| nl + 1))
    }

    fn segment(&self, body: &str) -> Vec<Record> {
        let m = &self.markers;
        let region = body
            .find(&m.start_sentinel)
            .and_then(|at| body[at..].find('\n').map(|nl| &body[at + nl + 1..]))
            .unwrap_or(body);

        let kept: Vec<&str> = region
            .split('\n')
            .filter(|line| {
                !m.prompts.is_echo(line)
                    && !line.contains(&m.start_sentinel)
                    && !line.contains(&m.end_sentinel)
                    && !m.wrapper_prefixes.iter().any(|p| line.starts_with(p.as_str()))
            })
            .collect();
        let mut rest = kept.join("\n");

        let mut records = Vec::new();
        loop {
            let plot = rest.find(&m.plot_open);
            let html = rest.find(&m.html_open);
            let (at, is_plot) = match (plot, html) {
                (Some(p), Some(h)) if h < p => (h, false),
                (Some(p), _) => (p, true),
                (None, Some(h)) => (h, false),
                (None, None) => break,
            };
            let (open, close) = if is_plot {
                (&m.plot_open, &m.plot_close)
            } else {
                (&m.html_open, &m.html_close)
            };
            let inner_start = at + open.len();
            let Some(close_at) = rest[inner_start..].find(close.as_str()).map(|i| inner_start + i)
            else {
                tracing::debug!(request = %self.id, "Unterminated marker in scraped output");
                break;
            };

            self.text_records(&rest[..at], &mut records);
            let inner = rest[inner_start..close_at].trim_matches('\n');
            let kind = if is_plot {
                RecordType::Plot
            } else {
                RecordType::Html
            };
            records.push(Record::new(kind, self.id.clone(), inner.trim_end()));
            rest = rest[close_at + close.len()..].to_string();
        }
        self.text_records(&rest, &mut records);
        records
    }

    /// Classify plain lines into output, error and warning records.
    fn text_records(&self, text: &str, records: &mut Vec<Record>) {
        fn flush(
            id: &CorrelationId,
            current: Option<(RecordType, Vec<&str>)>,
            records: &mut Vec<Record>,
        ) {
            let Some((kind, lines)) = current else {
                return;
            };
            let joined = lines.join("\n");
            let content = match kind {
                RecordType::Output => joined.trim_matches('\n').trim_end(),
                _ => joined.trim(),
            };
            if !content.trim().is_empty() {
                records.push(Record::new(kind, id.clone(), content));
            }
        }

        let m = &self.markers;
        let mut current: Option<(RecordType, Vec<&str>)> = None;
        for line in text.split('\n') {
            if let Some(found) = m.error_prefix.find(line) {
                flush(&self.id, current.take(), records);
                current = Some((RecordType::Error, vec![&line[found.end()..]]));
            } else if m.warning_prefixes.iter().any(|p| line.starts_with(p.as_str())) {
                flush(&self.id, current.take(), records);
                current = Some((RecordType::Warning, Vec::new()));
            } else if let Some((_, lines)) = current.as_mut() {
                lines.push(line);
            } else {
                current = Some((RecordType::Output, vec![line]));
            }
        }
        flush(&self.id, current, records);
    }
}

/// Scrape channel: at most one armed parser at a time.
#[derive(Debug, Default)]
pub struct ScrapeChannel {
    active: Option<ScrapeParser>,
}

impl ScrapeChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Channel for ScrapeChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Scrape
    }

    fn arm(&mut self, id: &CorrelationId, markers: Option<ScrapeMarkers>) {
        self.active = markers.map(|m| ScrapeParser::new(id.clone(), m));
        if self.active.is_none() {
            tracing::warn!(request = %id, "Scrape request armed without markers");
        }
    }

    fn disarm(&mut self, id: &CorrelationId) {
        if self.active.as_ref().is_some_and(|p| p.id() == id) {
            self.active = None;
        }
    }

    fn on_stream(&mut self, text: &str) -> Vec<Record> {
        let Some(parser) = self.active.as_mut() else {
            return Vec::new();
        };
        let records = parser.push(text).unwrap_or_default();
        if parser.is_done() {
            self.active = None;
        }
        records
    }

    async fn poll(&mut self) -> std::io::Result<Vec<Record>> {
        Ok(Vec::new())
    }

    async fn drain_partial(&mut self, id: &CorrelationId) -> std::io::Result<Vec<Record>> {
        match self.active.take() {
            Some(mut parser) if parser.id() == id => Ok(parser.drain()),
            other => {
                self.active = other;
                Ok(Vec::new())
            }
        }
    }
}
