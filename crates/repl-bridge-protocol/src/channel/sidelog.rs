//! Side-log record framing.
//!
//! Wire format, one record:
//!
//! ```text
//! ###TYPE:ID###
//! <content, possibly multi-line>
//! ###END###
//! ```
//!
//! A content line consisting of `###END###` preceded by any number of
//! backslashes is written with one extra backslash; the parser removes it.

use std::{io::SeekFrom, path::PathBuf};

use async_trait::async_trait;
use repl_bridge_core::{ChannelKind, CorrelationId, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{Channel, ScrapeMarkers};

const HEADER_MARK: &[u8] = b"###";
const TERMINATOR: &[u8] = b"\n###END###\n";
const END_LINE: &str = "###END###";

/// Incremental parser for the side-log byte stream.
///
/// Records are emitted only once both header and terminator have arrived,
/// so the output does not depend on how the input is chunked.
#[derive(Debug, Default)]
pub struct SideLogParser {
    buf: Vec<u8>,
}

impl SideLogParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a record.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes and return every record they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Record> {
        self.buf.extend_from_slice(bytes);
        let mut records = Vec::new();
        let mut pos = 0;

        loop {
            let Some(start) = find(&self.buf[pos..], HEADER_MARK).map(|i| pos + i) else {
                // Keep a possible partial "##" at the tail.
                let keep = self.buf.len().saturating_sub(HEADER_MARK.len() - 1).max(pos);
                skip_garbage(&self.buf[pos..keep]);
                pos = keep;
                break;
            };
            skip_garbage(&self.buf[pos..start]);
            pos = start;

            let Some(nl) = self.buf[start..].iter().position(|&b| b == b'\n').map(|i| start + i)
            else {
                break;
            };
            let Some((kind, id)) = parse_header(&self.buf[start..nl]) else {
                skip_garbage(&self.buf[start..=nl]);
                pos = nl + 1;
                continue;
            };

            let body = nl + 1;
            let Some(end) = find(&self.buf[nl..], TERMINATOR).map(|i| nl + i) else {
                break;
            };
            // An empty record's terminator starts at the header's own newline.
            let content = if end < body {
                String::new()
            } else {
                unescape(&String::from_utf8_lossy(&self.buf[body..end]))
            };
            pos = end + TERMINATOR.len();

            match kind {
                Some(kind) => records.push(Record::new(kind, id, content)),
                None => tracing::debug!(id = %id, "Skipping record with unknown type"),
            }
        }

        self.buf.drain(..pos);
        records
    }
}

/// Parse `###TYPE:ID###`. Returns `Some((None, id))` for a well-formed
/// header with an unknown type.
fn parse_header(line: &[u8]) -> Option<(Option<RecordType>, CorrelationId)> {
    let line = std::str::from_utf8(line).ok()?;
    let inner = line.strip_prefix("###")?.strip_suffix("###")?;
    let (tag, id) = inner.split_once(':')?;
    let valid_tag = !tag.is_empty() && tag.bytes().all(|b| b.is_ascii_uppercase() || b == b'_');
    let valid_id = !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if !valid_tag || !valid_id {
        return None;
    }
    Some((RecordType::from_tag(tag), CorrelationId::from_wire(id)))
}

fn unescape(content: &str) -> String {
    content
        .split('\n')
        .map(|line| {
            let bare = line.trim_start_matches('\\');
            if bare == END_LINE && bare.len() < line.len() {
                &line[1..]
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn skip_garbage(bytes: &[u8]) {
    if !bytes.iter().all(u8::is_ascii_whitespace) {
        tracing::debug!(len = bytes.len(), "Skipping unframed side-log bytes");
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Tails the side-log artifact by offset.
#[derive(Debug)]
pub struct SideLogTail {
    path: PathBuf,
    offset: u64,
    parser: SideLogParser,
}

impl SideLogTail {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            parser: SideLogParser::new(),
        }
    }

    /// Read whatever was appended since the last call.
    ///
    /// A missing file yields no records; a file shorter than the current
    /// offset is read again from the start.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read.
    pub async fn read(&mut self) -> std::io::Result<Vec<Record>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();
        if len < self.offset {
            tracing::warn!(path = %self.path.display(), "Side log truncated, rereading");
            self.offset = 0;
            self.parser = SideLogParser::new();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        self.offset += bytes.len() as u64;
        Ok(self.parser.push(&bytes))
    }
}

#[async_trait]
impl Channel for SideLogTail {
    fn kind(&self) -> ChannelKind {
        ChannelKind::SideLog
    }

    fn arm(&mut self, _id: &CorrelationId, _markers: Option<ScrapeMarkers>) {}

    fn disarm(&mut self, _id: &CorrelationId) {}

    fn on_stream(&mut self, _text: &str) -> Vec<Record> {
        Vec::new()
    }

    async fn poll(&mut self) -> std::io::Result<Vec<Record>> {
        self.read().await
    }

    async fn drain_partial(&mut self, _id: &CorrelationId) -> std::io::Result<Vec<Record>> {
        self.read().await
    }
}
