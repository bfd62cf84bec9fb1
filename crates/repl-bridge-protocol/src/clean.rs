//! Terminal control-sequence stripping for display and parsing.

use std::{
    io::{self, Write},
    sync::{Arc, Mutex, PoisonError},
};

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Strips escape sequences from raw terminal output.
///
/// The parser state survives between chunks, so a sequence or a UTF-8
/// character split across two reads is still handled. Line endings are
/// normalized to `\n`; a lone `\r` (progress redraws) is kept.
pub struct DisplayCleaner {
    writer: strip_ansi_escapes::Writer<Sink>,
    sink: Sink,
    pending_cr: bool,
}

impl Default for DisplayCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayCleaner {
    #[must_use]
    pub fn new() -> Self {
        let sink = Sink::default();
        Self {
            writer: strip_ansi_escapes::Writer::new(sink.clone()),
            sink,
            pending_cr: false,
        }
    }

    /// Clean one chunk. Partial lines are returned as soon as they arrive;
    /// only an unfinished escape sequence or UTF-8 character, or a trailing
    /// `\r`, waits for the next chunk.
    pub fn clean(&mut self, chunk: &[u8]) -> String {
        // The stripper discards `\r`, so it never sees one.
        let mut text = String::new();
        for (i, part) in chunk.split(|&b| b == b'\r').enumerate() {
            if i > 0 {
                text.push('\r');
            }
            self.strip(part, &mut text);
        }
        self.normalize_line_endings(&text)
    }

    fn strip(&mut self, bytes: &[u8], out: &mut String) {
        // The stripper buffers by line until flushed.
        if let Err(e) = self
            .writer
            .write_all(bytes)
            .and_then(|()| self.writer.flush())
        {
            tracing::debug!("Escape stripper rejected chunk: {e}");
        }
        let stripped =
            std::mem::take(&mut *self.sink.0.lock().unwrap_or_else(PoisonError::into_inner));
        match String::from_utf8(stripped) {
            Ok(text) => out.push_str(&text),
            Err(e) => out.push_str(&String::from_utf8_lossy(e.as_bytes())),
        }
    }

    /// `\r\n` (and `\r\r\n` from terminal output processing) becomes `\n`.
    fn normalize_line_endings(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() + 1);
        if self.pending_cr && !text.is_empty() {
            self.pending_cr = false;
            if !text.starts_with(['\n', '\r']) {
                out.push('\r');
            }
        }
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '\r' {
                out.push(c);
                continue;
            }
            while chars.next_if_eq(&'\r').is_some() {}
            match chars.peek() {
                Some('\n') => {}
                Some(_) => out.push('\r'),
                None => self.pending_cr = true,
            }
        }
        out
    }
}
