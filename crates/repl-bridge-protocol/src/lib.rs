//! Session execution protocol for interactive interpreters.
//!
//! Provides:
//! - `Dialect` - Per-language helper script, request encoding and prompts
//! - `Encoder` - Sentinel-wrapped requests with fresh correlation ids
//! - `Channel` - Side-log and scrape record sources
//! - `classify` - Record to `OutputEvent` mapping
//! - `DisplayCleaner` - Stateful control-sequence stripping
//! - `PipedSpawner` - Headless process-group backend

pub mod channel;
pub mod classify;
pub mod clean;
pub mod command;
pub mod dialect;
pub mod encoder;
pub mod pipe;

pub use channel::{Channel, ReadyScanner, ScrapeMarkers, SideLogParser};
pub use classify::classify;
pub use clean::DisplayCleaner;
pub use command::{CommandBuildError, InterpreterCommand};
pub use dialect::{Dialect, Prompts, SetupInjection, dialect_for};
pub use encoder::{EncodeError, EncodedRequest, Encoder, Request};
pub use pipe::PipedSpawner;
