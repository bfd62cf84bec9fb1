//! Core abstractions for bridging callers to interactive interpreter sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionContext` - Per-session helper namespace and side-log locations
//! - `OutputEvent` / `Record` - Typed results and raw protocol records
//! - `LiveView` - Broadcast + history of the human-facing output
//! - `BridgeConfig` - Timeouts, channel preference, presentation policy
//! - Process spawner traits

pub mod config;
pub mod context;
pub mod event;
pub mod live_view;
pub mod traits;

pub use config::{BridgeConfig, ConfigError};
pub use context::{Language, SessionContext, SessionKey};
pub use event::{
    CaptureMode, CorrelationId, EventKind, EventPayload, OutputEvent, PresentationPolicy, Record,
    RecordType,
};
pub use live_view::{LiveView, ViewMsg};
pub use traits::{
    Capabilities, ChannelKind, ChannelPreference, LaunchSpec, ProcessControl, ProcessSpawner,
    SessionState, SpawnError, SpawnedSession,
};
