//! Session orchestration for interactive interpreters.
//!
//! Provides:
//! - `SessionManager` - Registry of sessions, one per language and workspace
//! - `Session` - One interpreter process with its output pump
//! - `CorrelationTable` - Pending requests keyed by correlation id

pub mod correlation;
pub mod error;
pub mod manager;
mod pump;
pub mod session;

pub use correlation::CorrelationTable;
pub use error::SessionError;
pub use manager::SessionManager;
pub use pump::PumpStatus;
pub use session::{Session, SessionHandle};
