//! Pseudo-terminal backend for interactive interpreter sessions.
//!
//! Provides:
//! - `PtySpawner` - Spawn interpreters attached to a PTY
//! - Interpreter discovery across PATH, login-shell PATH and install dirs

pub mod locate;
pub mod service;

pub use locate::{merge_paths, resolve_interpreter};
pub use service::PtySpawner;
