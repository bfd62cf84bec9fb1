//! Session identity and the per-session helper context.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::traits::ChannelPreference;

/// Default namespace used for session-side helpers and stream markers.
pub const DEFAULT_NAMESPACE: &str = "RB";

/// Interpreter language of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// GNU R.
    R,
}

impl Language {
    /// Canonical lowercase key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::R => "r",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Language key that no dialect handles.
#[derive(Debug, Clone, Error)]
#[error("Unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r" | "rscript" | "{r}" => Ok(Self::R),
            _ => Err(UnknownLanguage(s.to_string())),
        }
    }
}

/// Registry key of a session: one interpreter per language and workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub language: Language,
    pub workspace: PathBuf,
}

impl SessionKey {
    #[must_use]
    pub fn new(language: Language, workspace: impl Into<PathBuf>) -> Self {
        Self {
            language,
            workspace: workspace.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.language, self.workspace.display())
    }
}

/// Helper namespace and artifact locations shared between the manager,
/// the encoder and the session-side helper code.
///
/// Everything the injected helpers need to know about where to write
/// lives here, so encoding a request never consults global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    /// Unique session identifier.
    pub session_id: Uuid,
    /// Registry key.
    pub key: SessionKey,
    /// Prefix for helper objects and stream markers.
    pub namespace: String,
    /// Directory holding every artifact of this session.
    pub state_dir: PathBuf,
    /// Append-only record log written by the helper.
    pub side_log: PathBuf,
    /// Sentinel file written once setup completed.
    pub ready_file: PathBuf,
    /// Directory for captured plot images.
    pub plot_dir: PathBuf,
    /// Random token the helper must echo back to prove readiness.
    pub ready_token: String,
    /// Channel requested by configuration.
    pub channel: ChannelPreference,
}

impl SessionContext {
    /// Build a context rooted under `state_root/<session id>`.
    #[must_use]
    pub fn new(key: SessionKey, state_root: &Path, channel: ChannelPreference) -> Self {
        let session_id = Uuid::new_v4();
        let state_dir = state_root.join(session_id.simple().to_string());
        Self {
            session_id,
            key,
            namespace: DEFAULT_NAMESPACE.to_string(),
            side_log: state_dir.join("records.log"),
            ready_file: state_dir.join("ready"),
            plot_dir: state_dir.join("plots"),
            state_dir,
            ready_token: Uuid::new_v4().simple().to_string(),
            channel,
        }
    }

    /// Working directory the interpreter starts in.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.key.workspace
    }

    /// Create the state directories.
    ///
    /// # Errors
    /// Returns error if the directories cannot be created.
    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.plot_dir).await
    }

    /// Remove every artifact of this session.
    pub async fn cleanup(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.state_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(dir = %self.state_dir.display(), "Failed to remove state dir: {e}");
            }
        }
    }
}
