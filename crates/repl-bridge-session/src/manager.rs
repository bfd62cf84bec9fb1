//! Session manager: the public entry point.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use futures::stream::BoxStream;
use repl_bridge_core::{
    BridgeConfig, CaptureMode, Language, OutputEvent, ProcessSpawner, SessionContext, SessionKey,
    SessionState, ViewMsg, context::UnknownLanguage,
};
use repl_bridge_protocol::{PipedSpawner, dialect_for};
use repl_bridge_pty::PtySpawner;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    SessionError,
    session::{Session, SessionHandle},
};

type Slot = Arc<Mutex<Option<SessionHandle>>>;

/// Registry of interpreter sessions, one per language and workspace.
pub struct SessionManager<P: ProcessSpawner> {
    spawner: P,
    config: BridgeConfig,
    sessions: RwLock<HashMap<SessionKey, Slot>>,
}

impl SessionManager<PtySpawner> {
    /// Manager spawning interpreters in a pseudo-terminal.
    #[must_use]
    pub fn with_pty(config: BridgeConfig) -> Self {
        Self::new(PtySpawner::new(), config)
    }
}

impl SessionManager<PipedSpawner> {
    /// Manager spawning headless interpreters on pipes. Only the side-log
    /// channel is available.
    #[must_use]
    pub fn with_pipes(config: BridgeConfig) -> Self {
        Self::new(PipedSpawner::new(), config)
    }
}

impl<P: ProcessSpawner> SessionManager<P> {
    /// Create a new session manager.
    #[must_use]
    pub fn new(spawner: P, config: BridgeConfig) -> Self {
        Self {
            spawner,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Return the live session for `key`, starting one if needed.
    ///
    /// Concurrent callers for the same key share a single setup. A closed
    /// session found in the registry is replaced.
    ///
    /// # Errors
    /// Returns error if the interpreter cannot be started.
    pub async fn acquire(&self, key: SessionKey) -> Result<SessionHandle, SessionError> {
        let slot = {
            let mut sessions = self.sessions.write().await;
            Arc::clone(sessions.entry(key.clone()).or_default())
        };

        let mut guard = slot.lock().await;
        if let Some(existing) = guard.as_ref() {
            if existing.state() != SessionState::Closed {
                return Ok(Arc::clone(existing));
            }
            tracing::info!(session = %existing.id(), key = %key, "Replacing closed session");
        }
        *guard = None;

        let ctx = SessionContext::new(key.clone(), &self.config.state_root(), self.config.channel);
        tracing::info!(session = %ctx.session_id, key = %key, "Starting session");
        let session =
            Session::start(&self.spawner, dialect_for(key.language), ctx, &self.config).await?;
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    /// `acquire` by language name and working directory.
    ///
    /// # Errors
    /// Returns error if the language is unknown or the interpreter cannot
    /// be started.
    pub async fn acquire_for(
        &self,
        language: &str,
        workspace: impl Into<PathBuf>,
    ) -> Result<SessionHandle, SessionError> {
        let language: Language = language
            .parse()
            .map_err(|e: UnknownLanguage| SessionError::UnsupportedLanguage(e.0))?;
        self.acquire(SessionKey::new(language, workspace)).await
    }

    /// Execute `code` and return its events, filtered by the presentation
    /// policy.
    ///
    /// # Errors
    /// Returns `SessionClosed` if the process exited and
    /// `ExecutionTimeout` (with filtered partial events) if no completion
    /// arrived in time.
    pub async fn submit(
        &self,
        handle: &SessionHandle,
        code: &str,
        mode: Option<CaptureMode>,
    ) -> Result<Vec<OutputEvent>, SessionError> {
        let policy = self.config.policy;
        match handle.execute(code, mode, self.config.submit_timeout()).await {
            Ok(events) => Ok(policy.apply(events)),
            Err(SessionError::ExecutionTimeout {
                request,
                timeout,
                events,
            }) => Err(SessionError::ExecutionTimeout {
                request,
                timeout,
                events: policy.apply(events),
            }),
            Err(e) => Err(e),
        }
    }

    /// Terminate a session and remove it from the registry.
    pub async fn dispose(&self, handle: &SessionHandle) {
        let slot = self.sessions.read().await.get(handle.key()).cloned();
        if let Some(slot) = slot {
            let mut guard = slot.lock().await;
            if guard.as_ref().is_some_and(|s| Arc::ptr_eq(s, handle)) {
                *guard = None;
                drop(guard);
                let mut sessions = self.sessions.write().await;
                if sessions.get(handle.key()).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    sessions.remove(handle.key());
                }
            }
        }
        tracing::info!(session = %handle.id(), "Disposing session");
        handle.shutdown().await;
    }

    /// Forward human keystrokes.
    ///
    /// # Errors
    /// Returns error if the session closed or the write fails.
    pub async fn send_input(&self, handle: &SessionHandle, data: &[u8]) -> Result<(), SessionError> {
        handle.send_input(data).await
    }

    /// Resize the session terminal.
    ///
    /// # Errors
    /// Returns error if the resize fails.
    pub fn resize(&self, handle: &SessionHandle, cols: u16, rows: u16) -> Result<(), SessionError> {
        handle.resize(cols, rows)
    }

    /// Live view of a session: history, then new output.
    #[must_use]
    pub fn subscribe_view(&self, handle: &SessionHandle) -> BoxStream<'static, ViewMsg> {
        handle.subscribe_view()
    }

    #[must_use]
    pub fn state(&self, handle: &SessionHandle) -> SessionState {
        handle.state()
    }

    /// Look up a registered session by id.
    ///
    /// # Errors
    /// Returns `UnknownSession` if no registered session has this id.
    pub async fn find(&self, id: Uuid) -> Result<SessionHandle, SessionError> {
        for slot in self.slots().await {
            if let Some(session) = slot.lock().await.as_ref() {
                if session.id() == id {
                    return Ok(Arc::clone(session));
                }
            }
        }
        Err(SessionError::UnknownSession(id))
    }

    /// Registered sessions and their states. Sessions still in setup are
    /// reported as starting.
    pub async fn sessions(&self) -> Vec<(SessionKey, SessionState)> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter_map(|(key, slot)| match slot.try_lock() {
                Ok(guard) => guard.as_ref().map(|s| (key.clone(), s.state())),
                Err(_) => Some((key.clone(), SessionState::Starting)),
            })
            .collect()
    }

    /// Dispose every session.
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = self.sessions.write().await.drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let session = slot.lock().await.take();
            if let Some(session) = session {
                tracing::info!(session = %session.id(), "Disposing session");
                session.shutdown().await;
            }
        }
    }

    async fn slots(&self) -> Vec<Slot> {
        self.sessions.read().await.values().cloned().collect()
    }
}
