//! A single interpreter session.

use std::{fmt, sync::Arc, time::Duration};

use futures::stream::BoxStream;
use repl_bridge_core::{
    BridgeConfig, CaptureMode, ChannelKind, ChannelPreference, CorrelationId, LiveView, OutputEvent,
    ProcessControl, ProcessSpawner, SessionContext, SessionKey, SessionState, ViewMsg,
};
use repl_bridge_protocol::{Dialect, Encoder};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use uuid::Uuid;

use crate::{
    SessionError,
    pump::{Pump, PumpCommand, PumpStatus},
};

/// How long `shutdown` waits for the process to go away.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Shared handle to a running session.
pub type SessionHandle = Arc<Session>;

/// One interpreter process plus its pump.
///
/// Requests are serialized by `execute`; input, resize and live-view
/// subscriptions may be used at any time.
pub struct Session {
    ctx: Arc<SessionContext>,
    encoder: Encoder,
    control: Arc<dyn ProcessControl>,
    resizable: bool,
    view: Arc<LiveView>,
    status: watch::Receiver<PumpStatus>,
    commands: mpsc::UnboundedSender<PumpCommand>,
    submit_lock: Mutex<()>,
    pid: Option<u32>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.ctx.session_id)
            .field("key", &self.ctx.key)
            .field("status", &*self.status.borrow())
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn the interpreter, inject the helpers and wait for readiness.
    ///
    /// # Errors
    /// Returns error if the process cannot be spawned or setup does not
    /// complete within the configured budget.
    pub async fn start<P: ProcessSpawner + ?Sized>(
        spawner: &P,
        dialect: Arc<dyn Dialect>,
        mut ctx: SessionContext,
        config: &BridgeConfig,
    ) -> Result<SessionHandle, SessionError> {
        let mut command = dialect.command();
        if let Some(extra) = config.interpreter_args.as_deref() {
            command = command.args_line(extra)?;
        }
        let spec = command
            .into_launch_spec(config.interpreter.as_deref(), &ctx, config.cols, config.rows)
            .await?;
        ctx.prepare().await?;
        let spawned = match spawner.spawn(&spec, &ctx).await {
            Ok(spawned) => spawned,
            Err(e) => {
                ctx.cleanup().await;
                return Err(e.into());
            }
        };

        if !spawned.capabilities.echoes_input && ctx.channel != ChannelPreference::SideLog {
            if ctx.channel == ChannelPreference::Scrape {
                tracing::warn!(session = %ctx.session_id, "Process does not echo input, using side log");
            }
            ctx.channel = ChannelPreference::SideLog;
        }

        let setup = dialect.setup(&ctx);
        if let Err(e) = tokio::fs::write(&setup.file, &setup.script).await {
            let _ = spawned.control.kill();
            ctx.cleanup().await;
            return Err(e.into());
        }

        let ctx = Arc::new(ctx);
        let control: Arc<dyn ProcessControl> = Arc::from(spawned.control);
        let view = Arc::new(LiveView::new(config.history_bytes));
        let (status_tx, status_rx) = watch::channel(PumpStatus {
            state: SessionState::Starting,
            channel: None,
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let pump = Pump::new(
            Arc::clone(&ctx),
            Arc::clone(&view),
            Arc::clone(&control),
            spawned.capabilities,
            status_tx,
        );
        tokio::spawn(pump.run(
            spawned.output,
            spawned.exit,
            commands_rx,
            config.poll_interval(),
        ));

        let session = Arc::new(Self {
            encoder: Encoder::new(dialect, Arc::clone(&ctx)),
            ctx,
            control,
            resizable: spawned.capabilities.resizable,
            view,
            status: status_rx,
            commands: commands_tx,
            submit_lock: Mutex::new(()),
            pid: spawned.pid,
        });

        session.await_setup(&setup.line, config).await?;
        Ok(session)
    }

    async fn await_setup(&self, line: &str, config: &BridgeConfig) -> Result<(), SessionError> {
        let attempts = config.setup_attempts.max(1);
        let per_attempt = config.setup_attempt_timeout();
        let mut status = self.status.clone();

        for attempt in 1..=attempts {
            tracing::debug!(session = %self.ctx.session_id, attempt, "Injecting session helpers");
            self.control.write(line.as_bytes()).await?;

            let waited = tokio::time::timeout(
                per_attempt,
                status.wait_for(|s| s.state != SessionState::Starting),
            )
            .await
            .map(|r| r.map(|s| s.state));
            match waited {
                Ok(Ok(SessionState::Closed) | Err(_)) => return Err(SessionError::SessionClosed),
                Ok(Ok(_)) => {
                    tracing::info!(
                        session = %self.ctx.session_id,
                        key = %self.ctx.key,
                        pid = ?self.pid,
                        channel = ?self.channel(),
                        "Session started"
                    );
                    return Ok(());
                }
                Err(_) => {
                    tracing::warn!(
                        session = %self.ctx.session_id,
                        attempt,
                        attempts,
                        "No readiness signal yet"
                    );
                }
            }
        }

        let _ = self.commands.send(PumpCommand::Shutdown);
        Err(SessionError::SetupTimeout(config.setup_timeout()))
    }

    /// Run `code` and collect its events.
    ///
    /// On timeout the session returns to Ready and the error carries every
    /// event observed so far.
    ///
    /// # Errors
    /// Returns error if the session closed, the code cannot be encoded or
    /// no completion arrived within `timeout`.
    pub async fn execute(
        &self,
        code: &str,
        mode: Option<CaptureMode>,
        timeout: Duration,
    ) -> Result<Vec<OutputEvent>, SessionError> {
        let _guard = self.submit_lock.lock().await;

        let status = *self.status.borrow();
        let channel = match status {
            PumpStatus {
                state: SessionState::Ready | SessionState::Executing,
                channel: Some(channel),
            } => channel,
            _ => return Err(SessionError::SessionClosed),
        };

        let encoded = self.encoder.encode(code, mode, channel, timeout)?;
        let id = encoded.request.id.clone();
        let (tx, mut rx) = oneshot::channel();
        self.commands
            .send(PumpCommand::Begin {
                id: id.clone(),
                markers: encoded.markers,
                deadline: encoded.request.deadline,
                resolver: tx,
            })
            .map_err(|_| SessionError::SessionClosed)?;

        if let Err(e) = self.control.write(encoded.text.as_bytes()).await {
            self.expire(&id).await;
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::SessionClosed),
            Err(_) => {
                let events = self.expire(&id).await;
                // Completion may have raced the expiry.
                if let Ok(result) = rx.try_recv() {
                    return result;
                }
                tracing::warn!(request = %id, ?timeout, partial = events.len(), "Request timed out");
                Err(SessionError::ExecutionTimeout {
                    request: id,
                    timeout,
                    events,
                })
            }
        }
    }

    async fn expire(&self, id: &CorrelationId) -> Vec<OutputEvent> {
        let (reply, events) = oneshot::channel();
        if self
            .commands
            .send(PumpCommand::Expire {
                id: id.clone(),
                reply,
            })
            .is_err()
        {
            return Vec::new();
        }
        events.await.unwrap_or_default()
    }

    /// Forward raw input, as if typed by the human.
    ///
    /// # Errors
    /// Returns error if the session closed or the write fails.
    pub async fn send_input(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::SessionClosed);
        }
        self.control.write(data).await?;
        Ok(())
    }

    /// Resize the terminal. A no-op for backends without one.
    ///
    /// # Errors
    /// Returns error if the resize fails.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.resizable {
            tracing::debug!(session = %self.ctx.session_id, "Resize ignored by backend");
            return Ok(());
        }
        self.control.resize(cols, rows)?;
        Ok(())
    }

    /// Live view: retained history first, then new output.
    #[must_use]
    pub fn subscribe_view(&self) -> BoxStream<'static, ViewMsg> {
        self.view.history_plus_stream()
    }

    #[must_use]
    pub fn view(&self) -> &Arc<LiveView> {
        &self.view
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Channel chosen during setup.
    #[must_use]
    pub fn channel(&self) -> Option<ChannelKind> {
        self.status.borrow().channel
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.ctx.session_id
    }

    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.ctx.key
    }

    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Terminate the process and wait until pending requests are rejected.
    pub async fn shutdown(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        let _ = self.commands.send(PumpCommand::Shutdown);
        let mut status = self.status.clone();
        let waited = tokio::time::timeout(
            SHUTDOWN_WAIT,
            status.wait_for(|s| s.state == SessionState::Closed),
        )
        .await;
        if waited.is_err() {
            tracing::warn!(session = %self.ctx.session_id, "Interpreter did not exit after kill");
        }
    }
}
