//! Per-session output pump.
//!
//! One task per session drains the process output, feeds the live view,
//! detects readiness, drives the active channel and owns the correlation
//! table. Everything else talks to it through `PumpCommand`s.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use repl_bridge_core::{
    Capabilities, ChannelKind, ChannelPreference, CorrelationId, LiveView, OutputEvent,
    ProcessControl, Record, RecordType, SessionContext, SessionState,
};
use repl_bridge_protocol::{
    Channel, DisplayCleaner, ReadyScanner, ScrapeMarkers, channel, channel::ready_file_matches,
    classify,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::MissedTickBehavior,
};

use crate::{
    SessionError,
    correlation::{CorrelationTable, Resolver},
};

/// How long output is still drained after the process exited.
const EXIT_DRAIN: Duration = Duration::from_millis(200);

/// Lifecycle state and the channel in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpStatus {
    pub state: SessionState,
    pub channel: Option<ChannelKind>,
}

pub(crate) enum PumpCommand {
    /// A request is about to be written.
    Begin {
        id: CorrelationId,
        markers: Option<ScrapeMarkers>,
        deadline: Instant,
        resolver: Resolver,
    },
    /// Give up on a request and return its partial events.
    Expire {
        id: CorrelationId,
        reply: oneshot::Sender<Vec<OutputEvent>>,
    },
    /// Terminate the process.
    Shutdown,
}

pub(crate) struct Pump {
    ctx: Arc<SessionContext>,
    view: Arc<LiveView>,
    control: Arc<dyn ProcessControl>,
    capabilities: Capabilities,
    status: watch::Sender<PumpStatus>,
    cleaner: DisplayCleaner,
    ready: ReadyScanner,
    channel: Option<Box<dyn Channel>>,
    table: CorrelationTable,
    active: Option<CorrelationId>,
    killed: bool,
}

impl Pump {
    pub(crate) fn new(
        ctx: Arc<SessionContext>,
        view: Arc<LiveView>,
        control: Arc<dyn ProcessControl>,
        capabilities: Capabilities,
        status: watch::Sender<PumpStatus>,
    ) -> Self {
        Self {
            ready: ReadyScanner::new(&ctx),
            ctx,
            view,
            control,
            capabilities,
            status,
            cleaner: DisplayCleaner::new(),
            channel: None,
            table: CorrelationTable::default(),
            active: None,
            killed: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut output: mpsc::UnboundedReceiver<Bytes>,
        mut exit: oneshot::Receiver<Option<i32>>,
        mut commands: mpsc::UnboundedReceiver<PumpCommand>,
        poll_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut output_open = true;
        let mut commands_open = true;

        let code = loop {
            // Commands first: a request's output must never be seen before
            // its Begin.
            tokio::select! {
                biased;
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        // Every handle is gone.
                        commands_open = false;
                        self.kill();
                    }
                },
                _ = ticker.tick() => self.on_tick().await,
                chunk = output.recv(), if output_open => match chunk {
                    Some(chunk) => self.on_output(&chunk).await,
                    None => output_open = false,
                },
                code = &mut exit => break code.ok().flatten(),
            }
        };

        if output_open {
            while let Ok(Some(chunk)) = tokio::time::timeout(EXIT_DRAIN, output.recv()).await {
                self.on_output(&chunk).await;
            }
        }
        self.poll_channel().await;
        self.close(code).await;
    }

    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    fn set_state(&self, next: SessionState) {
        let current = self.state();
        if current == next {
            return;
        }
        if !current.can_transition(next) {
            tracing::warn!(session = %self.ctx.session_id, ?current, ?next, "Unexpected state transition");
        }
        tracing::debug!(session = %self.ctx.session_id, ?current, ?next, "State transition");
        self.status.send_modify(|s| s.state = next);
    }

    async fn on_output(&mut self, chunk: &[u8]) {
        let text = self.cleaner.clean(chunk);
        if text.is_empty() {
            return;
        }
        self.view.push_output(text.as_str());

        match self.state() {
            SessionState::Starting => {
                if let Some(kind) = self.ready.push(&text) {
                    self.on_ready(kind);
                }
            }
            SessionState::Executing => {
                if let Some(channel) = self.channel.as_mut() {
                    let records = channel.on_stream(&text);
                    self.apply(records).await;
                }
            }
            SessionState::Ready | SessionState::Closed => {}
        }
    }

    async fn on_tick(&mut self) {
        if self.state() == SessionState::Starting
            && self.ctx.channel != ChannelPreference::Scrape
            && ready_file_matches(&self.ctx.ready_file, &self.ctx.ready_token).await
        {
            self.on_ready(ChannelKind::SideLog);
        }
        self.poll_channel().await;

        for id in self.table.prune_abandoned(Instant::now()) {
            self.finish_active(&id);
        }
    }

    async fn poll_channel(&mut self) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        match channel.poll().await {
            Ok(records) => self.apply(records).await,
            Err(e) => {
                tracing::error!(session = %self.ctx.session_id, "Failed to read side log: {e}");
            }
        }
    }

    fn on_ready(&mut self, reported: ChannelKind) {
        if reported == ChannelKind::Scrape && !self.capabilities.echoes_input {
            tracing::error!(
                session = %self.ctx.session_id,
                "Side log unavailable and the process does not echo input"
            );
            return;
        }
        if reported == ChannelKind::Scrape && self.ctx.channel == ChannelPreference::SideLog {
            tracing::warn!(session = %self.ctx.session_id, "Side log not writable, falling back to scrape");
        }

        tracing::info!(session = %self.ctx.session_id, channel = ?reported, "Session ready");
        self.channel = Some(channel::open(reported, &self.ctx));
        self.status.send_modify(|s| s.channel = Some(reported));
        self.set_state(SessionState::Ready);
    }

    async fn on_command(&mut self, cmd: PumpCommand) {
        match cmd {
            PumpCommand::Begin {
                id,
                markers,
                deadline,
                resolver,
            } => {
                let Some(channel) = self.channel.as_mut() else {
                    let _ = resolver.send(Err(SessionError::SessionClosed));
                    return;
                };
                if let Some(previous) = self.active.take() {
                    tracing::warn!(request = %previous, "Request superseded before completion");
                    channel.disarm(&previous);
                }
                tracing::debug!(session = %self.ctx.session_id, request = %id, "Request started");
                channel.arm(&id, markers);
                self.table.open(id.clone(), deadline);
                self.table.attach(&id, resolver);
                self.active = Some(id);
                self.set_state(SessionState::Executing);
            }
            PumpCommand::Expire { id, reply } => {
                self.drain_partial(&id).await;
                let events = self.table.expire(&id);
                tracing::info!(request = %id, partial = events.len(), "Request expired");
                self.finish_active(&id);
                let _ = reply.send(events);
            }
            PumpCommand::Shutdown => self.kill(),
        }
    }

    async fn apply(&mut self, records: Vec<Record>) {
        for record in records {
            match record.kind {
                RecordType::CellStart => {
                    tracing::debug!(request = %record.id, "Cell started");
                }
                RecordType::CellEnd => {
                    let id = record.id;
                    // State is Ready before the resolver fires.
                    self.finish_active(&id);
                    self.table.complete(&id);
                }
                _ if self.table.contains(&record.id) => {
                    if let Some(event) = classify(record).await {
                        self.table.push(event);
                    }
                }
                _ => discard_late(record).await,
            }
        }
    }

    /// Collect what the channel holds for `id` before it is expired. A
    /// completion found here resolves the request normally.
    async fn drain_partial(&mut self, id: &CorrelationId) {
        if self.active.as_ref() != Some(id) {
            return;
        }
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        match channel.drain_partial(id).await {
            Ok(records) => self.apply(records).await,
            Err(e) => {
                tracing::error!(session = %self.ctx.session_id, "Failed to read side log: {e}");
            }
        }
    }

    fn finish_active(&mut self, id: &CorrelationId) {
        if self.active.as_ref() != Some(id) {
            return;
        }
        self.active = None;
        if let Some(channel) = self.channel.as_mut() {
            channel.disarm(id);
        }
        self.set_state(SessionState::Ready);
    }

    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        tracing::info!(session = %self.ctx.session_id, "Terminating interpreter");
        if let Err(e) = self.control.kill() {
            tracing::warn!(session = %self.ctx.session_id, "Failed to kill interpreter: {e}");
        }
    }

    async fn close(mut self, code: Option<i32>) {
        tracing::info!(session = %self.ctx.session_id, ?code, "Session closed");
        self.ctx.cleanup().await;
        self.set_state(SessionState::Closed);
        self.view.push_exited(code);
        self.table.reject_all();
    }
}

async fn discard_late(record: Record) {
    tracing::debug!(request = %record.id, kind = ?record.kind, "Discarding record for unknown request");
    if record.kind == RecordType::Plot {
        let _ = tokio::fs::remove_file(record.content.trim()).await;
    }
}
