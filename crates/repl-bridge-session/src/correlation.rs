//! Pending requests keyed by correlation id.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use repl_bridge_core::{CorrelationId, OutputEvent};
use tokio::sync::oneshot;

use crate::SessionError;

/// Delivers the outcome of one request.
pub type Resolver = oneshot::Sender<Result<Vec<OutputEvent>, SessionError>>;

/// Extra time past the deadline before an unattended entry is dropped.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

struct Pending {
    events: Vec<OutputEvent>,
    resolver: Option<Resolver>,
    deadline: Instant,
    completed: bool,
}

/// Accumulates events per request and resolves each request exactly once.
///
/// Owned by a single task; nothing here is synchronized.
pub struct CorrelationTable {
    entries: HashMap<CorrelationId, Pending>,
    grace: Duration,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

impl CorrelationTable {
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            grace,
        }
    }

    /// Start accumulating for `id`.
    pub fn open(&mut self, id: CorrelationId, deadline: Instant) {
        self.entries.insert(
            id,
            Pending {
                events: Vec::new(),
                resolver: None,
                deadline,
                completed: false,
            },
        );
    }

    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an event to its request. Returns `false` (and drops the
    /// event) when the request is no longer pending.
    pub fn push(&mut self, event: OutputEvent) -> bool {
        match self.entries.get_mut(&event.request_id) {
            Some(entry) if !entry.completed => {
                entry.events.push(event);
                true
            }
            _ => {
                tracing::debug!(request = %event.request_id, "Discarding late event");
                false
            }
        }
    }

    /// Completion arrived. Delivers to an attached resolver, otherwise
    /// keeps the events until `attach` or `take_completed`.
    pub fn complete(&mut self, id: &CorrelationId) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            tracing::debug!(request = %id, "Completion for unknown request ignored");
            return false;
        };
        entry.completed = true;
        if entry.resolver.is_some() {
            self.deliver(id);
        }
        true
    }

    /// Register the resolver for `id`. Resolves immediately if the request
    /// already completed; a request that is gone resolves as closed.
    pub fn attach(&mut self, id: &CorrelationId, resolver: Resolver) {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.resolver = Some(resolver);
                if entry.completed {
                    self.deliver(id);
                }
            }
            None => {
                let _ = resolver.send(Err(SessionError::SessionClosed));
            }
        }
    }

    /// Events of a completed request, removing it.
    pub fn take_completed(&mut self, id: &CorrelationId) -> Option<Vec<OutputEvent>> {
        if !self.entries.get(id)?.completed {
            return None;
        }
        self.entries.remove(id).map(|e| e.events)
    }

    /// Forget `id` and return what it had accumulated. Its resolver is
    /// dropped without a value, so a late completion becomes a no-op.
    pub fn expire(&mut self, id: &CorrelationId) -> Vec<OutputEvent> {
        self.entries.remove(id).map(|e| e.events).unwrap_or_default()
    }

    /// Drop entries whose caller went away or that are long past their
    /// deadline. Returns the removed ids.
    pub fn prune_abandoned(&mut self, now: Instant) -> Vec<CorrelationId> {
        let grace = self.grace;
        let stale: Vec<CorrelationId> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.resolver.as_ref().is_some_and(oneshot::Sender::is_closed)
                    || now > e.deadline + grace
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            tracing::debug!(request = %id, "Pruning abandoned request");
            self.entries.remove(id);
        }
        stale
    }

    /// Fail every pending request with `SessionClosed`.
    pub fn reject_all(&mut self) {
        for (id, entry) in self.entries.drain() {
            if let Some(resolver) = entry.resolver {
                tracing::debug!(request = %id, "Rejecting pending request");
                let _ = resolver.send(Err(SessionError::SessionClosed));
            }
        }
    }

    fn deliver(&mut self, id: &CorrelationId) {
        if let Some(Pending {
            events,
            resolver: Some(resolver),
            ..
        }) = self.entries.remove(id)
        {
            let _ = resolver.send(Ok(events));
        }
    }
}
