use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use taskloom_security::ToolAllowlist;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EngineEvent, EventSink};

/// Decides which capabilities need a human in the loop.
pub trait SafetyPolicy: Send + Sync {
    /// `None` leaves the decision to the gate, which then asks.
    fn requires_approval(&self, tool: &str) -> Option<bool>;
}

impl SafetyPolicy for ToolAllowlist {
    fn requires_approval(&self, tool: &str) -> Option<bool> {
        ToolAllowlist::requires_approval(self, tool)
    }
}

/// A request waiting for the user.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub id: String,
    pub command: String,
    pub directory: PathBuf,
    pub created_at: DateTime<Utc>,
}

struct Waiter {
    info: PendingConfirmation,
    resolver: oneshot::Sender<bool>,
}

/// Handle for one confirmation. Resolves to `false` when the request is
/// rejected or abandoned.
#[derive(Debug)]
pub struct ConfirmationTicket {
    id: String,
    state: TicketState,
}

#[derive(Debug)]
enum TicketState {
    Decided(bool),
    Waiting(oneshot::Receiver<bool>),
}

impl ConfirmationTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> bool {
        match self.state {
            TicketState::Decided(approved) => approved,
            TicketState::Waiting(rx) => rx.await.unwrap_or(false),
        }
    }
}

/// Tracks confirmation requests by id. Each id resolves at most once;
/// resolving an unknown or already-resolved id is a no-op returning `false`.
pub struct ApprovalGate {
    policy: Option<Arc<dyn SafetyPolicy>>,
    pending: Mutex<HashMap<String, Waiter>>,
    auto_run: AtomicBool,
    events: EventSink,
}

impl ApprovalGate {
    pub fn new(events: EventSink) -> Self {
        Self {
            policy: None,
            pending: Mutex::new(HashMap::new()),
            auto_run: AtomicBool::new(false),
            events,
        }
    }

    pub fn with_policy(policy: Arc<dyn SafetyPolicy>, events: EventSink) -> Self {
        Self {
            policy: Some(policy),
            ..Self::new(events)
        }
    }

    pub fn set_auto_run(&self, enabled: bool) {
        self.auto_run.store(enabled, Ordering::Release);
    }

    pub fn auto_run(&self) -> bool {
        self.auto_run.load(Ordering::Acquire)
    }

    /// Unclassified tools require approval.
    pub fn requires_approval(&self, tool: &str) -> bool {
        self.policy
            .as_ref()
            .and_then(|p| p.requires_approval(tool))
            .unwrap_or(true)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request and announce it. With auto-run enabled the ticket
    /// is approved immediately but the request is still announced.
    pub fn request_confirmation(
        &self,
        command: &str,
        directory: &Path,
        description: &str,
    ) -> ConfirmationTicket {
        let id = Uuid::new_v4().to_string();
        let auto = self.auto_run();
        self.events.emit(EngineEvent::ConfirmationRequested {
            id: id.clone(),
            command: command.to_string(),
            directory: directory.to_path_buf(),
            description: description.to_string(),
            auto_approved: auto,
        });

        if auto {
            debug!(%id, %command, "auto-run approved confirmation");
            return ConfirmationTicket {
                id,
                state: TicketState::Decided(true),
            };
        }

        let (tx, rx) = oneshot::channel();
        let info = PendingConfirmation {
            id: id.clone(),
            command: command.to_string(),
            directory: directory.to_path_buf(),
            created_at: Utc::now(),
        };
        self.lock().insert(
            id.clone(),
            Waiter {
                info,
                resolver: tx,
            },
        );
        info!(%id, %command, "waiting for confirmation");
        ConfirmationTicket {
            id,
            state: TicketState::Waiting(rx),
        }
    }

    pub fn approve(&self, id: &str) -> bool {
        self.resolve(id, true)
    }

    pub fn reject(&self, id: &str) -> bool {
        self.resolve(id, false)
    }

    fn resolve(&self, id: &str, approved: bool) -> bool {
        let Some(waiter) = self.lock().remove(id) else {
            debug!(%id, "confirmation already resolved or unknown");
            return false;
        };
        if waiter.resolver.send(approved).is_err() {
            warn!(%id, "confirmation resolved after its requester went away");
        }
        self.events.emit(EngineEvent::ConfirmationResolved {
            id: id.to_string(),
            approved,
        });
        true
    }

    pub fn pending(&self) -> Vec<PendingConfirmation> {
        let mut pending: Vec<_> = self.lock().values().map(|w| w.info.clone()).collect();
        pending.sort_by_key(|p| p.created_at);
        pending
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Drop every outstanding request; their tickets resolve to `false`.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        for (id, _) in &drained {
            self.events.emit(EngineEvent::ConfirmationResolved {
                id: id.clone(),
                approved: false,
            });
        }
        drained.len()
    }
}
