//! Process-wide table of running sessions, keyed by id.
//!
//! The registry never touches a session's state directly. It holds the
//! inbound ends of the session's signals and a read-only snapshot.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::controller::{ApprovalReply, SessionSignals};
use crate::session::{Session, SessionSnapshot};
use crate::types::{ApprovalDecision, SessionStatus};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no session with id {0}")]
    NotFound(Uuid),

    #[error("session {0} is not awaiting approval")]
    NotAwaitingApproval(Uuid),

    #[error("session {0} is no longer running")]
    Closed(Uuid),
}

struct SessionHandle {
    cancel: CancellationToken,
    approvals: mpsc::Sender<ApprovalReply>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session` and returns the signals its controller consumes.
    pub fn create(&self, session: &Session) -> SessionSignals {
        let cancel = CancellationToken::new();
        let (approvals_tx, approvals_rx) = mpsc::channel(4);
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        self.sessions.insert(
            session.id,
            SessionHandle {
                cancel: cancel.clone(),
                approvals: approvals_tx,
                snapshot: snapshot_rx,
            },
        );
        tracing::debug!(target: "agent.loop", session_id = %session.id, "session registered");
        SessionSignals {
            cancel,
            approvals: approvals_rx,
            snapshot: snapshot_tx,
        }
    }

    pub fn lookup(&self, id: Uuid) -> Option<SessionSnapshot> {
        self.sessions.get(&id).map(|h| h.snapshot.borrow().clone())
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<_> = self
            .sessions
            .iter()
            .map(|h| h.snapshot.borrow().clone())
            .collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Requests cooperative cancellation. Idempotent.
    pub fn cancel(&self, id: Uuid) -> Result<(), RegistryError> {
        let handle = self.sessions.get(&id).ok_or(RegistryError::NotFound(id))?;
        handle.cancel.cancel();
        tracing::info!(target: "agent.loop", session_id = %id, "cancellation requested");
        Ok(())
    }

    /// Delivers a decision for the session's pending approval request.
    pub fn resolve_approval(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
    ) -> Result<(), RegistryError> {
        let handle = self.sessions.get(&id).ok_or(RegistryError::NotFound(id))?;
        let request_id = {
            let snapshot = handle.snapshot.borrow();
            match (&snapshot.pending_approval, snapshot.status) {
                (Some(request), SessionStatus::AwaitingApproval) => request.id,
                _ => return Err(RegistryError::NotAwaitingApproval(id)),
            }
        };
        handle
            .approvals
            .try_send(ApprovalReply {
                request_id,
                decision,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => RegistryError::NotAwaitingApproval(id),
                mpsc::error::TrySendError::Closed(_) => RegistryError::Closed(id),
            })
    }

    /// Removes the session, returning its last snapshot.
    pub fn dispose(&self, id: Uuid) -> Option<SessionSnapshot> {
        let (_, handle) = self.sessions.remove(&id)?;
        handle.cancel.cancel();
        let last = handle.snapshot.borrow().clone();
        Some(last)
    }

    /// Disposes every session in a terminal status. Returns how many went.
    pub fn prune_finished(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, h| !h.snapshot.borrow().status.is_terminal());
        before.saturating_sub(self.sessions.len())
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|h| !h.snapshot.borrow().status.is_terminal())
            .count()
    }
}
