use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StageFailure;
use crate::types::{ActionOutcome, ActionRecord, ApprovalRequest, IntendedAction, SessionStatus};

/// Append-only action log. Records are never edited once pushed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionHistory {
    records: Vec<ActionRecord>,
}

impl ActionHistory {
    /// Appends a record, assigning the next ordinal (starting at 1).
    pub fn append(
        &mut self,
        action: IntendedAction,
        outcome: ActionOutcome,
        status_after: SessionStatus,
    ) -> &ActionRecord {
        let ordinal = self.records.len() as u64 + 1;
        self.records.push(ActionRecord {
            ordinal,
            action,
            outcome,
            status_after,
        });
        &self.records[self.records.len() - 1]
    }

    /// The last `n` records, oldest first.
    pub fn recent(&self, n: usize) -> &[ActionRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    pub fn as_slice(&self) -> &[ActionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&ActionRecord> {
        self.records.last()
    }
}

/// One shopping mission, owned by its controller for its whole life.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub goal: String,
    pub start_url: String,
    pub current_url: String,
    pub status: SessionStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub messages: Vec<String>,
    pub last_error: Option<StageFailure>,
    /// Set exactly while `status` is `AwaitingApproval`.
    pub pending_approval: Option<ApprovalRequest>,
    pub history: ActionHistory,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(goal: impl Into<String>, start_url: impl Into<String>, max_iterations: u32) -> Self {
        let start_url = start_url.into();
        Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            current_url: start_url.clone(),
            start_url,
            status: SessionStatus::Idle,
            iteration: 0,
            max_iterations,
            messages: Vec::new(),
            last_error: None,
            pending_approval: None,
            history: ActionHistory::default(),
            created_at: Utc::now(),
        }
    }

    /// Moves to `next`. Illegal transitions are logged and refused.
    pub fn set_status(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                target: "agent.loop",
                session_id = %self.id,
                from = self.status.as_str(),
                to = next.as_str(),
                "illegal status transition refused"
            );
            return false;
        }
        tracing::debug!(
            target: "agent.loop",
            session_id = %self.id,
            from = self.status.as_str(),
            to = next.as_str(),
            "status"
        );
        self.status = next;
        true
    }

    /// Appends to the message log and returns the line for event emission.
    pub fn log(&mut self, line: impl Into<String>) -> String {
        let line = line.into();
        self.messages.push(line.clone());
        line
    }

    pub fn fail(&mut self, failure: StageFailure) {
        self.log(format!("Failed during {:?}: {}", failure.stage, failure.message));
        self.last_error = Some(failure);
        self.pending_approval = None;
        self.set_status(SessionStatus::Failed);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            goal: self.goal.clone(),
            start_url: self.start_url.clone(),
            current_url: self.current_url.clone(),
            status: self.status,
            iteration: self.iteration,
            max_iterations: self.max_iterations,
            actions: self.history.len(),
            last_error: self.last_error.clone(),
            pending_approval: self.pending_approval.clone(),
            messages: self.messages.clone(),
            created_at: self.created_at,
        }
    }
}

/// Read-only view served to the progress viewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub goal: String,
    pub start_url: String,
    pub current_url: String,
    pub status: SessionStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub actions: usize,
    pub last_error: Option<StageFailure>,
    pub pending_approval: Option<ApprovalRequest>,
    pub messages: Vec<String>,
    pub created_at: DateTime<Utc>,
}
