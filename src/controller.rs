//! Observe, reason, guard, act, repeat.
//!
//! One controller drives one session on its own page. Cancellation is checked
//! at every stage boundary; the only place the loop parks on an external actor
//! is the approval barrier.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::brain::{Reasoner, ReasoningRequest};
use crate::catalog::{SiteCatalog, normalize_url};
use crate::config::AgentConfig;
use crate::decision::parse_and_validate;
use crate::dom::{Observation, Observer};
use crate::driver::PageDriver;
use crate::error::{DriverError, FailureKind, GroundingFailure, Stage, StageFailure};
use crate::executor::Executor;
use crate::face::AgentEvent;
use crate::grounding::{GroundingError, Resolver};
use crate::guard::{CheckoutClassifier, SafetyGuard};
use crate::session::{Session, SessionSnapshot};
use crate::types::{
    ActionOutcome, ActionRecord, ApprovalDecision, ApprovalRequest, Command, IntendedAction,
    SessionStatus,
};

/// Inbound signals and the outbound snapshot of one session.
pub struct SessionSignals {
    pub cancel: CancellationToken,
    pub approvals: mpsc::Receiver<ApprovalReply>,
    pub snapshot: watch::Sender<SessionSnapshot>,
}

/// A human decision addressed to one specific approval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalReply {
    pub request_id: Uuid,
    pub decision: ApprovalDecision,
}

/// External capabilities a controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub page: Arc<dyn PageDriver>,
    pub reasoner: Arc<dyn Reasoner>,
    pub classifier: Arc<dyn CheckoutClassifier>,
    pub catalog: Arc<SiteCatalog>,
}

/// Observations per round while the page is detached or mid-navigation.
const OBSERVE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
struct LoopPolicy {
    history_window: usize,
    approval_timeout: Option<Duration>,
    navigation_timeout: Duration,
    navigation_settle: Duration,
}

enum Approval {
    Approved(IntendedAction),
    Denied(IntendedAction, Option<String>),
    Cancelled,
}

/// Why the cycle loop stopped early.
enum Halt {
    Cancelled,
    Failed(StageFailure),
}

impl From<StageFailure> for Halt {
    fn from(failure: StageFailure) -> Self {
        Halt::Failed(failure)
    }
}

pub struct SessionController {
    session: Session,
    page: Arc<dyn PageDriver>,
    reasoner: Arc<dyn Reasoner>,
    guard: SafetyGuard,
    observer: Observer,
    resolver: Resolver,
    executor: Executor,
    catalog: Arc<SiteCatalog>,
    policy: LoopPolicy,
    events: broadcast::Sender<AgentEvent>,
    signals: SessionSignals,
    emitted: usize,
}

impl SessionController {
    pub fn new(
        config: &AgentConfig,
        session: Session,
        collaborators: Collaborators,
        events: broadcast::Sender<AgentEvent>,
        signals: SessionSignals,
    ) -> Self {
        let Collaborators {
            page,
            reasoner,
            classifier,
            catalog,
        } = collaborators;
        Self {
            session,
            page,
            reasoner,
            guard: SafetyGuard::from_settings(&config.guard, classifier),
            observer: Observer::new(catalog.clone()),
            resolver: Resolver::from_settings(&config.grounding),
            executor: Executor::new(config.executor.clone()),
            catalog,
            policy: LoopPolicy {
                history_window: config.agent.history_window,
                approval_timeout: config.agent.approval_timeout_ms.map(Duration::from_millis),
                navigation_timeout: config.browser.navigation_timeout(),
                navigation_settle: Duration::from_millis(config.browser.settle_ms),
            },
            events,
            signals,
            emitted: 0,
        }
    }

    /// Runs the mission to a terminal status and returns the final session.
    pub async fn run(mut self) -> Session {
        let span = tracing::info_span!("session", session_id = %self.session.id);
        async move {
            tracing::info!(target: "agent.loop", goal = %self.session.goal, url = %self.session.start_url, "mission started");
            let line = format!("Mission started: {}", self.session.goal);
            self.session.log(line);

            match self.drive().await {
                Ok(()) => {}
                Err(Halt::Cancelled) => {
                    self.session.pending_approval = None;
                    self.session.log("Mission cancelled");
                    self.session.set_status(SessionStatus::Cancelled);
                    self.emit(None, None);
                }
                Err(Halt::Failed(failure)) => {
                    tracing::error!(
                        target: "agent.loop",
                        stage = ?failure.stage,
                        kind = ?failure.kind,
                        message = %failure.message,
                        "mission failed"
                    );
                    self.session.fail(failure);
                    self.emit(None, None);
                }
            }
            tracing::info!(
                target: "agent.loop",
                status = self.session.status.as_str(),
                iterations = self.session.iteration,
                actions = self.session.history.len(),
                "mission finished"
            );
            self.session
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) -> Result<(), Halt> {
        self.checkpoint()?;
        self.navigate().await?;

        let mut feedback: Option<String> = None;
        loop {
            self.checkpoint()?;
            if self.session.iteration >= self.session.max_iterations {
                return Err(StageFailure::new(
                    Stage::Loop,
                    FailureKind::IterationCapExceeded,
                    format!(
                        "iteration cap of {} reached without completing the goal",
                        self.session.max_iterations
                    ),
                )
                .into());
            }

            if self.session.status != SessionStatus::Observing {
                self.session.set_status(SessionStatus::Observing);
            }
            self.emit(None, None);
            let observation = self.observe().await?;
            if !observation.url.is_empty() {
                self.session.current_url = observation.url.clone();
            }
            let line = format!(
                "Observed {} interactive elements on {}",
                observation.markers.len(),
                self.session.current_url
            );
            self.session.log(line);

            let action = loop {
                self.checkpoint()?;
                self.session.set_status(SessionStatus::Reasoning);
                self.emit(Some(&observation.screenshot), None);

                let proposed = self.decide(&observation, feedback.take()).await?;
                self.checkpoint()?;

                if let Command::Done { summary } = &proposed.command {
                    let line = format!("Done: {summary}");
                    self.session.log(line);
                    self.session.set_status(SessionStatus::Completed);
                    tracing::info!(target: "agent.loop", summary = %summary, "goal reached");
                    self.emit(None, None);
                    return Ok(());
                }

                let risk = self
                    .guard
                    .assess_risk(
                        self.page.as_ref(),
                        &proposed,
                        &observation.markers,
                        &observation.screenshot,
                        &self.session.current_url,
                    )
                    .await
                    .map_err(|e| StageFailure::page_gone(Stage::Guard, &e))?;

                let Some(request) = risk else {
                    break proposed;
                };
                match self.await_approval(request).await {
                    Approval::Approved(pending) => break pending,
                    Approval::Denied(pending, reason) => {
                        feedback = Some(format!(
                            "The user denied `{}`{}. Do not try it again; choose another approach or finish with done.",
                            pending.describe(),
                            reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
                        ));
                        let record = self
                            .session
                            .history
                            .append(
                                pending,
                                ActionOutcome::Denied { reason },
                                SessionStatus::Reasoning,
                            )
                            .clone();
                        let line = format!("Action {}: {}", record.ordinal, record.outcome.summary());
                        self.session.log(line);
                        self.emit(None, Some(record));
                    }
                    Approval::Cancelled => return Err(Halt::Cancelled),
                }
            };

            self.session.set_status(SessionStatus::Acting);
            self.emit(None, None);
            let outcome = self
                .act(&observation, &action)
                .await
                .map_err(|e| StageFailure::page_gone(Stage::Act, &e))?;

            let record = self
                .session
                .history
                .append(action, outcome, SessionStatus::Observing)
                .clone();
            self.session.iteration += 1;
            let line = format!(
                "Action {}: {} -> {}",
                record.ordinal,
                record.action.describe(),
                record.outcome.summary()
            );
            self.session.log(line);
            self.session.set_status(SessionStatus::Observing);
            self.emit(None, Some(record));

            self.pause(self.executor.settle()).await;
        }
    }

    async fn navigate(&mut self) -> Result<(), Halt> {
        let url = normalize_url(&self.session.start_url);
        let wait = self.catalog.wait_strategy(&url);
        tracing::info!(target: "agent.loop", url = %url, wait = ?wait, "navigating");

        match self
            .page
            .navigate(&url, wait, self.policy.navigation_timeout)
            .await
        {
            Ok(landed) => {
                self.session.current_url = if landed.is_empty() { url.clone() } else { landed };
                let line = format!("Navigated to {}", self.session.current_url);
                self.session.log(line);
            }
            Err(e) if e.is_fatal() => return Err(StageFailure::page_gone(Stage::Navigate, &e).into()),
            Err(e) => {
                return Err(StageFailure::new(
                    Stage::Navigate,
                    FailureKind::NavigationFailure,
                    format!("could not reach {url}: {e}"),
                )
                .into());
            }
        }

        self.pause(self.catalog.settle(&url, self.policy.navigation_settle))
            .await;
        Ok(())
    }

    /// Observes until the marker pass succeeds, at most [`OBSERVE_ATTEMPTS`]
    /// times. The last unsettled observation is returned as is.
    async fn observe(&mut self) -> Result<Observation, Halt> {
        let mut attempt = 1;
        loop {
            let observation = self
                .observer
                .observe(self.page.as_ref())
                .await
                .map_err(|e| StageFailure::page_gone(Stage::Observe, &e))?;
            if observation.settled || attempt >= OBSERVE_ATTEMPTS {
                return Ok(observation);
            }
            tracing::info!(target: "agent.loop", attempt, "page not settled, observing again");
            self.pause(self.policy.navigation_settle).await;
            self.checkpoint()?;
            attempt += 1;
        }
    }

    /// One reasoning round with a single retry on an invalid decision.
    async fn decide(
        &mut self,
        observation: &Observation,
        mut feedback: Option<String>,
    ) -> Result<IntendedAction, StageFailure> {
        const ATTEMPTS: u32 = 2;

        for attempt in 1..=ATTEMPTS {
            let raw = {
                let request = ReasoningRequest {
                    goal: &self.session.goal,
                    url: &self.session.current_url,
                    screenshot: &observation.screenshot,
                    markers: &observation.markers,
                    history: self.session.history.recent(self.policy.history_window),
                    feedback: feedback.as_deref(),
                    page_context: self.catalog.context(&self.session.current_url),
                };
                self.reasoner.decide(&request).await.map_err(|e| {
                    StageFailure::new(Stage::Reason, FailureKind::ReasoningUnavailable, e.to_string())
                })?
            };

            match parse_and_validate(&raw, &observation.markers) {
                Ok(action) => {
                    tracing::info!(
                        target: "agent.decide",
                        action = %action.describe(),
                        rationale = %action.rationale,
                        "decision accepted"
                    );
                    let line = if action.rationale.is_empty() {
                        format!("Decision: {}", action.describe())
                    } else {
                        format!("Decision: {} ({})", action.describe(), action.rationale)
                    };
                    self.session.log(line);
                    return Ok(action);
                }
                Err(rejection) => {
                    tracing::warn!(
                        target: "agent.decide",
                        code = rejection.code(),
                        attempt,
                        error = %rejection,
                        "decision rejected"
                    );
                    let line = format!("Decision rejected ({}): {rejection}", rejection.code());
                    self.session.log(line);
                    if attempt == ATTEMPTS {
                        return Err(StageFailure::new(
                            Stage::Reason,
                            FailureKind::DecisionError,
                            format!("{}: {rejection}", rejection.code()),
                        ));
                    }
                    feedback = Some(format!(
                        "Your previous response was rejected ({}): {rejection}. Reply with one valid JSON action that only uses element numbers from the list.",
                        rejection.code()
                    ));
                    self.session.set_status(SessionStatus::Reasoning);
                    self.emit(None, None);
                }
            }
        }

        Err(StageFailure::new(
            Stage::Reason,
            FailureKind::DecisionError,
            "no decision produced",
        ))
    }

    /// Parks the session until the pending action is approved, denied or cancelled.
    async fn await_approval(&mut self, request: ApprovalRequest) -> Approval {
        tracing::warn!(
            target: "agent.guard",
            action = %request.action.describe(),
            score = request.risk_score,
            reasons = ?request.reasons,
            "approval required"
        );
        let line = format!(
            "Approval required for {}: {}",
            request.action.describe(),
            request.reasons.join("; ")
        );
        self.session.log(line);
        self.session.log(request.summary.render());
        let request_id = request.id;
        self.session.pending_approval = Some(request);
        self.session.set_status(SessionStatus::AwaitingApproval);
        self.emit(None, None);

        let timeout = self.policy.approval_timeout;
        let approvals = &mut self.signals.approvals;
        let decision = tokio::select! {
            _ = self.signals.cancel.cancelled() => None,
            decision = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, next_reply(approvals, request_id))
                        .await
                        .unwrap_or_else(|_| Some(ApprovalDecision::Deny {
                            reason: Some("approval timed out".into()),
                        })),
                    None => next_reply(approvals, request_id).await,
                }
            } => Some(decision.unwrap_or(ApprovalDecision::Deny {
                reason: Some("approval channel closed".into()),
            })),
        };

        let Some(pending) = self.session.pending_approval.take() else {
            return Approval::Cancelled;
        };
        match decision {
            None => Approval::Cancelled,
            Some(ApprovalDecision::Approve) => {
                tracing::info!(target: "agent.guard", request_id = %pending.id, "approved");
                self.session.log("Approved by user");
                Approval::Approved(pending.action)
            }
            Some(ApprovalDecision::Deny { reason }) => {
                tracing::info!(target: "agent.guard", request_id = %pending.id, reason = ?reason, "denied");
                Approval::Denied(pending.action, reason)
            }
        }
    }

    async fn act(
        &self,
        observation: &Observation,
        action: &IntendedAction,
    ) -> Result<ActionOutcome, DriverError> {
        let grounded = match action.target() {
            None => None,
            Some(id) => match observation.markers.get(id) {
                Some(marker) => match self.resolver.resolve(self.page.as_ref(), marker).await {
                    Ok(found) => Some(Ok(found)),
                    Err(GroundingError::Unresolved(failure)) => Some(Err(failure)),
                    Err(GroundingError::PageGone(e)) => return Err(e),
                },
                None => Some(Err(GroundingFailure { marker: id, tried: 0 })),
            },
        };
        self.executor
            .execute(self.page.as_ref(), action, grounded.as_ref())
            .await
    }

    fn checkpoint(&self) -> Result<(), Halt> {
        if self.signals.cancel.is_cancelled() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn pause(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.signals.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Publishes the current state plus any log lines not yet emitted.
    fn emit(&mut self, screenshot: Option<&[u8]>, record: Option<ActionRecord>) {
        let lines = self.session.messages[self.emitted..].to_vec();
        self.emitted = self.session.messages.len();
        let status = self.session.status;
        let event = AgentEvent {
            session_id: self.session.id,
            status,
            iteration: self.session.iteration,
            screenshot: screenshot
                .filter(|bytes| !bytes.is_empty())
                .map(|bytes| STANDARD.encode(bytes)),
            lines,
            approval: match status {
                SessionStatus::AwaitingApproval => self.session.pending_approval.clone(),
                _ => None,
            },
            error: match status {
                SessionStatus::Failed => self.session.last_error.clone(),
                _ => None,
            },
            record,
        };
        // no subscribers is fine
        let _ = self.events.send(event);
        self.signals.snapshot.send_replace(self.session.snapshot());
    }
}

/// Next decision for `request_id`. Replies to earlier requests are dropped.
async fn next_reply(
    approvals: &mut mpsc::Receiver<ApprovalReply>,
    request_id: Uuid,
) -> Option<ApprovalDecision> {
    while let Some(reply) = approvals.recv().await {
        if reply.request_id == request_id {
            return Some(reply.decision);
        }
        tracing::debug!(target: "agent.guard", stale = %reply.request_id, "ignoring reply to an earlier request");
    }
    None
}

/// Marks a session that never got a browser as failed and publishes it.
pub fn fail_before_start(
    mut session: Session,
    failure: StageFailure,
    events: &broadcast::Sender<AgentEvent>,
    snapshot: &watch::Sender<SessionSnapshot>,
) -> Session {
    tracing::error!(target: "agent.loop", session_id = %session.id, message = %failure.message, "mission could not start");
    session.fail(failure);
    let _ = events.send(AgentEvent {
        session_id: session.id,
        status: session.status,
        iteration: session.iteration,
        screenshot: None,
        lines: session.messages.clone(),
        approval: None,
        error: session.last_error.clone(),
        record: None,
    });
    snapshot.send_replace(session.snapshot());
    session
}
