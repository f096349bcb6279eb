//! Error taxonomy shared by every stage of the loop.
//!
//! Stage-local, recoverable failures ([`GroundingFailure`], a single
//! [`DecisionRejection`]) are absorbed into session history. Everything that
//! ends a mission is folded into a [`StageFailure`] before it reaches the
//! viewer.

use serde::Serialize;
use std::time::Duration;

use crate::types::ActionKind;

/// Errors surfaced by the automation engine boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("page is detached or mid-navigation: {0}")]
    Detached(String),

    #[error("browser session is gone: {0}")]
    SessionGone(String),

    #[error("no element matches `{0}`")]
    NoMatch(String),

    #[error("element `{0}` is not actionable")]
    NotActionable(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("browser engine error: {0}")]
    Engine(String),
}

impl DriverError {
    /// The page or browser is gone for good; nothing later in the loop can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::SessionGone(_))
    }
}

/// The resolver could not ground a marker to a live element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("no candidate locator for marker [{marker}] matched ({tried} tried)")]
pub struct GroundingFailure {
    pub marker: u32,
    pub tried: usize,
}

/// Why a reasoning response was refused by the validator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecisionRejection {
    #[error("response contained no JSON object")]
    NoPayload,

    #[error("payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("payload has no action kind")]
    MissingKind,

    #[error("unknown action kind `{0}`")]
    UnknownKind(String),

    #[error("`{0}` requires a target marker")]
    MissingTarget(ActionKind),

    #[error("marker [{0}] is not in the latest observation")]
    UnknownTarget(u32),

    #[error("`type` requires non-empty text")]
    EmptyText,

    #[error("`scroll` requires a direction")]
    MissingDirection,

    #[error("unknown scroll direction `{0}`")]
    BadDirection(String),

    #[error("`done` requires a summary")]
    MissingSummary,
}

impl DecisionRejection {
    /// Stable machine-readable reason, fed back to the reasoning service.
    pub fn code(&self) -> &'static str {
        match self {
            DecisionRejection::NoPayload => "no_payload",
            DecisionRejection::Malformed(_) => "malformed_json",
            DecisionRejection::MissingKind => "missing_kind",
            DecisionRejection::UnknownKind(_) => "unknown_kind",
            DecisionRejection::MissingTarget(_) => "missing_target",
            DecisionRejection::UnknownTarget(_) => "unknown_target",
            DecisionRejection::EmptyText => "empty_text",
            DecisionRejection::MissingDirection => "missing_direction",
            DecisionRejection::BadDirection(_) => "bad_direction",
            DecisionRejection::MissingSummary => "missing_summary",
        }
    }
}

/// Failures of the reasoning collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ReasoningError {
    #[error("reasoning service unavailable after {attempts} attempt(s): {last}")]
    Unavailable { attempts: u32, last: String },
}

/// Loop stage a failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Launch,
    Navigate,
    Observe,
    Reason,
    Guard,
    Act,
    Loop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DecisionError,
    ReasoningUnavailable,
    NavigationFailure,
    BrowserUnavailable,
    PageGone,
    IterationCapExceeded,
}

/// Terminal failure of a session, surfaced verbatim to the viewer.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{kind:?} during {stage:?}: {message}")]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: Stage, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    pub fn page_gone(stage: Stage, err: &DriverError) -> Self {
        Self::new(stage, FailureKind::PageGone, err.to_string())
    }
}
