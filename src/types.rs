use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::GroundingFailure;

/// Rectangle of an element in document coordinates (CSS pixels).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn distance_to(&self, other: &BoundingBox) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }
}

/// How a candidate locator was derived. Declaration order is stability order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorStrategy {
    Identity,
    Name,
    DataAttribute,
    AriaLabel,
    ClassComposite,
    TypeRole,
    Catalog,
    Structural,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateLocator {
    pub strategy: LocatorStrategy,
    pub selector: String,
}

/// Best guess at what kind of control an element is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementRole {
    Button,
    Link,
    TextInput,
    TextArea,
    Select,
    Checkbox,
    Radio,
    Other,
}

impl ElementRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementRole::Button => "BUTTON",
            ElementRole::Link => "LINK",
            ElementRole::TextInput => "INPUT",
            ElementRole::TextArea => "TEXTAREA",
            ElementRole::Select => "SELECT",
            ElementRole::Checkbox => "CHECKBOX",
            ElementRole::Radio => "RADIO",
            ElementRole::Other => "ELEMENT",
        }
    }
}

/// One interactive element found by a single observation.
///
/// `id` only addresses the element within that observation; the next
/// observation renumbers everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementMarker {
    pub id: u32,
    pub tag: String,
    pub role: ElementRole,
    pub label: String,
    pub aria_label: Option<String>,
    pub placeholder: Option<String>,
    pub bbox: BoundingBox,
    /// Most stable first.
    pub locators: Vec<CandidateLocator>,
}

impl ElementMarker {
    /// Text a human would read for this element.
    pub fn display_label(&self) -> &str {
        if !self.label.is_empty() {
            &self.label
        } else if let Some(aria) = self.aria_label.as_deref().filter(|s| !s.is_empty()) {
            aria
        } else {
            self.placeholder.as_deref().unwrap_or("")
        }
    }
}

/// Markers of one observation, indexed by their dense identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarkerTable {
    markers: Vec<ElementMarker>,
}

impl MarkerTable {
    /// Builds a table from markers in document order, renumbering them `1..=N`.
    pub fn from_ordered(markers: Vec<ElementMarker>) -> Self {
        let markers = markers
            .into_iter()
            .enumerate()
            .map(|(idx, mut marker)| {
                marker.id = idx as u32 + 1;
                marker
            })
            .collect();
        Self { markers }
    }

    pub fn get(&self, id: u32) -> Option<&ElementMarker> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.markers.get(idx)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.markers.iter().map(|m| m.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ElementMarker> {
        self.markers.iter()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "up" => Some(ScrollDirection::Up),
            "down" => Some(ScrollDirection::Down),
            "left" => Some(ScrollDirection::Left),
            "right" => Some(ScrollDirection::Right),
            _ => None,
        }
    }
}

/// Closed set of things the reasoning service may ask for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    Click {
        target: u32,
    },
    Type {
        target: u32,
        text: String,
        submit: bool,
    },
    Scroll {
        direction: ScrollDirection,
        distance: Option<u32>,
    },
    Wait {
        ms: u64,
    },
    Done {
        summary: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Scroll,
    Wait,
    Done,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Scroll => "scroll",
            ActionKind::Wait => "wait",
            ActionKind::Done => "done",
        };
        f.write_str(name)
    }
}

/// A validated decision. Only [`crate::decision::parse_and_validate`] builds these
/// from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntendedAction {
    pub command: Command,
    pub rationale: String,
    pub confidence: Option<f64>,
}

impl IntendedAction {
    pub fn kind(&self) -> ActionKind {
        match self.command {
            Command::Click { .. } => ActionKind::Click,
            Command::Type { .. } => ActionKind::Type,
            Command::Scroll { .. } => ActionKind::Scroll,
            Command::Wait { .. } => ActionKind::Wait,
            Command::Done { .. } => ActionKind::Done,
        }
    }

    pub fn target(&self) -> Option<u32> {
        match self.command {
            Command::Click { target } | Command::Type { target, .. } => Some(target),
            _ => None,
        }
    }

    /// One-line description used in history prompts and logs.
    pub fn describe(&self) -> String {
        match &self.command {
            Command::Click { target } => format!("click on element [{target}]"),
            Command::Type { target, text, .. } => {
                format!("type \"{text}\" into element [{target}]")
            }
            Command::Scroll {
                direction,
                distance,
            } => match distance {
                Some(px) => format!("scroll {direction:?} by {px}px").to_lowercase(),
                None => format!("scroll {direction:?}").to_lowercase(),
            },
            Command::Wait { ms } => format!("wait {ms}ms"),
            Command::Done { summary } => format!("done: {summary}"),
        }
    }
}

/// Escalating click strategies, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickTier {
    Standard,
    Script,
    Forced,
}

impl ClickTier {
    pub const ALL: [ClickTier; 3] = [ClickTier::Standard, ClickTier::Script, ClickTier::Forced];
}

/// Which candidate locator grounded the target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Grounding {
    pub strategy: LocatorStrategy,
    pub selector: String,
    /// 1-based position of the winning locator in the marker's list.
    pub tier: usize,
    /// Accepted by the presence-only fallback pass.
    pub relaxed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierAttempt {
    pub tier: ClickTier,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionOutcome {
    Executed {
        grounding: Option<Grounding>,
        attempts: Vec<TierAttempt>,
    },
    ExecutionFailed {
        grounding: Option<Grounding>,
        attempts: Vec<TierAttempt>,
        reason: String,
    },
    GroundingFailed(GroundingFailure),
    Denied {
        reason: Option<String>,
    },
}

impl ActionOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, ActionOutcome::Executed { .. })
    }

    pub fn summary(&self) -> String {
        match self {
            ActionOutcome::Executed { grounding, .. } => match grounding {
                Some(g) => format!("succeeded via locator #{} ({:?})", g.tier, g.strategy),
                None => "succeeded".to_string(),
            },
            ActionOutcome::ExecutionFailed { reason, .. } => format!("failed: {reason}"),
            ActionOutcome::GroundingFailed(failure) => format!("failed: {failure}"),
            ActionOutcome::Denied { reason } => match reason {
                Some(r) => format!("denied by user: {r}"),
                None => "denied by user".to_string(),
            },
        }
    }
}

/// Append-only history entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRecord {
    pub ordinal: u64,
    pub action: IntendedAction,
    pub outcome: ActionOutcome,
    pub status_after: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Observing,
    Reasoning,
    AwaitingApproval,
    Acting,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Observing => "observing",
            SessionStatus::Reasoning => "reasoning",
            SessionStatus::AwaitingApproval => "awaiting_approval",
            SessionStatus::Acting => "acting",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Observing)
                | (Observing, Reasoning)
                | (Reasoning, Reasoning)
                | (Reasoning, Acting)
                | (Reasoning, AwaitingApproval)
                | (Reasoning, Completed)
                | (AwaitingApproval, Acting)
                | (AwaitingApproval, Reasoning)
                | (Acting, Observing)
        )
    }
}

/// Best-effort order details pulled from a checkout page.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderSummary {
    pub total_price: Option<String>,
    pub keywords: Vec<String>,
    pub confidence: f64,
    pub reasoning: Option<String>,
}

impl OrderSummary {
    pub fn render(&self) -> String {
        let mut lines = vec!["ORDER CONFIRMATION REQUIRED".to_string()];
        if let Some(price) = &self.total_price {
            lines.push(format!("Total price: {price}"));
        }
        if !self.keywords.is_empty() {
            lines.push(format!("Detected: {}", self.keywords.join(", ")));
        }
        lines.push(format!("Confidence: {:.0}%", self.confidence * 100.0));
        if let Some(reason) = &self.reasoning {
            lines.push(format!("Reason: {reason}"));
        }
        lines.push("This action may complete a purchase. Approve to continue.".to_string());
        lines.join("\n")
    }
}

/// Raised by the safety guard; resolved once by an external actor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub action: IntendedAction,
    pub target_label: Option<String>,
    pub summary: OrderSummary,
    pub risk_score: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny { reason: Option<String> },
}
