use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ReasoningError;
use crate::llm::VisionModel;
use crate::types::{ActionRecord, MarkerTable};

const MAX_PROMPT_LABEL_CHARS: usize = 60;

const SYSTEM_PROMPT: &str = r#"You are a shopping assistant driving a real Chrome browser. Every screenshot you receive has red numbered labels painted over the interactive elements. You issue ONE action at a time as JSON.

Available actions:
- {"action":"click","target":3,"reasoning":"..."}
- {"action":"type","target":5,"value":"usb-c cable","submit":true,"reasoning":"..."}
- {"action":"scroll","direction":"down","distance":600,"reasoning":"..."}
- {"action":"wait","ms":1500,"reasoning":"..."}
- {"action":"done","summary":"Added the cheapest usb-c cable to the cart","reasoning":"..."}

Rules:
1. Return ONLY a single JSON object. No markdown, no explanation.
2. "target" must be one of the numbered labels listed in the element list. Numbers change on every screenshot.
3. "type" presses Enter afterwards unless "submit" is false.
4. Do not repeat an action that just failed; pick a different element or approach.
5. If a purchase confirmation was denied by the user, do not try to place the order again.
6. When the goal is accomplished, or cannot be accomplished, use "done" with a summary.
7. You may add "confidence" between 0 and 1."#;

/// What the reasoning service is told about the current round.
#[derive(Debug, Clone, Copy)]
pub struct ReasoningRequest<'a> {
    pub goal: &'a str,
    pub url: &'a str,
    pub screenshot: &'a [u8],
    pub markers: &'a MarkerTable,
    /// Already truncated to the history window, oldest first.
    pub history: &'a [ActionRecord],
    /// Why the previous response or action was refused.
    pub feedback: Option<&'a str>,
    pub page_context: Option<&'a str>,
}

/// Produces a raw decision payload for one round.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn decide(&self, request: &ReasoningRequest<'_>) -> Result<String, ReasoningError>;
}

/// [`Reasoner`] backed by a vision model, retried with exponential backoff.
pub struct Brain {
    model: Arc<dyn VisionModel>,
    attempts: u32,
    backoff_base: Duration,
}

impl Brain {
    pub fn new(model: Arc<dyn VisionModel>, attempts: u32, backoff_base: Duration) -> Self {
        Self {
            model,
            attempts: attempts.max(1),
            backoff_base,
        }
    }
}

#[async_trait]
impl Reasoner for Brain {
    async fn decide(&self, request: &ReasoningRequest<'_>) -> Result<String, ReasoningError> {
        let prompt = build_prompt(request);
        let mut made = 0;
        let mut last = String::new();

        while made < self.attempts {
            made += 1;
            tracing::debug!(target: "agent.decide", model = self.model.model_name(), attempt = made, "asking model");
            match self
                .model
                .complete(SYSTEM_PROMPT, &prompt, Some(request.screenshot))
                .await
            {
                Ok(text) => {
                    tracing::debug!(target: "agent.decide", response = %text, "model replied");
                    return Ok(text);
                }
                Err(e) => {
                    tracing::warn!(target: "agent.decide", attempt = made, error = %e, "model call failed");
                    last = e.to_string();
                    if !e.is_transient() {
                        break;
                    }
                    if made < self.attempts {
                        tokio::time::sleep(self.backoff_base * 2u32.saturating_pow(made - 1)).await;
                    }
                }
            }
        }

        Err(ReasoningError::Unavailable {
            attempts: made,
            last,
        })
    }
}

/// One `[n] ROLE - "label"` line per marker.
pub fn format_markers(markers: &MarkerTable) -> String {
    let mut out = String::new();
    if markers.is_empty() {
        out.push_str("(none detected; consider scrolling or waiting)\n");
    }
    for marker in markers.iter() {
        let _ = write!(out, "[{}] {}", marker.id, marker.role.as_str());
        let label: String = marker.label.chars().take(MAX_PROMPT_LABEL_CHARS).collect();
        if !label.is_empty() {
            let _ = write!(out, " - \"{label}\"");
        } else if let Some(aria) = &marker.aria_label {
            let _ = write!(out, " - (aria: \"{aria}\")");
        } else if let Some(placeholder) = &marker.placeholder {
            let _ = write!(out, " - (placeholder: \"{placeholder}\")");
        }
        out.push('\n');
    }
    out
}

/// User prompt for one round: goal, numbered elements, recent actions, feedback.
pub fn build_prompt(request: &ReasoningRequest<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "USER GOAL: {}", request.goal);
    let _ = writeln!(out, "CURRENT URL: {}", request.url);
    if let Some(context) = request.page_context {
        let _ = writeln!(out, "PAGE CONTEXT: {context}");
    }

    out.push_str("\nAVAILABLE INTERACTIVE ELEMENTS:\n");
    out.push_str(&format_markers(request.markers));

    out.push_str("\nPREVIOUS ACTIONS:\n");
    if request.history.is_empty() {
        out.push_str("None (this is the first action)\n");
    }
    for record in request.history {
        let _ = writeln!(
            out,
            "  {}. {} -> {}",
            record.ordinal,
            record.action.describe(),
            record.outcome.summary()
        );
    }

    if let Some(feedback) = request.feedback {
        let _ = writeln!(out, "\nFEEDBACK: {feedback}");
    }

    out.push_str("\nDecide the NEXT BEST ACTION toward the goal. Return ONLY the JSON object.");
    out
}
