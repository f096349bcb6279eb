//! Purchase safety gate.
//!
//! Risk is a weighted sum of three signals: a high-risk phrase in the target's
//! label, a high-risk phrase in the page text, and a checkout verdict from a
//! screenshot classifier. A click whose label matches a phrase is always
//! flagged, whatever the weights say.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::GuardSettings;
use crate::decision::extract_json;
use crate::driver::PageDriver;
use crate::error::DriverError;
use crate::llm::{LlmError, VisionModel};
use crate::types::{ActionKind, ApprovalRequest, IntendedAction, MarkerTable, OrderSummary};

/// Visible text of the page body.
pub const PAGE_TEXT_SCRIPT: &str =
    "(() => (document.body ? document.body.innerText : '').slice(0, 20000))()";

const CHECKOUT_SYSTEM: &str =
    "You classify web page screenshots for a shopping agent. Answer with JSON only.";

const CHECKOUT_PROMPT: &str = r#"Is this screenshot a checkout or order confirmation page?

Look for:
- "Place Order", "Complete Purchase", "Confirm Order" buttons
- Payment fields (credit card, billing address)
- An order summary with a total price
- Shipping information forms
- "Review Order" or "Checkout" headings
- Terms and conditions checkboxes near a purchase button

Return ONLY valid JSON:
{
  "is_checkout": true | false,
  "confidence": 0.0 to 1.0,
  "detected_keywords": ["keyword1", "keyword2"],
  "total_price": "price string" | null,
  "reasoning": "brief explanation"
}

Be conservative: only return is_checkout=true if you are confident."#;

/// Screenshot classifier output.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CheckoutVerdict {
    pub is_checkout: bool,
    pub confidence: f64,
    pub detected_keywords: Vec<String>,
    pub total_price: Option<String>,
    pub reasoning: Option<String>,
}

#[async_trait]
pub trait CheckoutClassifier: Send + Sync {
    async fn classify(&self, screenshot: &[u8]) -> Result<CheckoutVerdict, LlmError>;
}

/// [`CheckoutClassifier`] that asks a vision model.
pub struct VisionClassifier {
    model: Arc<dyn VisionModel>,
}

impl VisionClassifier {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl CheckoutClassifier for VisionClassifier {
    async fn classify(&self, screenshot: &[u8]) -> Result<CheckoutVerdict, LlmError> {
        let raw = self
            .model
            .complete(CHECKOUT_SYSTEM, CHECKOUT_PROMPT, Some(screenshot))
            .await?;
        let verdict = extract_json(&raw)
            .ok()
            .and_then(|obj| serde_json::from_value::<CheckoutVerdict>(Value::Object(obj)).ok());
        match verdict {
            Some(mut v) => {
                v.confidence = v.confidence.clamp(0.0, 1.0);
                Ok(v)
            }
            None => {
                tracing::warn!(target: "agent.guard", response = %raw, "unreadable checkout verdict");
                Ok(CheckoutVerdict::default())
            }
        }
    }
}

/// Phrases, weights and threshold.
#[derive(Debug, Clone)]
pub struct RiskPolicy {
    phrases: Vec<String>,
    label_weight: f64,
    page_text_weight: f64,
    classifier_weight: f64,
    threshold: f64,
    classifier_floor: f64,
    page_text_chars: usize,
}

impl RiskPolicy {
    pub fn from_settings(settings: &GuardSettings) -> Self {
        Self {
            phrases: settings
                .phrases
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            label_weight: settings.label_weight,
            page_text_weight: settings.page_text_weight,
            classifier_weight: settings.classifier_weight,
            threshold: settings.threshold,
            classifier_floor: settings.classifier_floor,
            page_text_chars: settings.page_text_chars,
        }
    }

    /// Configured phrases occurring in `text`, case-insensitively.
    pub fn matches(&self, text: &str) -> Vec<String> {
        let text = text.to_lowercase();
        self.phrases
            .iter()
            .filter(|p| text.contains(p.as_str()))
            .cloned()
            .collect()
    }

    pub fn score(&self, label_hit: bool, page_hit: bool, verdict: &CheckoutVerdict) -> f64 {
        let mut score = 0.0;
        if label_hit {
            score += self.label_weight;
        }
        if page_hit {
            score += self.page_text_weight;
        }
        if verdict.is_checkout && verdict.confidence >= self.classifier_floor {
            score += self.classifier_weight * verdict.confidence;
        }
        score.min(1.0)
    }
}

pub struct SafetyGuard {
    policy: RiskPolicy,
    classifier: Arc<dyn CheckoutClassifier>,
    ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, CheckoutVerdict)>>,
}

impl SafetyGuard {
    pub fn new(policy: RiskPolicy, classifier: Arc<dyn CheckoutClassifier>, ttl: Duration) -> Self {
        Self {
            policy,
            classifier,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &GuardSettings, classifier: Arc<dyn CheckoutClassifier>) -> Self {
        Self::new(
            RiskPolicy::from_settings(settings),
            classifier,
            Duration::from_millis(settings.cache_ttl_ms),
        )
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    /// Returns an approval request when `action` must wait for a human.
    ///
    /// Only clicks and typing are assessed. `Err` means the page is gone.
    pub async fn assess_risk(
        &self,
        page: &dyn PageDriver,
        action: &IntendedAction,
        markers: &MarkerTable,
        screenshot: &[u8],
        url: &str,
    ) -> Result<Option<ApprovalRequest>, DriverError> {
        let kind = action.kind();
        if !matches!(kind, ActionKind::Click | ActionKind::Type) {
            return Ok(None);
        }

        let marker = action.target().and_then(|id| markers.get(id));
        let target_label = marker
            .map(|m| m.display_label().to_string())
            .filter(|l| !l.is_empty());
        let label_text = marker
            .map(|m| format!("{} {}", m.label, m.aria_label.as_deref().unwrap_or("")))
            .unwrap_or_default();
        let label_hits = self.policy.matches(&label_text);

        let page_text = match page.evaluate(PAGE_TEXT_SCRIPT).await {
            Ok(Value::String(text)) => text
                .chars()
                .take(self.policy.page_text_chars)
                .collect::<String>(),
            Ok(_) => String::new(),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::debug!(target: "agent.guard", error = %e, "page text unavailable");
                String::new()
            }
        };
        let page_hits = self.policy.matches(&page_text);

        let verdict = self.verdict(url, screenshot).await;
        let score = self
            .policy
            .score(!label_hits.is_empty(), !page_hits.is_empty(), &verdict);
        let hard_rule = kind == ActionKind::Click && !label_hits.is_empty();
        let flagged = hard_rule || score >= self.policy.threshold;

        tracing::info!(
            target: "agent.guard",
            action = %kind,
            score,
            flagged,
            label_hits = ?label_hits,
            is_checkout = verdict.is_checkout,
            "risk assessed"
        );
        if !flagged {
            return Ok(None);
        }

        let mut reasons = Vec::new();
        if !label_hits.is_empty() {
            reasons.push(format!("target label contains {}", quoted(&label_hits)));
        }
        if !page_hits.is_empty() {
            reasons.push(format!("page text contains {}", quoted(&page_hits)));
        }
        if verdict.is_checkout {
            reasons.push(format!(
                "page classified as checkout ({:.0}% confidence)",
                verdict.confidence * 100.0
            ));
        }

        let mut keywords = verdict.detected_keywords.clone();
        for hit in label_hits.into_iter().chain(page_hits) {
            if !keywords.iter().any(|k| k.eq_ignore_ascii_case(&hit)) {
                keywords.push(hit);
            }
        }

        Ok(Some(ApprovalRequest {
            id: Uuid::new_v4(),
            action: action.clone(),
            target_label,
            summary: OrderSummary {
                total_price: verdict.total_price,
                keywords,
                confidence: verdict.confidence,
                reasoning: verdict.reasoning,
            },
            risk_score: score,
            reasons,
        }))
    }

    async fn verdict(&self, url: &str, screenshot: &[u8]) -> CheckoutVerdict {
        let cached = self
            .lock_cache()
            .get(url)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, verdict)| verdict.clone());
        if let Some(verdict) = cached {
            tracing::debug!(target: "agent.guard", url, "cached checkout verdict");
            return verdict;
        }

        match self.classifier.classify(screenshot).await {
            Ok(verdict) => {
                let mut cache = self.lock_cache();
                cache.retain(|_, (at, _)| at.elapsed() < self.ttl);
                cache.insert(url.to_string(), (Instant::now(), verdict.clone()));
                verdict
            }
            Err(e) => {
                tracing::warn!(target: "agent.guard", url, error = %e, "checkout classification failed");
                CheckoutVerdict {
                    reasoning: Some(format!("detection failed: {e}")),
                    ..CheckoutVerdict::default()
                }
            }
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Instant, CheckoutVerdict)>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn quoted(hits: &[String]) -> String {
    hits.iter()
        .map(|h| format!("\"{h}\""))
        .collect::<Vec<_>>()
        .join(", ")
}
