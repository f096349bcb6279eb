//! Single observe-and-decide pass over a page, outside any session.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::brain::{Reasoner, ReasoningRequest, format_markers};
use crate::catalog::{SiteCatalog, normalize_url};
use crate::decision::parse_and_validate;
use crate::dom::Observer;
use crate::driver::PageDriver;
use crate::error::{FailureKind, Stage, StageFailure};
use crate::types::{IntendedAction, MarkerTable};

#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub url: String,
    pub action: IntendedAction,
    /// Base64 PNG with the marker labels painted in.
    pub screenshot: String,
    pub markers: MarkerTable,
    pub markers_formatted: String,
}

/// Navigates to `url`, observes once and returns the next action toward `goal`.
///
/// The decision is validated but never executed and nothing is retried.
pub async fn analyze_page(
    page: &dyn PageDriver,
    reasoner: &dyn Reasoner,
    catalog: Arc<SiteCatalog>,
    goal: &str,
    url: &str,
    navigation_timeout: Duration,
    default_settle: Duration,
) -> Result<Analysis, StageFailure> {
    let url = normalize_url(url);
    let wait = catalog.wait_strategy(&url);
    tracing::info!(target: "agent.web", url = %url, goal, "analyzing page");

    let landed = match page.navigate(&url, wait, navigation_timeout).await {
        Ok(landed) if landed.is_empty() => url.clone(),
        Ok(landed) => landed,
        Err(e) if e.is_fatal() => return Err(StageFailure::page_gone(Stage::Navigate, &e)),
        Err(e) => {
            return Err(StageFailure::new(
                Stage::Navigate,
                FailureKind::NavigationFailure,
                format!("could not reach {url}: {e}"),
            ));
        }
    };
    let settle = catalog.settle(&url, default_settle);
    if !settle.is_zero() {
        tokio::time::sleep(settle).await;
    }

    let observation = Observer::new(catalog.clone())
        .observe(page)
        .await
        .map_err(|e| StageFailure::page_gone(Stage::Observe, &e))?;
    let current = if observation.url.is_empty() {
        landed
    } else {
        observation.url.clone()
    };

    let request = ReasoningRequest {
        goal,
        url: &current,
        screenshot: &observation.screenshot,
        markers: &observation.markers,
        history: &[],
        feedback: None,
        page_context: catalog.context(&current),
    };
    let raw = reasoner.decide(&request).await.map_err(|e| {
        StageFailure::new(Stage::Reason, FailureKind::ReasoningUnavailable, e.to_string())
    })?;
    let action = parse_and_validate(&raw, &observation.markers).map_err(|rejection| {
        StageFailure::new(
            Stage::Reason,
            FailureKind::DecisionError,
            format!("{}: {rejection}", rejection.code()),
        )
    })?;
    tracing::info!(target: "agent.web", action = %action.describe(), "page analysis complete");

    Ok(Analysis {
        url: current,
        action,
        screenshot: STANDARD.encode(&observation.screenshot),
        markers_formatted: format_markers(&observation.markers),
        markers: observation.markers,
    })
}
