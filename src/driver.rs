//! Boundary with the browser automation engine.
//!
//! The loop never holds engine element objects across stages. Every
//! interaction goes through an [`ElementHandle`]: a selector plus the index of
//! the match, re-queried at the moment of use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::DriverError;
use crate::types::{BoundingBox, ClickTier};

/// When a navigation counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// The document has been parsed; sub-resources may still be loading.
    DocumentParsed,
    /// The load event fired and network activity went quiet.
    #[default]
    NetworkIdle,
}

/// Re-resolvable reference to the `nth` element matching `selector`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementHandle {
    pub selector: String,
    pub nth: usize,
}

impl ElementHandle {
    pub fn new(selector: impl Into<String>, nth: usize) -> Self {
        Self {
            selector: selector.into(),
            nth,
        }
    }
}

/// Snapshot of one matched element's interactability.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ElementState {
    pub visible: bool,
    pub enabled: bool,
    pub covered: bool,
    pub bbox: Option<BoundingBox>,
}

impl ElementState {
    pub fn is_actionable(&self) -> bool {
        self.visible && self.enabled && !self.covered
    }
}

/// Capabilities the loop consumes from a live page.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate and wait per `wait`. Returns the URL the page settled on.
    async fn navigate(
        &self,
        url: &str,
        wait: WaitStrategy,
        timeout: Duration,
    ) -> Result<String, DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;

    /// PNG of the visible viewport.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError>;

    /// All elements matching `selector`, in document order. No match is `Ok(vec![])`.
    async fn query_all(&self, selector: &str) -> Result<Vec<ElementState>, DriverError>;

    async fn bounding_box(&self, handle: &ElementHandle)
    -> Result<Option<BoundingBox>, DriverError>;

    async fn click(&self, handle: &ElementHandle, tier: ClickTier) -> Result<(), DriverError>;

    async fn focus(&self, handle: &ElementHandle) -> Result<(), DriverError>;

    async fn clear(&self, handle: &ElementHandle) -> Result<(), DriverError>;

    /// Types into whatever currently has focus.
    async fn type_text(&self, text: &str) -> Result<(), DriverError>;

    async fn press_key(&self, key: &str) -> Result<(), DriverError>;

    async fn scroll_by(&self, dx: i64, dy: i64) -> Result<(), DriverError>;
}
