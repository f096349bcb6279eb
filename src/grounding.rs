//! Maps a marker id chosen by the reasoning service back to a live element.
//!
//! Candidate locators are swept in stored order until one yields an
//! actionable match or the shared budget runs out. A final relaxed sweep then
//! accepts any present match. The result is an [`ElementHandle`], which the
//! executor re-queries on every use.

use std::time::Duration;
use tokio::time::{Instant, sleep};

use crate::config::GroundingSettings;
use crate::driver::{ElementHandle, ElementState, PageDriver};
use crate::error::{DriverError, GroundingFailure};
use crate::types::{BoundingBox, ElementMarker, Grounding, LocatorStrategy};

/// A marker grounded to a concrete match.
#[derive(Debug, Clone, PartialEq)]
pub struct Grounded {
    pub handle: ElementHandle,
    pub strategy: LocatorStrategy,
    /// 1-based position of the winning locator.
    pub tier: usize,
    pub relaxed: bool,
}

impl Grounded {
    pub fn record(&self) -> Grounding {
        Grounding {
            strategy: self.strategy,
            selector: self.handle.selector.clone(),
            tier: self.tier,
            relaxed: self.relaxed,
        }
    }
}

/// What the executor receives for a targeted action.
pub type GroundingResult = Result<Grounded, GroundingFailure>;

#[derive(Debug, thiserror::Error)]
pub enum GroundingError {
    #[error(transparent)]
    Unresolved(#[from] GroundingFailure),
    #[error("page gone while grounding: {0}")]
    PageGone(DriverError),
}

#[derive(Debug, Clone)]
pub struct Resolver {
    budget: Duration,
    poll: Duration,
}

impl Resolver {
    pub fn new(budget: Duration, poll: Duration) -> Self {
        Self { budget, poll }
    }

    pub fn from_settings(settings: &GroundingSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.budget_ms),
            Duration::from_millis(settings.poll_ms.max(1)),
        )
    }

    pub async fn resolve(
        &self,
        page: &dyn PageDriver,
        marker: &ElementMarker,
    ) -> Result<Grounded, GroundingError> {
        let deadline = Instant::now() + self.budget;
        let mut sweeps = 0u32;

        loop {
            sweeps += 1;
            if let Some(found) = self.sweep(page, marker, true).await? {
                tracing::info!(
                    target: "agent.ground",
                    marker = marker.id,
                    locator = %found.handle.selector,
                    tier = found.tier,
                    sweeps,
                    "marker grounded"
                );
                return Ok(found);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.poll.min(deadline - now)).await;
        }

        if let Some(found) = self.sweep(page, marker, false).await? {
            tracing::warn!(
                target: "agent.ground",
                marker = marker.id,
                locator = %found.handle.selector,
                tier = found.tier,
                "marker grounded by presence only"
            );
            return Ok(found);
        }

        tracing::warn!(
            target: "agent.ground",
            marker = marker.id,
            tried = marker.locators.len(),
            sweeps,
            "marker could not be grounded"
        );
        Err(GroundingFailure {
            marker: marker.id,
            tried: marker.locators.len(),
        }
        .into())
    }

    async fn sweep(
        &self,
        page: &dyn PageDriver,
        marker: &ElementMarker,
        strict: bool,
    ) -> Result<Option<Grounded>, GroundingError> {
        for (idx, candidate) in marker.locators.iter().enumerate() {
            let states = match page.query_all(&candidate.selector).await {
                Ok(states) => states,
                Err(e) if e.is_fatal() => return Err(GroundingError::PageGone(e)),
                Err(e) => {
                    tracing::debug!(
                        target: "agent.ground",
                        marker = marker.id,
                        locator = %candidate.selector,
                        error = %e,
                        "locator query failed"
                    );
                    continue;
                }
            };
            if let Some(nth) = pick(&states, &marker.bbox, strict) {
                return Ok(Some(Grounded {
                    handle: ElementHandle::new(candidate.selector.clone(), nth),
                    strategy: candidate.strategy,
                    tier: idx + 1,
                    relaxed: !strict,
                }));
            }
        }
        Ok(None)
    }
}

/// Index of the acceptable match nearest to where the marker was observed.
fn pick(states: &[ElementState], observed: &BoundingBox, strict: bool) -> Option<usize> {
    states
        .iter()
        .enumerate()
        .filter(|(_, s)| !strict || s.is_actionable())
        .min_by(|(_, a), (_, b)| {
            let da = a.bbox.map_or(f64::MAX, |bb| bb.distance_to(observed));
            let db = b.bbox.map_or(f64::MAX, |bb| bb.distance_to(observed));
            da.total_cmp(&db)
        })
        .map(|(idx, _)| idx)
}
