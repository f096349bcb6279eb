//! Turns a validated action into page effects.
//!
//! `Err` is reserved for a vanished browser session. Every other failure is
//! an [`ActionOutcome`] the loop records and shows to the next reasoning round.

use std::time::Duration;
use tokio::time::{Instant, sleep};

use crate::config::ExecutorSettings;
use crate::driver::{ElementHandle, PageDriver};
use crate::error::{DriverError, GroundingFailure};
use crate::grounding::{Grounded, GroundingResult};
use crate::types::{ActionOutcome, ClickTier, Command, IntendedAction, ScrollDirection, TierAttempt};

#[derive(Debug, Clone, Default)]
pub struct Executor {
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings }
    }

    /// Pause between an action and the next observation.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settings.settle_ms)
    }

    pub async fn execute(
        &self,
        page: &dyn PageDriver,
        action: &IntendedAction,
        grounded: Option<&GroundingResult>,
    ) -> Result<ActionOutcome, DriverError> {
        let target = match (action.target(), grounded) {
            (None, _) => None,
            (Some(_), Some(Ok(g))) => Some(g),
            (Some(_), Some(Err(failure))) => {
                return Ok(ActionOutcome::GroundingFailed(failure.clone()));
            }
            (Some(marker), None) => {
                return Ok(ActionOutcome::GroundingFailed(GroundingFailure {
                    marker,
                    tried: 0,
                }));
            }
        };

        let outcome = match (&action.command, target) {
            (Command::Click { .. }, Some(g)) => self.click(page, g).await?,
            (Command::Type { text, submit, .. }, Some(g)) => {
                self.type_into(page, g, text, *submit).await?
            }
            (
                Command::Scroll {
                    direction,
                    distance,
                },
                _,
            ) => self.scroll(page, *direction, *distance).await?,
            (Command::Wait { ms }, _) => {
                let capped = (*ms).min(self.settings.max_wait_ms);
                sleep(Duration::from_millis(capped)).await;
                executed(None)
            }
            (Command::Done { .. }, _) => executed(None),
            // target() is Some exactly for click and type
            (Command::Click { .. } | Command::Type { .. }, None) => executed(None),
        };

        tracing::info!(
            target: "agent.act",
            action = %action.kind(),
            result = %outcome.summary(),
            "action executed"
        );
        Ok(outcome)
    }

    async fn click(
        &self,
        page: &dyn PageDriver,
        grounded: &Grounded,
    ) -> Result<ActionOutcome, DriverError> {
        self.wait_until_stable(page, &grounded.handle).await?;

        let mut attempts = Vec::with_capacity(ClickTier::ALL.len());
        for tier in ClickTier::ALL {
            match page.click(&grounded.handle, tier).await {
                Ok(()) => {
                    attempts.push(TierAttempt { tier, error: None });
                    return Ok(ActionOutcome::Executed {
                        grounding: Some(grounded.record()),
                        attempts,
                    });
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        target: "agent.act",
                        locator = %grounded.handle.selector,
                        tier = ?tier,
                        error = %e,
                        "click tier failed"
                    );
                    attempts.push(TierAttempt {
                        tier,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(ActionOutcome::ExecutionFailed {
            grounding: Some(grounded.record()),
            attempts,
            reason: "every click tier failed".into(),
        })
    }

    /// Waits until the element's box stops moving between two frames, or the
    /// grace period ends. Proceeds either way.
    async fn wait_until_stable(
        &self,
        page: &dyn PageDriver,
        handle: &ElementHandle,
    ) -> Result<(), DriverError> {
        let deadline = Instant::now() + Duration::from_millis(self.settings.stability_grace_ms);
        let frame = Duration::from_millis(self.settings.stability_frame_ms.max(1));
        let mut previous = None;

        loop {
            let current = match page.bounding_box(handle).await {
                Ok(bbox) => bbox,
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => return Ok(()),
            };
            if matches!((previous, current), (Some(prev), Some(cur)) if prev == cur) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::debug!(target: "agent.act", locator = %handle.selector, "element still moving, clicking anyway");
                return Ok(());
            }
            previous = current;
            sleep(frame).await;
        }
    }

    async fn type_into(
        &self,
        page: &dyn PageDriver,
        grounded: &Grounded,
        text: &str,
        submit: bool,
    ) -> Result<ActionOutcome, DriverError> {
        let handle = &grounded.handle;
        let failed = |reason: String| ActionOutcome::ExecutionFailed {
            grounding: Some(grounded.record()),
            attempts: Vec::new(),
            reason,
        };

        if let Err(e) = page.focus(handle).await {
            return Ok(failed(soft(e, "focus")?));
        }
        sleep(human_pause(self.settings.focus_pause_ms)).await;

        if let Err(e) = page.clear(handle).await {
            return Ok(failed(soft(e, "clear")?));
        }
        sleep(human_pause(self.settings.clear_pause_ms)).await;

        if let Err(e) = page.type_text(text).await {
            return Ok(failed(soft(e, "typing")?));
        }

        if submit {
            sleep(human_pause(self.settings.confirm_pause_ms)).await;
            if let Err(e) = page.press_key("Enter").await {
                return Ok(failed(soft(e, "submit")?));
            }
        }

        Ok(executed(Some(grounded)))
    }

    async fn scroll(
        &self,
        page: &dyn PageDriver,
        direction: ScrollDirection,
        distance: Option<u32>,
    ) -> Result<ActionOutcome, DriverError> {
        let px = i64::from(distance.unwrap_or(self.settings.default_scroll_px));
        let (dx, dy) = match direction {
            ScrollDirection::Up => (0, -px),
            ScrollDirection::Down => (0, px),
            ScrollDirection::Left => (-px, 0),
            ScrollDirection::Right => (px, 0),
        };
        match page.scroll_by(dx, dy).await {
            Ok(()) => Ok(executed(None)),
            Err(e) => Ok(ActionOutcome::ExecutionFailed {
                grounding: None,
                attempts: Vec::new(),
                reason: soft(e, "scroll")?,
            }),
        }
    }
}

fn executed(grounded: Option<&Grounded>) -> ActionOutcome {
    ActionOutcome::Executed {
        grounding: grounded.map(Grounded::record),
        attempts: Vec::new(),
    }
}

/// Fatal errors propagate; anything else becomes a failure reason.
fn soft(e: DriverError, step: &str) -> Result<String, DriverError> {
    if e.is_fatal() {
        Err(e)
    } else {
        Ok(format!("{step} failed: {e}"))
    }
}

/// `base` plus up to 50% jitter.
fn human_pause(base_ms: u64) -> Duration {
    let jitter = base_ms as f64 * 0.5 * rand::random::<f64>();
    Duration::from_millis(base_ms + jitter as u64)
}
