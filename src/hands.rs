//! [`PageDriver`] over headless_chrome.
//!
//! headless_chrome is blocking, so every call hops onto the blocking pool
//! with a clone of the tab.

use anyhow::{Context, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use serde_json::Value;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::BrowserSettings;
use crate::driver::{ElementHandle, ElementState, PageDriver, WaitStrategy};
use crate::error::DriverError;
use crate::types::{BoundingBox, ClickTier};

const MISSING: &str = "__cart_pilot_missing__";
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const READY_POLL: Duration = Duration::from_millis(100);
const READY_STATE_SCRIPT: &str = "document.readyState";

/// Interactability of `el`, as JSON matching [`ProbeResult`].
const PROBE_FN: &str = r#"
function probe(el) {
  const r = el.getBoundingClientRect();
  const s = getComputedStyle(el);
  const visible = r.width > 0 && r.height > 0 && s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  const enabled = !el.disabled && el.getAttribute('aria-disabled') !== 'true';
  let covered = false;
  if (visible) {
    const cx = r.left + r.width / 2, cy = r.top + r.height / 2;
    if (cx >= 0 && cy >= 0 && cx < innerWidth && cy < innerHeight) {
      const top = document.elementFromPoint(cx, cy);
      covered = !!top && top !== el && !el.contains(top) && !top.contains(el);
    }
  }
  return { visible, enabled, covered, bbox: { x: r.left + scrollX, y: r.top + scrollY, width: r.width, height: r.height } };
}
"#;

#[derive(Debug, Deserialize)]
struct ProbeResult {
    visible: bool,
    enabled: bool,
    covered: bool,
    bbox: BoundingBox,
}

impl From<ProbeResult> for ElementState {
    fn from(p: ProbeResult) -> Self {
        ElementState {
            visible: p.visible,
            enabled: p.enabled,
            covered: p.covered,
            bbox: Some(p.bbox),
        }
    }
}

/// One Chrome process with a single tab, owned by one session.
pub struct ChromePage {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromePage {
    /// Starts a dedicated browser for `session_id`. Blocking.
    pub fn launch(settings: &BrowserSettings, session_id: Uuid) -> Result<Self> {
        let chrome_path = match &settings.chrome_path {
            Some(path) => path.clone(),
            None => find_chrome()?,
        };

        let user_data_dir = match &settings.profile_dir {
            Some(dir) => {
                let profile = dir.join(session_id.to_string());
                std::fs::create_dir_all(&profile)
                    .with_context(|| format!("creating profile dir {}", profile.display()))?;
                Some(profile)
            }
            None => None,
        };

        let options = LaunchOptions {
            headless: settings.headless,
            path: Some(chrome_path),
            user_data_dir,
            window_size: Some((1280, 900)),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: IDLE_BROWSER_TIMEOUT,
            ..Default::default()
        };

        tracing::info!(target: "agent.act", session_id = %session_id, headless = settings.headless, "starting Chrome");
        let browser = Browser::new(options).context("browser launch failed")?;
        let tab = browser.new_tab().context("opening tab failed")?;
        tab.navigate_to("about:blank")?;
        tracing::info!(target: "agent.act", session_id = %session_id, "Chrome ready");

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| DriverError::Engine(format!("browser task panicked: {e}")))?
            .map_err(classify)
    }

    async fn eval_string(&self, script: String) -> Result<String, DriverError> {
        let value = self.evaluate(&script).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// Runs `body` with `el` bound to the handle's element.
    async fn on_element(&self, handle: &ElementHandle, body: &str) -> Result<String, DriverError> {
        let out = self.eval_string(element_script(handle, body)).await?;
        if out == MISSING {
            return Err(DriverError::NoMatch(format!(
                "{} (match {})",
                handle.selector, handle.nth
            )));
        }
        Ok(out)
    }
}

/// Polls until the tab has left `before` for `target` and the new document
/// is past the `loading` state.
fn wait_until_parsed(tab: &Tab, before: &str, target: &str, timeout: Duration) -> Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if landed_on(before, &tab.get_url(), target) {
            // evaluation fails while the old context is torn down
            let state = tab
                .evaluate(READY_STATE_SCRIPT, false)
                .ok()
                .and_then(|remote| remote.value);
            if matches!(state.as_ref().and_then(Value::as_str), Some("interactive" | "complete")) {
                return Ok(());
            }
        }
        if std::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {target} to be parsed");
        }
        std::thread::sleep(READY_POLL);
    }
}

/// The tab reports a document other than the one navigated away from, or
/// the target is the same page being reloaded.
fn landed_on(before: &str, now: &str, target: &str) -> bool {
    let same = |a: &str, b: &str| a.trim_end_matches('/') == b.trim_end_matches('/');
    !now.is_empty() && now != "about:blank" && (now != before || same(before, target))
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn navigate(
        &self,
        url: &str,
        wait: WaitStrategy,
        timeout: Duration,
    ) -> Result<String, DriverError> {
        let target = url.to_string();
        let result = self
            .blocking(move |tab| {
                tab.set_default_timeout(timeout);
                let before = tab.get_url();
                tab.navigate_to(&target)?;
                match wait {
                    WaitStrategy::NetworkIdle => {
                        tab.wait_until_navigated()?;
                    }
                    WaitStrategy::DocumentParsed => wait_until_parsed(tab, &before, &target, timeout)?,
                }
                Ok(tab.get_url())
            })
            .await;
        match result {
            Ok(landed) => Ok(landed),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Err(DriverError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.blocking(|tab| Ok(tab.get_url())).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.blocking(|tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
        })
        .await
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        let script = script.to_string();
        self.blocking(move |tab| {
            let remote = tab.evaluate(&script, false)?;
            Ok(remote.value.unwrap_or(Value::Null))
        })
        .await
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<ElementState>, DriverError> {
        let selector_json = serde_json::to_string(selector)
            .map_err(|e| DriverError::Engine(e.to_string()))?;
        let script = format!(
            "(() => {{ {PROBE_FN} let els; try {{ els = document.querySelectorAll({selector_json}); }} catch (e) {{ return '[]'; }} return JSON.stringify(Array.from(els).map(probe)); }})()"
        );
        let raw = self.eval_string(script).await?;
        let probes: Vec<ProbeResult> =
            serde_json::from_str(&raw).map_err(|e| DriverError::Engine(e.to_string()))?;
        Ok(probes.into_iter().map(ElementState::from).collect())
    }

    async fn bounding_box(
        &self,
        handle: &ElementHandle,
    ) -> Result<Option<BoundingBox>, DriverError> {
        let raw = match self
            .on_element(
                handle,
                "const r = el.getBoundingClientRect(); return JSON.stringify({ x: r.left + scrollX, y: r.top + scrollY, width: r.width, height: r.height });",
            )
            .await
        {
            Ok(raw) => raw,
            Err(DriverError::NoMatch(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(serde_json::from_str(&raw).ok())
    }

    async fn click(&self, handle: &ElementHandle, tier: ClickTier) -> Result<(), DriverError> {
        match tier {
            ClickTier::Standard => {
                let raw = self
                    .on_element(
                        handle,
                        &format!(
                            "{PROBE_FN} el.scrollIntoView({{ block: 'center', inline: 'center' }}); return JSON.stringify(probe(el));"
                        ),
                    )
                    .await?;
                let state: ElementState = serde_json::from_str::<ProbeResult>(&raw)
                    .map_err(|e| DriverError::Engine(e.to_string()))?
                    .into();
                if !state.is_actionable() {
                    return Err(DriverError::NotActionable(handle.selector.clone()));
                }
                let selector = handle.selector.clone();
                let nth = handle.nth;
                self.blocking(move |tab| {
                    let elements = tab.find_elements(&selector)?;
                    let element = elements
                        .get(nth)
                        .with_context(|| format!("No element found for {selector} (match {nth})"))?;
                    element.click()?;
                    Ok(())
                })
                .await
            }
            ClickTier::Script => {
                self.on_element(handle, "el.click(); return 'ok';").await?;
                Ok(())
            }
            ClickTier::Forced => {
                self.on_element(
                    handle,
                    r#"const r = el.getBoundingClientRect();
                    const opts = { bubbles: true, cancelable: true, view: window, clientX: r.left + r.width / 2, clientY: r.top + r.height / 2 };
                    for (const type of ['pointerdown', 'mousedown', 'pointerup', 'mouseup', 'click']) {
                      const ev = type.startsWith('pointer') ? new PointerEvent(type, opts) : new MouseEvent(type, opts);
                      el.dispatchEvent(ev);
                    }
                    return 'ok';"#,
                )
                .await?;
                Ok(())
            }
        }
    }

    async fn focus(&self, handle: &ElementHandle) -> Result<(), DriverError> {
        self.on_element(
            handle,
            "el.scrollIntoView({ block: 'center' }); el.focus(); return document.activeElement === el ? 'ok' : 'unfocused';",
        )
        .await
        .and_then(|out| match out.as_str() {
            "ok" => Ok(()),
            _ => Err(DriverError::NotActionable(handle.selector.clone())),
        })
    }

    async fn clear(&self, handle: &ElementHandle) -> Result<(), DriverError> {
        self.on_element(
            handle,
            r#"if ('value' in el) {
                 el.value = '';
                 el.dispatchEvent(new Event('input', { bubbles: true }));
               } else if (el.isContentEditable) {
                 el.textContent = '';
               }
               return 'ok';"#,
        )
        .await?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), DriverError> {
        let text = text.to_string();
        self.blocking(move |tab| {
            tab.type_str(&text)?;
            Ok(())
        })
        .await
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        let key = key.to_string();
        self.blocking(move |tab| {
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }

    async fn scroll_by(&self, dx: i64, dy: i64) -> Result<(), DriverError> {
        self.evaluate(&format!("window.scrollBy({dx}, {dy}); true"))
            .await
            .map(|_| ())
    }
}

/// Wraps `body` so that `el` is the handle's element, or returns [`MISSING`].
fn element_script(handle: &ElementHandle, body: &str) -> String {
    let selector = serde_json::to_string(&handle.selector).unwrap_or_else(|_| "\"\"".into());
    format!(
        "(() => {{ let els; try {{ els = document.querySelectorAll({selector}); }} catch (e) {{ return '{MISSING}'; }} const el = els[{nth}]; if (!el) return '{MISSING}'; {body} }})()",
        nth = handle.nth
    )
}

/// Maps engine errors onto [`DriverError`] by message.
fn classify(err: anyhow::Error) -> DriverError {
    let message = format!("{err:#}");
    let lower = message.to_lowercase();
    if [
        "connection is closed",
        "channel closed",
        "browser closed",
        "no target with given id",
        "target closed",
        "transport loop",
    ]
    .iter()
    .any(|m| lower.contains(m))
    {
        DriverError::SessionGone(message)
    } else if [
        "cannot find context",
        "execution context was destroyed",
        "detached",
        "inspected target navigated",
    ]
    .iter()
    .any(|m| lower.contains(m))
    {
        DriverError::Detached(message)
    } else if lower.contains("no element found") || lower.contains("could not find node") {
        DriverError::NoMatch(message)
    } else if lower.contains("timed out") || lower.contains("event waited for never came") {
        DriverError::Timeout(Duration::ZERO)
    } else {
        DriverError::Engine(message)
    }
}

fn find_chrome() -> Result<PathBuf> {
    headless_chrome::browser::default_executable()
        .map_err(|e| anyhow::anyhow!("Chrome executable not found ({e}). Set browser.chrome_path."))
}
