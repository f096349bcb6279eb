//! Page observer: numbers every interactive element, captures the annotated
//! viewport and turns the raw element list into [`ElementMarker`]s with
//! ranked candidate locators.
//!
//! Painting is confined to a single overlay root that is removed right after
//! the screenshot. No attribute is ever written to a page element.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::catalog::SiteCatalog;
use crate::driver::PageDriver;
use crate::error::DriverError;
use crate::types::{
    BoundingBox, CandidateLocator, ElementMarker, ElementRole, LocatorStrategy, MarkerTable,
};

const MAX_LABEL_CHARS: usize = 80;
const MAX_DATA_VALUE_CHARS: usize = 80;

/// Enumerates visible interactive elements in document order, paints their
/// 1-based index into an overlay and returns the raw element list as JSON.
pub const MARK_SCRIPT: &str = r#"
(() => {
  const ROOT_ID = '__cart_pilot_marks';
  const stale = document.getElementById(ROOT_ID);
  if (stale) stale.remove();

  const SELECTOR = [
    'a[href]', 'button', 'input:not([type="hidden"])', 'select', 'textarea',
    '[role="button"]', '[role="link"]', '[role="textbox"]', '[role="checkbox"]',
    '[role="menuitem"]', '[role="tab"]', '[onclick]', '[contenteditable="true"]'
  ].join(',');

  function visible(el) {
    const r = el.getBoundingClientRect();
    if (r.width < 1 || r.height < 1) return false;
    if (r.bottom <= 0 || r.right <= 0 || r.top >= innerHeight || r.left >= innerWidth) return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function path(el) {
    const parts = [];
    let node = el;
    while (node && node.nodeType === 1 && node !== document.body && node !== document.documentElement) {
      let idx = 1;
      for (let sib = node.previousElementSibling; sib; sib = sib.previousElementSibling) {
        if (sib.tagName === node.tagName) idx++;
      }
      parts.unshift(node.tagName.toLowerCase() + ':nth-of-type(' + idx + ')');
      node = node.parentElement;
    }
    return parts.length ? 'body > ' + parts.join(' > ') : '';
  }

  const TEXTLIKE = new Set(['text', 'search', 'email', 'password', 'tel', 'url', 'number']);
  const root = document.createElement('div');
  root.id = ROOT_ID;
  root.setAttribute('style', 'position:absolute;left:0;top:0;width:0;height:0;pointer-events:none;z-index:2147483647;');

  const out = [];
  for (const el of document.querySelectorAll(SELECTOR)) {
    if (!visible(el)) continue;
    const r = el.getBoundingClientRect();
    const x = r.left + scrollX;
    const y = r.top + scrollY;
    const tag = el.tagName.toLowerCase();
    const inputType = (el.getAttribute('type') || '').toLowerCase();
    const textlike = tag === 'textarea' || (tag === 'input' && (inputType === '' || TEXTLIKE.has(inputType)));
    const text = textlike ? '' : (el.innerText || el.value || '').replace(/\s+/g, ' ').trim().slice(0, 160);
    const data = [];
    for (const a of el.attributes) {
      if (a.name.startsWith('data-')) data.push([a.name, a.value]);
    }
    out.push({
      tag,
      id: el.id || null,
      name: el.getAttribute('name'),
      data,
      aria_label: el.getAttribute('aria-label'),
      classes: Array.from(el.classList),
      input_type: el.getAttribute('type'),
      role: el.getAttribute('role'),
      text,
      placeholder: el.getAttribute('placeholder'),
      path: path(el),
      bbox: { x, y, width: r.width, height: r.height },
    });

    const n = out.length;
    const box = document.createElement('div');
    box.setAttribute('style', 'position:absolute;left:' + x + 'px;top:' + y + 'px;width:' + r.width + 'px;height:' + r.height + 'px;outline:2px solid rgba(230,0,0,0.85);box-sizing:border-box;');
    const label = document.createElement('div');
    label.textContent = String(n);
    label.setAttribute('style', 'position:absolute;left:' + x + 'px;top:' + Math.max(0, y - 16) + 'px;background:rgba(230,0,0,0.9);color:#fff;font:bold 12px Arial,sans-serif;line-height:1;padding:2px 4px;border-radius:3px;');
    root.appendChild(box);
    root.appendChild(label);
  }

  document.documentElement.appendChild(root);
  return JSON.stringify(out);
})()
"#;

/// Removes the overlay painted by [`MARK_SCRIPT`].
pub const UNMARK_SCRIPT: &str = r#"
(() => {
  const root = document.getElementById('__cart_pilot_marks');
  if (root) root.remove();
  return true;
})()
"#;

/// One observation round.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub url: String,
    /// PNG with marker labels painted in. Empty when capture failed.
    pub screenshot: Vec<u8>,
    pub markers: MarkerTable,
    /// False when the marker pass failed on a page that was detached or
    /// still navigating. The markers are then empty and not to be trusted.
    pub settled: bool,
}

/// Element as reported by [`MARK_SCRIPT`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawElement {
    tag: String,
    id: Option<String>,
    name: Option<String>,
    data: Vec<(String, String)>,
    aria_label: Option<String>,
    classes: Vec<String>,
    input_type: Option<String>,
    role: Option<String>,
    text: String,
    placeholder: Option<String>,
    path: String,
    bbox: BoundingBox,
}

pub struct Observer {
    catalog: Arc<SiteCatalog>,
}

impl Observer {
    pub fn new(catalog: Arc<SiteCatalog>) -> Self {
        Self { catalog }
    }

    /// Mark, capture, unmark.
    ///
    /// Only a vanished browser session is an error. A detached or
    /// mid-navigation page yields an unsettled observation with an empty
    /// marker table and whatever screenshot could be taken, so the caller
    /// can observe again.
    pub async fn observe(&self, page: &dyn PageDriver) -> Result<Observation, DriverError> {
        let url = match page.current_url().await {
            Ok(url) => url,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::debug!(target: "agent.observe", error = %e, "url unavailable");
                String::new()
            }
        };

        let mut settled = true;
        let raw = match page.evaluate(MARK_SCRIPT).await {
            Ok(value) => value,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(target: "agent.observe", url = %url, error = %e, "marker injection failed");
                settled = false;
                Value::Null
            }
        };

        let screenshot = match page.screenshot().await {
            Ok(bytes) => bytes,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(target: "agent.observe", url = %url, error = %e, "screenshot failed");
                Vec::new()
            }
        };

        if let Err(e) = page.evaluate(UNMARK_SCRIPT).await {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::warn!(target: "agent.observe", url = %url, error = %e, "marker overlay not removed");
        }

        let markers = match parse_raw(raw) {
            Ok(elements) => self.build_markers(&url, elements),
            Err(e) => {
                tracing::warn!(target: "agent.observe", url = %url, error = %e, "unreadable marker payload");
                settled = false;
                MarkerTable::default()
            }
        };

        tracing::info!(
            target: "agent.observe",
            url = %url,
            markers = markers.len(),
            screenshot_bytes = screenshot.len(),
            settled,
            "page observed"
        );

        Ok(Observation {
            url,
            screenshot,
            markers,
            settled,
        })
    }

    fn build_markers(&self, url: &str, elements: Vec<RawElement>) -> MarkerTable {
        let markers = elements
            .into_iter()
            .map(|raw| {
                let label = clip(&collapse_ws(&raw.text), MAX_LABEL_CHARS);
                let catalog_label = if label.is_empty() {
                    raw.aria_label.clone().unwrap_or_default()
                } else {
                    label.clone()
                };
                let extra = self.catalog.extra_locators(url, &catalog_label);
                ElementMarker {
                    id: 0,
                    role: infer_role(&raw),
                    locators: build_locators(&raw, extra),
                    tag: raw.tag,
                    label,
                    aria_label: raw.aria_label.filter(|s| !s.trim().is_empty()),
                    placeholder: raw.placeholder.filter(|s| !s.trim().is_empty()),
                    bbox: raw.bbox,
                }
            })
            .collect();
        MarkerTable::from_ordered(markers)
    }
}

fn parse_raw(value: Value) -> Result<Vec<RawElement>, serde_json::Error> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => serde_json::from_str(&s),
        other => serde_json::from_value(other),
    }
}

fn infer_role(raw: &RawElement) -> ElementRole {
    match raw.role.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("button" | "menuitem" | "tab") => return ElementRole::Button,
        Some("link") => return ElementRole::Link,
        Some("textbox" | "searchbox" | "combobox") => return ElementRole::TextInput,
        Some("checkbox") => return ElementRole::Checkbox,
        Some("radio") => return ElementRole::Radio,
        _ => {}
    }
    match raw.tag.as_str() {
        "a" => ElementRole::Link,
        "button" => ElementRole::Button,
        "textarea" => ElementRole::TextArea,
        "select" => ElementRole::Select,
        "input" => match raw.input_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("checkbox") => ElementRole::Checkbox,
            Some("radio") => ElementRole::Radio,
            Some("submit" | "button" | "reset" | "image") => ElementRole::Button,
            _ => ElementRole::TextInput,
        },
        _ => ElementRole::Other,
    }
}

/// Candidate locators, most stable first. The structural path is always last.
fn build_locators(raw: &RawElement, catalog: Vec<String>) -> Vec<CandidateLocator> {
    let tag = if is_css_ident(&raw.tag) {
        raw.tag.as_str()
    } else {
        "*"
    };
    let mut out: Vec<CandidateLocator> = Vec::new();
    let mut push = |strategy: LocatorStrategy, selector: String| {
        if !selector.is_empty() && !out.iter().any(|c| c.selector == selector) {
            out.push(CandidateLocator { strategy, selector });
        }
    };

    if let Some(id) = non_empty(&raw.id) {
        let selector = if is_css_ident(id) {
            format!("#{id}")
        } else {
            format!("[id=\"{}\"]", escape_attr(id))
        };
        push(LocatorStrategy::Identity, selector);
    }

    if let Some(name) = non_empty(&raw.name) {
        push(
            LocatorStrategy::Name,
            format!("{tag}[name=\"{}\"]", escape_attr(name)),
        );
    }

    if let Some((key, value)) = raw.data.iter().find(|(k, v)| {
        is_attr_name(k) && !v.trim().is_empty() && v.chars().count() <= MAX_DATA_VALUE_CHARS
    }) {
        push(
            LocatorStrategy::DataAttribute,
            format!("{tag}[{key}=\"{}\"]", escape_attr(value)),
        );
    }

    if let Some(aria) = non_empty(&raw.aria_label) {
        push(
            LocatorStrategy::AriaLabel,
            format!("{tag}[aria-label=\"{}\"]", escape_attr(aria)),
        );
    }

    let classes: Vec<&str> = raw
        .classes
        .iter()
        .map(String::as_str)
        .filter(|c| is_css_ident(c))
        .take(2)
        .collect();
    if !classes.is_empty() {
        push(
            LocatorStrategy::ClassComposite,
            format!("{tag}.{}", classes.join(".")),
        );
    }

    let mut type_role = String::new();
    if let Some(ty) = non_empty(&raw.input_type) {
        type_role.push_str(&format!("[type=\"{}\"]", escape_attr(ty)));
    }
    if let Some(role) = non_empty(&raw.role) {
        type_role.push_str(&format!("[role=\"{}\"]", escape_attr(role)));
    }
    if !type_role.is_empty() {
        push(LocatorStrategy::TypeRole, format!("{tag}{type_role}"));
    }

    for selector in catalog {
        push(LocatorStrategy::Catalog, selector);
    }

    push(LocatorStrategy::Structural, raw.path.clone());
    out
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// True when `s` can be written unescaped after `#` or `.` in a CSS selector.
fn is_css_ident(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let starts_ok = match first {
        '-' => matches!(chars.clone().next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-'),
        c => c.is_ascii_alphabetic() || c == '_',
    };
    starts_ok && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_attr_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Escapes a value for use inside a double-quoted CSS attribute selector.
pub(crate) fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\a "),
            '\r' => out.push_str("\\d "),
            c => out.push(c),
        }
    }
    out
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
