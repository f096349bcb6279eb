//! Defensive boundary between free-form model output and [`IntendedAction`].
//!
//! Nothing past [`parse_and_validate`] looks at the raw payload again.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use crate::error::DecisionRejection;
use crate::types::{ActionKind, Command, IntendedAction, MarkerTable, ScrollDirection};

const DEFAULT_WAIT_MS: u64 = 1_000;

static FENCED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").ok());

/// Pulls the first JSON object out of `raw`.
///
/// Tries the whole text, then a fenced code block, then the first balanced
/// `{...}` span.
pub fn extract_json(raw: &str) -> Result<Map<String, Value>, DecisionRejection> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DecisionRejection::NoPayload);
    }
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(obj);
    }

    let mut last_error = None;
    let fenced = FENCED
        .as_ref()
        .and_then(|re| re.captures(trimmed))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str());
    for candidate in fenced.into_iter().chain(balanced_object(trimmed)) {
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(obj)) => return Ok(obj),
            Ok(_) => {}
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    match last_error {
        Some(e) => Err(DecisionRejection::Malformed(e)),
        None => Err(DecisionRejection::NoPayload),
    }
}

/// First `{...}` span whose braces balance, ignoring braces inside strings.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses a reasoning response and checks it against the latest observation.
pub fn parse_and_validate(
    raw: &str,
    markers: &MarkerTable,
) -> Result<IntendedAction, DecisionRejection> {
    let obj = extract_json(raw)?;

    let kind = parse_kind(&obj)?;
    let rationale = first_string(&obj, &["reasoning", "rationale", "reason", "thought"])
        .unwrap_or_default();
    let confidence = obj.get("confidence").and_then(as_f64).map(|c| c.clamp(0.0, 1.0));

    let command = match kind {
        ActionKind::Click => Command::Click {
            target: checked_target(&obj, kind, markers)?,
        },
        ActionKind::Type => {
            let target = checked_target(&obj, kind, markers)?;
            let text = first_string(&obj, &["value", "text"]).unwrap_or_default();
            if text.trim().is_empty() {
                return Err(DecisionRejection::EmptyText);
            }
            let submit = obj.get("submit").and_then(as_bool).unwrap_or(true);
            Command::Type {
                target,
                text,
                submit,
            }
        }
        ActionKind::Scroll => {
            let raw_dir = first_string(&obj, &["direction", "value"])
                .ok_or(DecisionRejection::MissingDirection)?;
            let direction = ScrollDirection::parse(&raw_dir)
                .ok_or(DecisionRejection::BadDirection(raw_dir))?;
            let distance = ["distance", "amount", "pixels"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(as_u64))
                .and_then(|d| u32::try_from(d).ok())
                .filter(|d| *d > 0);
            Command::Scroll {
                direction,
                distance,
            }
        }
        ActionKind::Wait => {
            let ms = ["ms", "duration_ms", "value"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(as_u64))
                .unwrap_or(DEFAULT_WAIT_MS);
            Command::Wait { ms }
        }
        ActionKind::Done => {
            let summary = first_string(&obj, &["summary", "value"])
                .filter(|s| !s.trim().is_empty())
                .or_else(|| Some(rationale.clone()).filter(|s| !s.trim().is_empty()))
                .ok_or(DecisionRejection::MissingSummary)?;
            Command::Done { summary }
        }
    };

    Ok(IntendedAction {
        command,
        rationale,
        confidence,
    })
}

fn parse_kind(obj: &Map<String, Value>) -> Result<ActionKind, DecisionRejection> {
    let value = obj
        .get("action")
        .or_else(|| obj.get("kind"))
        .filter(|v| !v.is_null())
        .ok_or(DecisionRejection::MissingKind)?;
    let Some(name) = value.as_str() else {
        return Err(DecisionRejection::UnknownKind(value.to_string()));
    };
    match name.trim().to_ascii_lowercase().as_str() {
        "click" | "tap" | "press" => Ok(ActionKind::Click),
        "type" | "input" | "fill" | "enter_text" => Ok(ActionKind::Type),
        "scroll" => Ok(ActionKind::Scroll),
        "wait" | "pause" => Ok(ActionKind::Wait),
        "done" | "finish" | "finished" | "complete" | "stop" => Ok(ActionKind::Done),
        "" => Err(DecisionRejection::MissingKind),
        _ => Err(DecisionRejection::UnknownKind(name.to_string())),
    }
}

fn checked_target(
    obj: &Map<String, Value>,
    kind: ActionKind,
    markers: &MarkerTable,
) -> Result<u32, DecisionRejection> {
    let target = ["target", "element", "element_id", "marker"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(as_marker_id))
        .ok_or(DecisionRejection::MissingTarget(kind))?;
    if markers.contains(target) {
        Ok(target)
    } else {
        Err(DecisionRejection::UnknownTarget(target))
    }
}

/// Accepts `7`, `7.0`, `"7"` and `"[7]"`.
fn as_marker_id(value: &Value) -> Option<u32> {
    match value {
        Value::String(s) => s
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim()
            .parse()
            .ok(),
        other => as_u64(other).and_then(|n| u32::try_from(n).ok()),
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn first_string(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
