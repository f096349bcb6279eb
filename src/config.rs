//! Layered configuration: built-in defaults, an optional YAML/TOML/JSON file,
//! then `CART_PILOT__`-prefixed environment variables (`__` separates
//! sections, e.g. `CART_PILOT__AGENT__MAX_ITERATIONS=30`).
//!
//! String values may reference other environment variables as `${VAR}`.
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::SiteProfile;

const MAXIMUM_ENV_EXPANSION_DEPTH: usize = 8;
const ENV_PREFIX: &str = "CART_PILOT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerSettings,
    pub browser: BrowserSettings,
    pub llm: LlmSettings,
    pub agent: LoopSettings,
    pub grounding: GroundingSettings,
    pub executor: ExecutorSettings,
    pub guard: GuardSettings,
    pub sites: Vec<SiteProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    /// Chrome binary; auto-detected when unset.
    pub chrome_path: Option<PathBuf>,
    /// Parent directory for per-session profiles; a throwaway profile is used when unset.
    pub profile_dir: Option<PathBuf>,
    pub navigation_timeout_ms: u64,
    /// Pause after navigation so late scripts can render.
    pub settle_ms: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            profile_dir: None,
            navigation_timeout_ms: 30_000,
            settle_ms: 1_000,
        }
    }
}

impl BrowserSettings {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Openai,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: Provider,
    pub model: Option<String>,
    /// Falls back to `OPENAI_API_KEY` / `GOOGLE_API_KEY` when unset.
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_ms: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: Provider::Openai,
            model: None,
            api_key: None,
            endpoint: None,
            temperature: 0.2,
            max_tokens: 1024,
            request_timeout_ms: 60_000,
        }
    }
}

impl LlmSettings {
    pub fn model_name(&self) -> String {
        match (&self.model, self.provider) {
            (Some(model), _) => model.clone(),
            (None, Provider::Openai) => "gpt-4o-mini".into(),
            (None, Provider::Gemini) => "gemini-2.0-flash".into(),
        }
    }

    pub fn endpoint(&self) -> String {
        match (&self.endpoint, self.provider) {
            (Some(endpoint), _) => endpoint.trim_end_matches('/').to_string(),
            (None, Provider::Openai) => "https://api.openai.com/v1".into(),
            (None, Provider::Gemini) => "https://generativelanguage.googleapis.com/v1beta".into(),
        }
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        let var = match self.provider {
            Provider::Openai => "OPENAI_API_KEY",
            Provider::Gemini => "GOOGLE_API_KEY",
        };
        std::env::var(var).ok().filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSettings {
    pub max_iterations: u32,
    /// How many past actions the reasoning service sees.
    pub history_window: usize,
    pub reasoning_attempts: u32,
    pub backoff_base_ms: u64,
    /// Auto-deny a pending approval after this long. Waits forever when unset.
    pub approval_timeout_ms: Option<u64>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            history_window: 5,
            reasoning_attempts: 3,
            backoff_base_ms: 1_000,
            approval_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundingSettings {
    /// Total wait shared by all candidate locators of one marker.
    pub budget_ms: u64,
    pub poll_ms: u64,
}

impl Default for GroundingSettings {
    fn default() -> Self {
        Self {
            budget_ms: 3_000,
            poll_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub stability_grace_ms: u64,
    pub stability_frame_ms: u64,
    pub focus_pause_ms: u64,
    pub clear_pause_ms: u64,
    pub confirm_pause_ms: u64,
    pub default_scroll_px: u32,
    pub max_wait_ms: u64,
    /// Pause after each action before the next observation.
    pub settle_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            stability_grace_ms: 500,
            stability_frame_ms: 100,
            focus_pause_ms: 300,
            clear_pause_ms: 200,
            confirm_pause_ms: 500,
            default_scroll_px: 500,
            max_wait_ms: 10_000,
            settle_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
    pub phrases: Vec<String>,
    pub label_weight: f64,
    pub page_text_weight: f64,
    pub classifier_weight: f64,
    pub threshold: f64,
    /// Classifier verdicts below this confidence are ignored.
    pub classifier_floor: f64,
    pub cache_ttl_ms: u64,
    pub page_text_chars: usize,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            phrases: [
                "place order",
                "place your order",
                "complete purchase",
                "confirm order",
                "buy now",
                "complete order",
                "submit order",
                "pay now",
                "confirm purchase",
                "checkout",
                "confirm payment",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            label_weight: 0.6,
            page_text_weight: 0.15,
            classifier_weight: 0.25,
            threshold: 0.5,
            classifier_floor: 0.7,
            cache_ttl_ms: 5_000,
            page_text_chars: 4_000,
        }
    }
}

fn expand_env_in_value(v: &mut Value) {
    match v {
        Value::String(s) => {
            if s.contains('$') {
                let mut cur = std::mem::take(s);
                for _ in 0..MAXIMUM_ENV_EXPANSION_DEPTH {
                    let expanded = match shellexpand::env(&cur) {
                        Ok(cow) => cow.into_owned(),
                        Err(_) => cur.clone(),
                    };
                    if expanded == cur {
                        break;
                    }
                    cur = expanded;
                }
                *s = cur;
            }
        }
        Value::Array(arr) => arr.iter_mut().for_each(expand_env_in_value),
        Value::Object(obj) => obj.values_mut().for_each(expand_env_in_value),
        _ => {}
    }
}

/// Builder over the `config` crate sources.
pub struct AgentConfigLoader {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
    env_overrides: bool,
}

impl Default for AgentConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentConfigLoader {
    pub fn new() -> Self {
        Self {
            builder: Config::builder(),
            env_overrides: true,
        }
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.builder = self
            .builder
            .add_source(File::from(path.as_ref()).required(true));
        self
    }

    pub fn with_yaml_str(mut self, yaml: &str) -> Self {
        self.builder = self
            .builder
            .add_source(File::from_str(yaml, config::FileFormat::Yaml));
        self
    }

    /// Skip `CART_PILOT__*` variables. Tests use this to stay hermetic.
    pub fn without_env(mut self) -> Self {
        self.env_overrides = false;
        self
    }

    pub fn load(self) -> Result<AgentConfig, ConfigError> {
        let mut builder = self.builder;
        if self.env_overrides {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }
        let cfg = builder.build()?;

        let mut v: Value = cfg.try_deserialize()?;
        expand_env_in_value(&mut v);

        serde_json::from_value(v).map_err(|e| ConfigError::Message(e.to_string()))
    }
}

impl AgentConfig {
    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let loader = AgentConfigLoader::new();
        match path {
            Some(p) => loader.with_file(p).load(),
            None => loader.load(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_apply_when_no_source_is_given() {
        let cfg = AgentConfigLoader::new().without_env().load().unwrap();
        assert_eq!(cfg.agent.max_iterations, 20);
        assert_eq!(cfg.grounding.budget_ms, 3_000);
        assert_eq!(cfg.guard.threshold, 0.5);
        assert!(cfg.guard.phrases.iter().any(|p| p == "place order"));
        assert!(cfg.sites.is_empty());
    }

    #[test]
    fn yaml_overrides_nested_sections() {
        let cfg = AgentConfigLoader::new()
            .without_env()
            .with_yaml_str(
                r#"
agent:
  max_iterations: 7
llm:
  provider: gemini
guard:
  cache_ttl_ms: 250
sites:
  - host: shop.example
    wait: document_parsed
"#,
            )
            .load()
            .unwrap();
        assert_eq!(cfg.agent.max_iterations, 7);
        assert_eq!(cfg.agent.history_window, 5);
        assert_eq!(cfg.llm.provider, Provider::Gemini);
        assert_eq!(cfg.llm.model_name(), "gemini-2.0-flash");
        assert_eq!(cfg.guard.cache_ttl_ms, 250);
        assert_eq!(cfg.sites.len(), 1);
    }

    #[test]
    fn environment_overrides_file_values() {
        temp_env::with_var("CART_PILOT__AGENT__MAX_ITERATIONS", Some("42"), || {
            let cfg = AgentConfigLoader::new()
                .with_yaml_str("agent:\n  max_iterations: 7\n")
                .load()
                .unwrap();
            assert_eq!(cfg.agent.max_iterations, 42);
        });
    }

    #[test]
    fn api_key_placeholder_is_expanded() {
        temp_env::with_var("CART_PILOT_TEST_KEY", Some("sk-from-env"), || {
            let cfg = AgentConfigLoader::new()
                .without_env()
                .with_yaml_str("llm:\n  api_key: \"${CART_PILOT_TEST_KEY}\"\n")
                .load()
                .unwrap();
            assert_eq!(cfg.llm.resolve_api_key().as_deref(), Some("sk-from-env"));
        });
    }

    #[test]
    fn unknown_vars_are_left_as_is() {
        let mut v = json!("hi-${CART_PILOT_DOES_NOT_EXIST}");
        expand_env_in_value(&mut v);
        assert_eq!(v, json!("hi-${CART_PILOT_DOES_NOT_EXIST}"));
    }

    #[test]
    fn reads_config_file_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cart-pilot.yaml");
        std::fs::write(&path, "server:\n  port: 8123\n").unwrap();
        let cfg = AgentConfigLoader::new()
            .without_env()
            .with_file(&path)
            .load()
            .unwrap();
        assert_eq!(cfg.server.port, 8123);
        assert_eq!(cfg.server.host, "127.0.0.1");
    }
}
