#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use cart_pilot::brain::{Reasoner, ReasoningRequest};
use cart_pilot::catalog::SiteCatalog;
use cart_pilot::config::AgentConfig;
use cart_pilot::controller::{Collaborators, SessionController};
use cart_pilot::dom::{MARK_SCRIPT, UNMARK_SCRIPT};
use cart_pilot::driver::{ElementHandle, ElementState, PageDriver, WaitStrategy};
use cart_pilot::error::{DriverError, ReasoningError};
use cart_pilot::face::AgentEvent;
use cart_pilot::guard::{CheckoutClassifier, CheckoutVerdict, PAGE_TEXT_SCRIPT};
use cart_pilot::llm::LlmError;
use cart_pilot::registry::SessionRegistry;
use cart_pilot::session::{Session, SessionSnapshot};
use cart_pilot::types::{BoundingBox, ClickTier, SessionStatus};

pub const SEARCH: &str = "#search";
pub const ADD_TO_CART: &str = "#add-to-cart";
pub const PLACE_ORDER: &str = "button[data-testid=\"place-order\"]";

pub fn bbox(x: f64, y: f64) -> BoundingBox {
    BoundingBox {
        x,
        y,
        width: 100.0,
        height: 30.0,
    }
}

pub fn actionable(x: f64, y: f64) -> ElementState {
    ElementState {
        visible: true,
        enabled: true,
        covered: false,
        bbox: Some(bbox(x, y)),
    }
}

pub fn covered(x: f64, y: f64) -> ElementState {
    ElementState {
        covered: true,
        ..actionable(x, y)
    }
}

#[derive(Default)]
pub struct PageState {
    pub url: String,
    pub raw_elements: Vec<Value>,
    pub elements: HashMap<String, Vec<ElementState>>,
    pub page_text: String,
    pub calls: Vec<String>,
    pub failing_tiers: Vec<ClickTier>,
    pub navigate_error: Option<DriverError>,
    pub mark_error: Option<DriverError>,
    /// Consumed one per marker pass before `mark_error` is consulted.
    pub mark_failures: VecDeque<DriverError>,
    pub screenshot_error: Option<DriverError>,
    pub gone: bool,
    pub marks_painted: bool,
}

/// In-memory page with a small storefront: a search box, an add-to-cart
/// button and a place-order button.
#[derive(Default)]
pub struct FakePage {
    pub state: Mutex<PageState>,
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storefront() -> Self {
        let page = Self::new();
        {
            let mut s = page.state();
            s.raw_elements = storefront_elements();
            s.elements.insert(SEARCH.into(), vec![actionable(10.0, 10.0)]);
            s.elements
                .insert(ADD_TO_CART.into(), vec![actionable(10.0, 60.0)]);
            s.elements
                .insert(PLACE_ORDER.into(), vec![actionable(10.0, 110.0)]);
            s.page_text = "Cables and adapters".into();
        }
        page
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, PageState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Calls that change the page, excluding navigation and reads.
    pub fn effects(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                ["click:", "focus:", "clear:", "type:", "key:", "scroll:"]
                    .iter()
                    .any(|p| c.starts_with(p))
            })
            .collect()
    }

    fn enter(&self, call: String) -> Result<std::sync::MutexGuard<'_, PageState>, DriverError> {
        let mut s = self.state();
        if s.gone {
            return Err(DriverError::SessionGone("tab closed".into()));
        }
        s.calls.push(call);
        Ok(s)
    }

    fn lookup(s: &PageState, handle: &ElementHandle) -> Result<ElementState, DriverError> {
        s.elements
            .get(&handle.selector)
            .and_then(|all| all.get(handle.nth))
            .copied()
            .ok_or_else(|| DriverError::NoMatch(handle.selector.clone()))
    }
}

pub fn storefront_elements() -> Vec<Value> {
    vec![
        json!({
            "tag": "input", "id": "search", "name": "q", "input_type": "text",
            "placeholder": "Search", "path": "body > input:nth-of-type(1)",
            "bbox": {"x": 10.0, "y": 10.0, "width": 100.0, "height": 30.0}
        }),
        json!({
            "tag": "button", "id": "add-to-cart", "text": "Add to Cart", "classes": ["btn"],
            "path": "body > button:nth-of-type(1)",
            "bbox": {"x": 10.0, "y": 60.0, "width": 100.0, "height": 30.0}
        }),
        json!({
            "tag": "button", "text": "Place your order", "data": [["data-testid", "place-order"]],
            "path": "body > button:nth-of-type(2)",
            "bbox": {"x": 10.0, "y": 110.0, "width": 100.0, "height": 30.0}
        }),
    ]
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(
        &self,
        url: &str,
        _wait: WaitStrategy,
        _timeout: Duration,
    ) -> Result<String, DriverError> {
        let mut s = self.enter(format!("navigate:{url}"))?;
        if let Some(e) = s.navigate_error.clone() {
            return Err(e);
        }
        s.url = url.to_string();
        Ok(s.url.clone())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let s = self.enter("url".into())?;
        Ok(s.url.clone())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        let s = self.enter("screenshot".into())?;
        match s.screenshot_error.clone() {
            Some(e) => Err(e),
            None => Ok(vec![0x89, b'P', b'N', b'G']),
        }
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        if script == MARK_SCRIPT {
            let mut s = self.enter("mark".into())?;
            if let Some(e) = s.mark_failures.pop_front() {
                return Err(e);
            }
            if let Some(e) = s.mark_error.clone() {
                return Err(e);
            }
            s.marks_painted = true;
            return Ok(Value::String(Value::Array(s.raw_elements.clone()).to_string()));
        }
        if script == UNMARK_SCRIPT {
            let mut s = self.enter("unmark".into())?;
            s.marks_painted = false;
            return Ok(Value::Bool(true));
        }
        if script == PAGE_TEXT_SCRIPT {
            let s = self.enter("page_text".into())?;
            return Ok(Value::String(s.page_text.clone()));
        }
        self.enter("evaluate".into())?;
        Ok(Value::Null)
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<ElementState>, DriverError> {
        let s = self.enter(format!("query:{selector}"))?;
        Ok(s.elements.get(selector).cloned().unwrap_or_default())
    }

    async fn bounding_box(
        &self,
        handle: &ElementHandle,
    ) -> Result<Option<BoundingBox>, DriverError> {
        let s = self.enter(format!("bbox:{}", handle.selector))?;
        Ok(Self::lookup(&s, handle).ok().and_then(|e| e.bbox))
    }

    async fn click(&self, handle: &ElementHandle, tier: ClickTier) -> Result<(), DriverError> {
        let s = self.enter(format!("click:{}#{}:{tier:?}", handle.selector, handle.nth))?;
        Self::lookup(&s, handle)?;
        if s.failing_tiers.contains(&tier) {
            return Err(DriverError::NotActionable(handle.selector.clone()));
        }
        Ok(())
    }

    async fn focus(&self, handle: &ElementHandle) -> Result<(), DriverError> {
        let s = self.enter(format!("focus:{}", handle.selector))?;
        Self::lookup(&s, handle).map(|_| ())
    }

    async fn clear(&self, handle: &ElementHandle) -> Result<(), DriverError> {
        let s = self.enter(format!("clear:{}", handle.selector))?;
        Self::lookup(&s, handle).map(|_| ())
    }

    async fn type_text(&self, text: &str) -> Result<(), DriverError> {
        self.enter(format!("type:{text}"))?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        self.enter(format!("key:{key}"))?;
        Ok(())
    }

    async fn scroll_by(&self, dx: i64, dy: i64) -> Result<(), DriverError> {
        self.enter(format!("scroll:{dx},{dy}"))?;
        Ok(())
    }
}

/// Replays canned model responses, then repeats `fallback` if set.
#[derive(Default)]
pub struct ScriptedReasoner {
    queue: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    pub feedback: Mutex<Vec<Option<String>>>,
    /// Every session in this registry is cancelled while a decision is made.
    cancels: Mutex<Option<SessionRegistry>>,
}

impl ScriptedReasoner {
    pub fn replies(replies: &[&str]) -> Self {
        Self {
            queue: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn repeating(reply: &str) -> Self {
        Self {
            fallback: Some(reply.to_string()),
            ..Self::default()
        }
    }

    pub fn cancel_while_deciding(&self, registry: SessionRegistry) {
        *self.cancels.lock().unwrap() = Some(registry);
    }

    pub fn rounds(&self) -> usize {
        self.feedback.lock().unwrap().len()
    }

    pub fn feedback_at(&self, round: usize) -> Option<String> {
        self.feedback.lock().unwrap().get(round).cloned().flatten()
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn decide(&self, request: &ReasoningRequest<'_>) -> Result<String, ReasoningError> {
        self.feedback
            .lock()
            .unwrap()
            .push(request.feedback.map(str::to_string));
        if let Some(registry) = self.cancels.lock().unwrap().as_ref() {
            for snapshot in registry.list() {
                registry.cancel(snapshot.id).unwrap();
            }
        }
        let next = self.queue.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or(ReasoningError::Unavailable {
                attempts: 1,
                last: "script exhausted".into(),
            })
    }
}

/// Returns a fixed verdict (or error) and counts calls.
pub struct ScriptedClassifier {
    verdict: Option<CheckoutVerdict>,
    pub calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn not_checkout() -> Self {
        Self::with(CheckoutVerdict::default())
    }

    pub fn checkout(confidence: f64, total: &str) -> Self {
        Self::with(CheckoutVerdict {
            is_checkout: true,
            confidence,
            total_price: Some(total.to_string()),
            detected_keywords: vec!["Place your order".into()],
            reasoning: Some("order summary with total".into()),
        })
    }

    pub fn failing() -> Self {
        Self {
            verdict: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn with(verdict: CheckoutVerdict) -> Self {
        Self {
            verdict: Some(verdict),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckoutClassifier for ScriptedClassifier {
    async fn classify(&self, _screenshot: &[u8]) -> Result<CheckoutVerdict, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdict.clone().ok_or(LlmError::RateLimit)
    }
}

/// Defaults with every pause zeroed and short grounding budgets.
pub fn fast_config(max_iterations: u32) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.agent.max_iterations = max_iterations;
    config.browser.settle_ms = 0;
    config.grounding.budget_ms = 40;
    config.grounding.poll_ms = 5;
    let ex = &mut config.executor;
    ex.stability_grace_ms = 0;
    ex.stability_frame_ms = 1;
    ex.focus_pause_ms = 0;
    ex.clear_pause_ms = 0;
    ex.confirm_pause_ms = 0;
    ex.settle_ms = 0;
    ex.max_wait_ms = 10;
    config
}

pub struct Mission {
    pub id: Uuid,
    pub registry: SessionRegistry,
    pub events: broadcast::Receiver<AgentEvent>,
    pub handle: JoinHandle<Session>,
}

impl Mission {
    pub fn start(
        config: &AgentConfig,
        page: Arc<FakePage>,
        reasoner: Arc<ScriptedReasoner>,
        classifier: Arc<ScriptedClassifier>,
    ) -> Self {
        Self::start_in(SessionRegistry::new(), config, page, reasoner, classifier)
    }

    pub fn start_in(
        registry: SessionRegistry,
        config: &AgentConfig,
        page: Arc<FakePage>,
        reasoner: Arc<ScriptedReasoner>,
        classifier: Arc<ScriptedClassifier>,
    ) -> Self {
        let (event_tx, events) = broadcast::channel(512);
        let session = Session::new(
            "buy a usb-c cable",
            "https://shop.example/",
            config.agent.max_iterations,
        );
        let id = session.id;
        let signals = registry.create(&session);
        let controller = SessionController::new(
            config,
            session,
            Collaborators {
                page,
                reasoner,
                classifier,
                catalog: Arc::new(SiteCatalog::default()),
            },
            event_tx,
            signals,
        );
        let handle = tokio::spawn(controller.run());
        Self {
            id,
            registry,
            events,
            handle,
        }
    }

    /// Polls the registry until the session reaches `status`.
    pub async fn wait_for(&self, status: SessionStatus) -> SessionSnapshot {
        for _ in 0..400 {
            if let Some(snapshot) = self.registry.lookup(self.id) {
                if snapshot.status == status {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached {status:?}");
    }

    pub async fn finish(self) -> Session {
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("mission did not finish")
            .expect("controller panicked")
    }
}
