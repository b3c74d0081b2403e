//! Test-only fakes for the browser, the model, the confirmation gate and the
//! run sink, so the action loop and the rule evaluator run without Chrome or
//! network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::brain::{ModelAdapter, ModelTurn};
use crate::config::SessionConfig;
use crate::confirm::Confirmer;
use crate::dom::{RawNode, Rect};
use crate::error::{BrowserError, ModelError};
use crate::hands::{BrowserControl, ElementInfo, LoadProgress, ReadMode};
use crate::output::RunSink;
use crate::policy::PdpRecord;
use crate::session::{SessionRecord, StepRecord};
use crate::types::{Action, ModelPayload, ProposedAction, TaskContext, ToolResponse, Viewport};

/// Shared, ordered log of side effects across fakes.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// A bare element of `tag` that is the only one of its type among its siblings.
pub fn node(tag: &str) -> RawNode {
    RawNode {
        tag: tag.to_string(),
        nth_of_type: 1,
        same_type_count: 1,
        ..RawNode::default()
    }
}

/// `tag` wrapped in the given ancestors (nearest first), ending at body/html.
pub fn chain(tag: &str, ancestors: &[&str]) -> Vec<RawNode> {
    let mut nodes = vec![node(tag)];
    nodes.extend(ancestors.iter().map(|a| node(a)));
    nodes
}

pub fn rect(x: f64, y: f64, width: f64, height: f64) -> Rect {
    Rect {
        x,
        y,
        width,
        height,
    }
}

#[derive(Debug, Clone)]
struct Hit {
    area: Rect,
    chain: Vec<RawNode>,
    navigates_to: Option<String>,
}

/// DOM state of one URL in a [`FakeBrowser`].
#[derive(Debug, Clone, Default)]
pub struct FakePage {
    elements: HashMap<String, ElementInfo>,
    counts: HashMap<String, usize>,
    invalid: HashSet<String>,
    hits: Vec<Hit>,
    extractions: HashMap<(String, String), Vec<Option<String>>>,
    predicates: HashMap<String, bool>,
}

impl FakePage {
    pub fn add_element(&mut self, selector: &str, visible: bool, text: &str) -> &mut Self {
        self.elements.insert(
            selector.to_string(),
            ElementInfo {
                visible,
                text: text.to_string(),
            },
        );
        self
    }

    pub fn set_count(&mut self, selector: &str, count: usize) -> &mut Self {
        self.counts.insert(selector.to_string(), count);
        self
    }

    /// Make the page reject `selector` as a syntax error.
    pub fn add_invalid_selector(&mut self, selector: &str) -> &mut Self {
        self.invalid.insert(selector.to_string());
        self
    }

    /// Any point inside `area` hits `chain` (target first).
    pub fn add_hit(&mut self, area: Rect, chain: Vec<RawNode>) -> &mut Self {
        self.hits.push(Hit {
            area,
            chain,
            navigates_to: None,
        });
        self
    }

    /// Like [`FakePage::add_hit`], and clicking inside `area` navigates to `url`.
    pub fn add_link(&mut self, area: Rect, chain: Vec<RawNode>, url: &str) -> &mut Self {
        self.hits.push(Hit {
            area,
            chain,
            navigates_to: Some(url.to_string()),
        });
        self
    }

    pub fn add_extraction(
        &mut self,
        selector: &str,
        relative: &str,
        values: Vec<Option<&str>>,
    ) -> &mut Self {
        self.extractions.insert(
            (selector.to_string(), relative.to_string()),
            values.into_iter().map(|v| v.map(String::from)).collect(),
        );
        self
    }

    pub fn set_predicate(&mut self, selector: &str, value: bool) -> &mut Self {
        self.predicates.insert(selector.to_string(), value);
        self
    }

    fn check(&self, selector: &str) -> Result<(), BrowserError> {
        if self.invalid.contains(selector) {
            return Err(BrowserError::InvalidSelector {
                selector: selector.to_string(),
                reason: "SyntaxError: not a valid selector".into(),
            });
        }
        Ok(())
    }

    fn hit(&self, x: f64, y: f64) -> Option<&Hit> {
        self.hits.iter().find(|h| {
            x >= h.area.x
                && x <= h.area.x + h.area.width
                && y >= h.area.y
                && y <= h.area.y + h.area.height
        })
    }
}

/// In-memory browser: a map of URL to [`FakePage`] plus a cursor.
#[derive(Debug)]
pub struct FakeBrowser {
    pages: HashMap<String, FakePage>,
    url: String,
    history: Vec<String>,
    viewport: Viewport,
    failures: HashMap<usize, BrowserError>,
    load_timeout: bool,
    screenshots: usize,
    log: Option<EventLog>,
    /// Every action passed to `execute`, failed ones included.
    pub executed: Vec<Action>,
    pub navigations: Vec<String>,
    pub clicked: Vec<String>,
    pub closed: bool,
}

impl FakeBrowser {
    pub fn new(url: &str) -> Self {
        Self {
            pages: HashMap::new(),
            url: url.to_string(),
            history: Vec::new(),
            viewport: Viewport::default(),
            failures: HashMap::new(),
            load_timeout: false,
            screenshots: 0,
            log: None,
            executed: Vec::new(),
            navigations: Vec::new(),
            clicked: Vec::new(),
            closed: false,
        }
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = viewport;
        self
    }

    /// The document never finishes loading.
    pub fn with_load_timeouts(mut self) -> Self {
        self.load_timeout = true;
        self
    }

    /// The `ordinal`-th call to `execute` (0-based) fails with `err`.
    pub fn fail_execute(&mut self, ordinal: usize, err: BrowserError) -> &mut Self {
        self.failures.insert(ordinal, err);
        self
    }

    /// The page at the current URL.
    pub fn page_mut(&mut self) -> &mut FakePage {
        let url = self.url.clone();
        self.page_at(&url)
    }

    pub fn page_at(&mut self, url: &str) -> &mut FakePage {
        self.pages.entry(url.to_string()).or_default()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn page(&self) -> FakePage {
        self.pages.get(&self.url).cloned().unwrap_or_default()
    }

    fn record(&self, event: String) {
        if let Some(log) = &self.log {
            if let Ok(mut log) = log.lock() {
                log.push(event);
            }
        }
    }

    fn go(&mut self, url: &str) {
        let previous = std::mem::replace(&mut self.url, url.to_string());
        self.history.push(previous);
        self.navigations.push(url.to_string());
    }

    fn alive(&self) -> Result<(), BrowserError> {
        if self.closed {
            return Err(BrowserError::Fatal("browser closed".into()));
        }
        Ok(())
    }
}

impl BrowserControl for FakeBrowser {
    fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.alive()?;
        self.record(format!("navigate:{url}"));
        self.go(url);
        Ok(())
    }

    fn execute(&mut self, action: &Action) -> Result<(), BrowserError> {
        self.alive()?;
        let ordinal = self.executed.len();
        self.executed.push(action.clone());
        self.record(format!("execute:{}", action.name()));
        if let Some(err) = self.failures.remove(&ordinal) {
            return Err(err);
        }
        match action {
            Action::Navigate { url } => self.go(url),
            Action::GoBack => {
                if let Some(previous) = self.history.pop() {
                    self.url = previous;
                }
            }
            Action::ClickAt { x, y } => {
                let target = self.page().hit(*x, *y).and_then(|h| h.navigates_to.clone());
                if let Some(url) = target {
                    self.go(&url);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
        self.alive()?;
        self.screenshots += 1;
        Ok(format!("png#{}@{}", self.screenshots, self.url).into_bytes())
    }

    fn load_progress(&mut self) -> Result<LoadProgress, BrowserError> {
        self.alive()?;
        let ready_state = if self.load_timeout { "loading" } else { "complete" };
        Ok(LoadProgress {
            ready_state: ready_state.into(),
            resources: Some(0),
        })
    }

    fn hit_test(
        &mut self,
        x: f64,
        y: f64,
        _max_depth: usize,
    ) -> Result<Option<Vec<RawNode>>, BrowserError> {
        self.alive()?;
        Ok(self.page().hit(x, y).map(|h| h.chain.clone()))
    }

    fn query_element(&mut self, selector: &str) -> Result<Option<ElementInfo>, BrowserError> {
        self.alive()?;
        let page = self.page();
        page.check(selector)?;
        Ok(page.elements.get(selector).cloned())
    }

    fn count(&mut self, selector: &str) -> Result<usize, BrowserError> {
        self.alive()?;
        let page = self.page();
        page.check(selector)?;
        Ok(page
            .counts
            .get(selector)
            .copied()
            .unwrap_or(usize::from(page.elements.contains_key(selector))))
    }

    fn extract_within(
        &mut self,
        selector: &str,
        relative: &str,
        _mode: ReadMode,
    ) -> Result<Vec<Option<String>>, BrowserError> {
        let total = self.count(selector)?;
        let page = self.page();
        page.check(relative)?;
        Ok(page
            .extractions
            .get(&(selector.to_string(), relative.to_string()))
            .cloned()
            .unwrap_or_else(|| vec![None; total]))
    }

    fn evaluate_predicate(
        &mut self,
        selector: &str,
        _expr: &str,
    ) -> Result<Option<bool>, BrowserError> {
        self.alive()?;
        let page = self.page();
        page.check(selector)?;
        if !page.elements.contains_key(selector) {
            return Ok(None);
        }
        Ok(Some(page.predicates.get(selector).copied().unwrap_or(false)))
    }

    fn click_element(&mut self, selector: &str) -> Result<(), BrowserError> {
        self.alive()?;
        let page = self.page();
        page.check(selector)?;
        if !page.elements.contains_key(selector) {
            return Err(BrowserError::Transient(format!("no element matches {selector}")));
        }
        self.record(format!("click:{selector}"));
        self.clicked.push(selector.to_string());
        Ok(())
    }

    fn current_url(&mut self) -> Result<String, BrowserError> {
        self.alive()?;
        Ok(self.url.clone())
    }

    fn viewport(&mut self) -> Result<Viewport, BrowserError> {
        self.alive()?;
        Ok(self.viewport)
    }

    fn close(&mut self) -> Result<(), BrowserError> {
        self.record("close".into());
        self.closed = true;
        Ok(())
    }
}

/// A proposed call with a generated id.
pub fn call(name: &str, args: Value) -> ProposedAction {
    ProposedAction::from_call(name, args, Some(format!("call-{name}")))
}

/// What a [`ScriptedModel`] was asked.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub screenshot: Vec<u8>,
    pub results: Vec<ToolResponse>,
    pub task: TaskContext,
}

/// Replays canned turns in order; answers `done` once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    script: VecDeque<Result<ModelTurn, ModelError>>,
    delay: Option<Duration>,
    pub requests: Vec<RecordedRequest>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<ModelTurn>) -> Self {
        Self {
            script: turns.into_iter().map(Ok).collect(),
            ..Self::default()
        }
    }

    pub fn from_results(script: Vec<Result<ModelTurn, ModelError>>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    /// Every answer takes `delay` to arrive.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl ModelAdapter for ScriptedModel {
    fn propose_actions(
        &mut self,
        payload: ModelPayload<'_>,
        task: &TaskContext,
    ) -> impl Future<Output = Result<ModelTurn, ModelError>> + Send {
        self.requests.push(RecordedRequest {
            screenshot: payload.screenshot.to_vec(),
            results: payload.results.to_vec(),
            task: task.clone(),
        });
        let next = self.script.pop_front().unwrap_or_else(|| Ok(ModelTurn::done()));
        let delay = self.delay;
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            next
        }
    }
}

/// Answers confirmation prompts from a fixed list, then declines.
#[derive(Debug, Default)]
pub struct ScriptedConfirmer {
    answers: VecDeque<bool>,
    log: Option<EventLog>,
    pub asked: Vec<String>,
}

impl ScriptedConfirmer {
    pub fn new(answers: Vec<bool>) -> Self {
        Self {
            answers: answers.into(),
            ..Self::default()
        }
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }
}

impl Confirmer for ScriptedConfirmer {
    fn confirm(&mut self, action: &ProposedAction) -> impl Future<Output = bool> + Send {
        self.asked.push(action.name.clone());
        let answer = self.answers.pop_front().unwrap_or(false);
        if let Some(log) = &self.log {
            if let Ok(mut log) = log.lock() {
                log.push(format!("confirm:{}={answer}", action.name));
            }
        }
        std::future::ready(answer)
    }
}

/// Keeps every artifact in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub config: Option<SessionConfig>,
    pub screenshots: Vec<(usize, Vec<u8>)>,
    pub steps: Vec<StepRecord>,
    pub pdps: Vec<PdpRecord>,
    pub finished: Option<SessionRecord>,
}

impl RunSink for MemorySink {
    fn on_start(&mut self, config: &SessionConfig) -> anyhow::Result<()> {
        self.config = Some(config.clone());
        Ok(())
    }

    fn store_screenshot(&mut self, step: usize, png: &[u8]) -> anyhow::Result<String> {
        self.screenshots.push((step, png.to_vec()));
        Ok(format!("memory://step_{step:04}.png"))
    }

    fn on_step(&mut self, step: &StepRecord) -> anyhow::Result<()> {
        self.steps.push(step.clone());
        Ok(())
    }

    fn on_pdp(&mut self, pdp: &PdpRecord) -> anyhow::Result<()> {
        self.pdps.push(pdp.clone());
        Ok(())
    }

    fn on_finish(&mut self, session: &SessionRecord) -> anyhow::Result<()> {
        self.finished = Some(session.clone());
        Ok(())
    }
}
