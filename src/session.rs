//! The exploration loop: observe, ask the model, execute, settle, capture, decide.
//!
//! One [`Session`] drives one browser page from `Init` to `Terminated`. It owns
//! the browser for the whole run and closes it on every exit path, flushing
//! whatever PDP records and steps exist first.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::brain::{ModelAdapter, ModelTrace, ModelTurn};
use crate::config::SessionConfig;
use crate::confirm::Confirmer;
use crate::dom::{self, CaptureRecord};
use crate::error::{BrowserError, CaptureError, ConfigError, ModelError};
use crate::hands::{BrowserControl, LoadProgress};
use crate::output::RunSink;
use crate::policy::{
    PdpCounts, PdpDetector, PdpRecord, PdpTracker, UrlPatternDetector, VariantProbe,
};
use crate::types::{
    Action, ModelPayload, ProposedAction, ResolvedPoint, TaskContext, ToolResponse, ToolResult,
    Viewport,
};

const WAIT_ACTION_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    BudgetMet,
    ModelDone,
    MaxSteps,
    FatalError { message: String },
    Cancelled,
}

impl TerminationReason {
    fn fatal(message: impl Into<String>) -> Self {
        TerminationReason::FatalError {
            message: message.into(),
        }
    }
}

/// Either keep going, or stop the run for the given reason.
type Flow<T> = Result<T, TerminationReason>;

fn browser_fatal(err: BrowserError) -> TerminationReason {
    TerminationReason::fatal(err.to_string())
}

fn sink_failure(err: anyhow::Error) -> TerminationReason {
    TerminationReason::fatal(format!("failed to write run artifacts: {err:#}"))
}

/// Local record of one executed (or refused) call. Never sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub name: String,
    pub call_id: Option<String>,
    /// The action as dispatched, coordinates in viewport pixels.
    pub action: Option<Action>,
    pub point: Option<ResolvedPoint>,
    /// `None` when the call was not gated.
    pub confirmed: Option<bool>,
    pub capture: Option<CaptureRecord>,
    pub capture_error: Option<String>,
    pub result: ToolResult,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ActionOutcome {
    fn new(call: &ProposedAction, url: &str) -> Self {
        Self {
            name: call.name.clone(),
            call_id: call.call_id.clone(),
            action: None,
            point: None,
            confirmed: None,
            capture: None,
            capture_error: None,
            result: ToolResult::ok(url),
            error: None,
            duration_ms: 0,
        }
    }

    fn failed(mut self, url: &str, message: impl Into<String>) -> Self {
        self.result = ToolResult::error(url);
        self.error = Some(message.into());
        self
    }

    fn response(&self) -> ToolResponse {
        ToolResponse {
            name: self.name.clone(),
            call_id: self.call_id.clone(),
            result: self.result.clone(),
            safety_acknowledged: self.confirmed == Some(true),
        }
    }
}

/// One observe/decide/execute cycle. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub url: String,
    pub viewport: Viewport,
    /// Reference to the screenshot the model saw for this step.
    pub screenshot: String,
    pub started_at: DateTime<Utc>,
    /// Tool responses for the previous step, as sent with this step's payload.
    pub prior_results: Vec<ToolResponse>,
    pub proposed: Vec<ProposedAction>,
    pub outcomes: Vec<ActionOutcome>,
    pub model_text: Vec<String>,
    #[serde(skip)]
    pub trace: Option<ModelTrace>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub start_url: String,
    pub goal: String,
    pub excluded_actions: Vec<String>,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub pdps: Vec<PdpRecord>,
    pub counts: PdpCounts,
    pub termination: TerminationReason,
}

pub struct Session<B, M, C, S> {
    config: SessionConfig,
    task: TaskContext,
    browser: B,
    model: M,
    confirmer: C,
    sink: S,
    detector: Box<dyn PdpDetector + Send + Sync>,
    probe: VariantProbe,
    tracker: PdpTracker,
    steps: Vec<StepRecord>,
    pdps: Vec<PdpRecord>,
    url: String,
}

impl<B, M, C, S> Session<B, M, C, S>
where
    B: BrowserControl,
    M: ModelAdapter,
    C: Confirmer,
    S: RunSink,
{
    pub fn new(
        config: SessionConfig,
        browser: B,
        model: M,
        confirmer: C,
        sink: S,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let detector = UrlPatternDetector::new(&config.pdp_url_regex)
            .map_err(|e| ConfigError::new(format!("pdp_url_regex: {e}")))?;
        let goal = if config.goal.trim().is_empty() {
            SessionConfig::default_goal(&config.budget)
        } else {
            config.goal.clone()
        };
        Ok(Self {
            task: TaskContext {
                goal,
                excluded_actions: config.excluded_actions.clone(),
            },
            probe: VariantProbe::new(config.variant_signals.clone()),
            detector: Box::new(detector),
            url: config.start_url.clone(),
            config,
            browser,
            model,
            confirmer,
            sink,
            tracker: PdpTracker::new(),
            steps: Vec::new(),
            pdps: Vec::new(),
        })
    }

    /// Replace the URL-pattern PDP detector.
    pub fn with_detector(mut self, detector: impl PdpDetector + Send + Sync + 'static) -> Self {
        self.detector = Box::new(detector);
        self
    }

    pub fn browser(&self) -> &B {
        &self.browser
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn confirmer(&self) -> &C {
        &self.confirmer
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Run to termination. Always returns a record; the browser is closed afterwards.
    pub async fn run(&mut self, cancel: CancellationToken) -> SessionRecord {
        let started_at = Utc::now();
        self.tracker = PdpTracker::new();
        self.steps.clear();
        self.pdps.clear();
        info!(
            start_url = %self.config.start_url,
            model = %self.config.model,
            max_steps = self.config.max_steps,
            "session started"
        );

        let termination = match self.drive(&cancel).await {
            Ok(()) => TerminationReason::MaxSteps,
            Err(reason) => reason,
        };
        self.teardown(started_at, termination)
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Flow<()> {
        self.sink.on_start(&self.config).map_err(sink_failure)?;

        // Init
        let start_url = self.config.start_url.clone();
        match self.browser.navigate(&start_url) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(browser_fatal(e)),
            Err(e) => warn!(error = %e, "start navigation reported an error; continuing"),
        }
        self.settle(cancel).await?;
        let mut screenshot = self.screenshot()?;
        self.decide(0)?;

        let mut prior: Vec<ToolResponse> = Vec::new();
        for index in 0..self.config.max_steps {
            if cancel.is_cancelled() {
                return Err(TerminationReason::Cancelled);
            }

            // Observing
            let url = self.current_url()?;
            let viewport = self.viewport()?;
            let screenshot_ref = self
                .sink
                .store_screenshot(index, &screenshot)
                .map_err(sink_failure)?;
            self.tracker.touch(index);
            let started_at = Utc::now();
            debug!(step = index, url = %url, "observing");

            // AwaitingModel
            let payload = ModelPayload {
                screenshot: &screenshot,
                results: &prior,
            };
            let turn = self.ask_model(payload, cancel).await?;
            let ModelTurn {
                calls,
                done,
                text,
                trace,
            } = turn;
            for call in &calls {
                info!(step = index, action = %call.name, args = %call.args, "model proposed");
            }

            let mut step = StepRecord {
                index,
                url,
                viewport,
                screenshot: screenshot_ref,
                started_at,
                prior_results: std::mem::take(&mut prior),
                proposed: calls.clone(),
                outcomes: Vec::with_capacity(calls.len()),
                model_text: text,
                trace,
            };

            // Executing / WaitingStable
            let stop = self.execute_batch(&calls, &viewport, &mut step, cancel).await;
            prior = step.outcomes.iter().map(ActionOutcome::response).collect();
            self.record_step(step)?;
            if let Some(reason) = stop {
                return Err(reason);
            }
            if done || calls.is_empty() {
                info!(step = index, "model signalled completion");
                return Err(TerminationReason::ModelDone);
            }

            // Capturing
            screenshot = self.screenshot()?;

            // Deciding
            self.decide(index)?;
        }
        Ok(())
    }

    /// Query the model under a timeout, retrying transport failures with backoff.
    async fn ask_model(
        &mut self,
        payload: ModelPayload<'_>,
        cancel: &CancellationToken,
    ) -> Flow<ModelTurn> {
        let retry = self.config.model_retry;
        let timeout = self.config.model_timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = tokio::time::timeout(timeout, self.model.propose_actions(payload, &self.task));
            let answer = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TerminationReason::Cancelled),
                answer = call => answer,
            };
            let err = match answer {
                Ok(Ok(turn)) => return Ok(turn),
                Ok(Err(e)) => e,
                Err(_) => ModelError::Transport(format!("no answer within {}s", timeout.as_secs_f64())),
            };
            if !err.is_retryable() || attempt >= retry.max_attempts {
                error!(attempt, error = %err, "model call failed");
                return Err(TerminationReason::fatal(format!(
                    "{err} (after {attempt} attempt(s))"
                )));
            }

            let delay = retry
                .delay(attempt)
                .mul_f64(1.0 + rand::random::<f64>() * 0.25);
            warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying model call");
            self.pause(cancel, delay).await?;
        }
    }

    /// Run every call in order. A failing call never stops the batch; only a
    /// terminal condition does.
    async fn execute_batch(
        &mut self,
        calls: &[ProposedAction],
        viewport: &Viewport,
        step: &mut StepRecord,
        cancel: &CancellationToken,
    ) -> Option<TerminationReason> {
        for call in calls {
            let started = Instant::now();
            let (mut outcome, stop) = self.execute_call(call, viewport, step.index, cancel).await;
            outcome.duration_ms = started.elapsed().as_millis() as u64;
            if let Some(error) = &outcome.error {
                warn!(step = step.index, action = %outcome.name, error = %error, "action failed");
            }
            step.outcomes.push(outcome);
            if stop.is_some() {
                return stop;
            }
        }
        None
    }

    async fn execute_call(
        &mut self,
        call: &ProposedAction,
        viewport: &Viewport,
        step: usize,
        cancel: &CancellationToken,
    ) -> (ActionOutcome, Option<TerminationReason>) {
        let url = self.url.clone();
        let outcome = ActionOutcome::new(call, &url);

        if self.config.excluded_actions.iter().any(|a| a == &call.name) {
            return (outcome.failed(&url, format!("action '{}' is excluded", call.name)), None);
        }
        let action = match call.action() {
            Ok(action) => action,
            Err(e) => return (outcome.failed(&url, e.to_string()), None),
        };

        let mut outcome = outcome;
        if call.require_confirmation {
            info!(action = %call.name, "awaiting operator confirmation");
            let approved = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return (outcome.failed(&url, "cancelled"), Some(TerminationReason::Cancelled));
                }
                approved = self.confirmer.confirm(call) => approved,
            };
            outcome.confirmed = Some(approved);
            if !approved {
                info!(action = %call.name, "operator declined");
                outcome.result = ToolResult::declined(&url);
                return (outcome, None);
            }
        }

        match action {
            Action::PdpComplete {
                label,
                has_variants,
            } => {
                outcome.action = Some(Action::PdpComplete {
                    label: label.clone(),
                    has_variants,
                });
                for pdp in self.tracker.complete(&url, has_variants, label, step) {
                    if let Err(reason) = self.emit(pdp) {
                        return (outcome, Some(reason));
                    }
                }
                let stop = self.check_budget().err();
                (outcome, stop)
            }
            Action::Finish => {
                outcome.action = Some(Action::Finish);
                (outcome, Some(TerminationReason::ModelDone))
            }
            Action::Wait5Seconds => {
                outcome.action = Some(Action::Wait5Seconds);
                if let Err(reason) = self.pause(cancel, WAIT_ACTION_PAUSE).await {
                    return (outcome, Some(reason));
                }
                (outcome, None)
            }
            action => self.dispatch(action, outcome, viewport, cancel).await,
        }
    }

    /// Browser-facing actions: capture, execute, settle.
    async fn dispatch(
        &mut self,
        action: Action,
        mut outcome: ActionOutcome,
        viewport: &Viewport,
        cancel: &CancellationToken,
    ) -> (ActionOutcome, Option<TerminationReason>) {
        let normalize = self.config.normalize_coords;
        let resolved = action.resolve(viewport, normalize);
        outcome.action = Some(resolved.clone());
        outcome.point = action
            .interaction_point()
            .map(|p| viewport.resolve(p, normalize));

        // Capture before dispatch: the click may navigate away.
        if let Some(point) = outcome.point {
            match dom::capture(&mut self.browser, point.resolved, self.config.capture_depth) {
                Ok(capture) => {
                    self.tracker.attach_capture(&self.url, capture.clone());
                    outcome.capture = Some(capture);
                }
                Err(CaptureError::Browser(e)) if e.is_fatal() => {
                    return (outcome, Some(browser_fatal(e)));
                }
                Err(e) => {
                    debug!(error = %e, "capture miss");
                    outcome.capture_error = Some(e.to_string());
                }
            }
        }

        info!(action = %resolved.name(), "executing");
        let failure = match self.browser.execute(&resolved) {
            Ok(()) => None,
            Err(e) if e.is_fatal() => return (outcome, Some(browser_fatal(e))),
            Err(e) => Some(e.to_string()),
        };

        if let Err(reason) = self.settle(cancel).await {
            return (outcome, Some(reason));
        }
        let url = match self.current_url() {
            Ok(url) => url,
            Err(reason) => return (outcome, Some(reason)),
        };
        let outcome = match failure {
            None => {
                outcome.result = ToolResult::ok(&url);
                outcome
            }
            Some(message) => outcome.failed(&url, message),
        };
        (outcome, None)
    }

    /// Budget & classification after a step: finalize a PDP that was left,
    /// check the budget, then open the current page if it is a new PDP.
    fn decide(&mut self, step: usize) -> Flow<()> {
        let url = self.current_url()?;
        if let Some(left) = self.tracker.leave_if_navigated(&url) {
            self.emit(left)?;
        }
        self.check_budget()?;
        if self.detector.is_pdp(&url) && self.tracker.is_new(&url) {
            let kind = self.probe.classify(&mut self.browser);
            self.tracker.open(&url, kind, step);
        }
        Ok(())
    }

    fn check_budget(&self) -> Flow<()> {
        let counts = self.tracker.counts();
        let verdict = self.config.budget.verdict(counts);
        if verdict.is_stop() {
            info!(
                variant = counts.variant,
                variantless = counts.variantless,
                verdict = ?verdict,
                "pdp budget met"
            );
            return Err(TerminationReason::BudgetMet);
        }
        Ok(())
    }

    fn emit(&mut self, pdp: PdpRecord) -> Flow<()> {
        self.pdps.push(pdp.clone());
        self.sink.on_pdp(&pdp).map_err(sink_failure)
    }

    fn record_step(&mut self, step: StepRecord) -> Flow<()> {
        self.steps.push(step);
        match self.steps.last() {
            Some(step) => self.sink.on_step(step).map_err(sink_failure),
            None => Ok(()),
        }
    }

    /// Wait for the configured load state, then the fixed settle delay.
    /// A load-state timeout is a warning, not an error. Probes are single
    /// page reads; the wait between them is where cancellation lands.
    async fn settle(&mut self, cancel: &CancellationToken) -> Flow<()> {
        let wait = self.config.wait;
        let deadline = Instant::now() + wait.timeout;
        let mut previous: Option<LoadProgress> = None;
        loop {
            match self.browser.load_progress() {
                Ok(progress) => {
                    if wait.load_state.reached(&progress, previous.as_ref()) {
                        break;
                    }
                    previous = Some(progress);
                }
                Err(e) if e.is_fatal() => return Err(browser_fatal(e)),
                Err(e) => {
                    warn!(error = %e, "load state probe failed; continuing");
                    break;
                }
            }
            if Instant::now() >= deadline {
                warn!(
                    state = ?wait.load_state,
                    timeout_ms = wait.timeout.as_millis() as u64,
                    "load state not reached; continuing"
                );
                break;
            }
            self.pause(cancel, wait.load_state.poll_interval()).await?;
        }
        self.pause(cancel, wait.settle).await
    }

    async fn pause(&self, cancel: &CancellationToken, duration: Duration) -> Flow<()> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TerminationReason::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn screenshot(&mut self) -> Flow<Vec<u8>> {
        self.browser
            .screenshot()
            .map_err(|e| TerminationReason::fatal(format!("screenshot failed: {e}")))
    }

    fn current_url(&mut self) -> Flow<String> {
        match self.browser.current_url() {
            Ok(url) => {
                self.url.clone_from(&url);
                Ok(url)
            }
            Err(e) if e.is_fatal() => Err(browser_fatal(e)),
            Err(e) => {
                warn!(error = %e, "could not read url; using last known");
                Ok(self.url.clone())
            }
        }
    }

    fn viewport(&mut self) -> Flow<Viewport> {
        match self.browser.viewport() {
            Ok(viewport) => Ok(viewport),
            Err(e) if e.is_fatal() => Err(browser_fatal(e)),
            Err(e) => {
                warn!(error = %e, "could not read viewport; using default");
                Ok(Viewport::default())
            }
        }
    }

    /// Flush the open PDP and the session record, then release the browser.
    fn teardown(&mut self, started_at: DateTime<Utc>, termination: TerminationReason) -> SessionRecord {
        if let Some(pdp) = self.tracker.finish() {
            self.pdps.push(pdp.clone());
            if let Err(e) = self.sink.on_pdp(&pdp) {
                let message = format!("{e:#}");
                error!(error = %message, index = pdp.index, "failed to write pdp record");
            }
        }

        match &termination {
            TerminationReason::FatalError { message } => {
                error!(message = %message, "session terminated")
            }
            reason => info!(reason = ?reason, steps = self.steps.len(), "session finished"),
        }

        let record = SessionRecord {
            start_url: self.config.start_url.clone(),
            goal: self.task.goal.clone(),
            excluded_actions: self.task.excluded_actions.clone(),
            model: self.config.model.clone(),
            started_at,
            finished_at: Utc::now(),
            steps: self.steps.clone(),
            pdps: self.pdps.clone(),
            counts: self.tracker.counts(),
            termination,
        };
        if let Err(e) = self.sink.on_finish(&record) {
            let message = format!("{e:#}");
            error!(error = %message, "failed to write session record");
        }
        if let Err(e) = self.browser.close() {
            warn!(error = %e, "browser close failed");
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::{
        FakeBrowser, MemorySink, ScriptedConfirmer, ScriptedModel, call, chain, rect,
    };

    fn config() -> SessionConfig {
        SessionConfig {
            start_url: "https://shop.test/".into(),
            goal: "find products".into(),
            wait: crate::config::WaitPolicy {
                settle: Duration::ZERO,
                ..Default::default()
            },
            normalize_coords: false,
            ..SessionConfig::default()
        }
    }

    fn session(
        browser: FakeBrowser,
        model: ScriptedModel,
    ) -> Session<FakeBrowser, ScriptedModel, ScriptedConfirmer, MemorySink> {
        Session::new(config(), browser, model, ScriptedConfirmer::default(), MemorySink::default())
            .unwrap()
    }

    #[tokio::test]
    async fn empty_turn_is_model_done() {
        let mut s = session(FakeBrowser::new("about:blank"), ScriptedModel::new(vec![ModelTurn::done()]));
        let record = s.run(CancellationToken::new()).await;
        assert_eq!(record.termination, TerminationReason::ModelDone);
        assert_eq!(record.steps.len(), 1);
        assert!(s.browser().closed);
    }

    #[tokio::test]
    async fn excluded_and_unknown_calls_report_errors() {
        let mut cfg = config();
        cfg.excluded_actions = vec!["go_back".into()];
        let model = ScriptedModel::new(vec![ModelTurn::with_calls(vec![
            call("go_back", json!({})),
            call("teleport", json!({})),
        ])]);
        let mut s = Session::new(
            cfg,
            FakeBrowser::new("about:blank"),
            model,
            ScriptedConfirmer::default(),
            MemorySink::default(),
        )
        .unwrap();
        let record = s.run(CancellationToken::new()).await;

        let outcomes = &record.steps[0].outcomes;
        assert!(outcomes.iter().all(|o| o.result == ToolResult::error("https://shop.test/")));
        assert!(outcomes[0].error.as_deref().unwrap().contains("excluded"));
        assert!(outcomes[1].error.as_deref().unwrap().contains("unsupported"));
        assert!(s.browser().executed.is_empty());
    }

    #[tokio::test]
    async fn click_capture_is_local_only() {
        let mut browser = FakeBrowser::new("about:blank");
        browser
            .page_at("https://shop.test/")
            .add_hit(rect(0.0, 0.0, 50.0, 50.0), chain("a", &["nav", "body", "html"]));
        let model = ScriptedModel::new(vec![ModelTurn::with_calls(vec![call(
            "click_at",
            json!({"x": 10, "y": 10}),
        )])]);
        let mut s = session(browser, model);
        let record = s.run(CancellationToken::new()).await;

        let outcome = &record.steps[0].outcomes[0];
        assert_eq!(outcome.capture.as_ref().unwrap().ancestors.len(), 3);
        let second = &s.model().requests[1];
        assert_eq!(second.results.len(), 1);
        assert_eq!(
            serde_json::to_value(&second.results[0].result).unwrap(),
            json!({"status": "ok", "url": "https://shop.test/"})
        );
    }

    #[tokio::test]
    async fn transient_model_errors_are_retried() {
        let mut cfg = config();
        cfg.model_retry.base_delay = Duration::from_millis(1);
        let model = ScriptedModel::from_results(vec![
            Err(ModelError::Transport("503".into())),
            Ok(ModelTurn::done()),
        ]);
        let mut s = Session::new(
            cfg,
            FakeBrowser::new("about:blank"),
            model,
            ScriptedConfirmer::default(),
            MemorySink::default(),
        )
        .unwrap();
        let record = s.run(CancellationToken::new()).await;
        assert_eq!(record.termination, TerminationReason::ModelDone);
        assert_eq!(s.model().requests.len(), 2);
    }

    #[tokio::test]
    async fn rejected_model_request_is_fatal() {
        let model = ScriptedModel::from_results(vec![Err(ModelError::Rejected("bad key".into()))]);
        let mut s = session(FakeBrowser::new("about:blank"), model);
        let record = s.run(CancellationToken::new()).await;
        assert!(matches!(
            record.termination,
            TerminationReason::FatalError { ref message } if message.contains("bad key")
        ));
        assert_eq!(s.model().requests.len(), 1);
        assert!(s.sink().finished.is_some());
    }

    #[tokio::test]
    async fn model_timeout_counts_as_transport_failure() {
        let mut cfg = config();
        cfg.model_timeout = Duration::from_millis(10);
        cfg.model_retry.max_attempts = 2;
        cfg.model_retry.base_delay = Duration::from_millis(1);
        let model = ScriptedModel::new(vec![]).with_delay(Duration::from_secs(5));
        let mut s = Session::new(
            cfg,
            FakeBrowser::new("about:blank"),
            model,
            ScriptedConfirmer::default(),
            MemorySink::default(),
        )
        .unwrap();
        let record = s.run(CancellationToken::new()).await;
        assert!(matches!(
            record.termination,
            TerminationReason::FatalError { ref message } if message.contains("2 attempt")
        ));
    }

    #[tokio::test]
    async fn max_steps_bounds_the_loop() {
        let mut cfg = config();
        cfg.max_steps = 2;
        let scroll = || ModelTurn::with_calls(vec![call("scroll_document", json!({"direction": "down"}))]);
        let mut s = Session::new(
            cfg,
            FakeBrowser::new("about:blank"),
            ScriptedModel::new(vec![scroll(), scroll(), scroll()]),
            ScriptedConfirmer::default(),
            MemorySink::default(),
        )
        .unwrap();
        let record = s.run(CancellationToken::new()).await;
        assert_eq!(record.termination, TerminationReason::MaxSteps);
        assert_eq!(record.steps.len(), 2);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut cfg = config();
        cfg.start_url = "ftp://shop.test".into();
        let result = Session::new(
            cfg,
            FakeBrowser::new("about:blank"),
            ScriptedModel::default(),
            ScriptedConfirmer::default(),
            MemorySink::default(),
        );
        assert!(result.is_err());
    }
}
