use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use pdp_cua::brain::ModelTurn;
use pdp_cua::config::{MinimumsPolicy, PdpBudget, SessionConfig, WaitPolicy};
use pdp_cua::dom;
use pdp_cua::error::BrowserError;
use pdp_cua::output::RunSink;
use pdp_cua::policy::{ClassificationSource, FinalizeCause, PdpKind, PdpRecord};
use pdp_cua::session::{Session, SessionRecord, StepRecord, TerminationReason};
use pdp_cua::test_support::{
    FakeBrowser, MemorySink, ScriptedConfirmer, ScriptedModel, call, chain, event_log, rect,
};
use pdp_cua::types::{Action, Point, ToolResult, ToolStatus};

const HOME: &str = "https://example-shop.test/";

fn config(start_url: &str) -> SessionConfig {
    SessionConfig {
        start_url: start_url.into(),
        goal: "collect product pages".into(),
        wait: WaitPolicy {
            settle: Duration::ZERO,
            ..WaitPolicy::default()
        },
        normalize_coords: false,
        ..SessionConfig::default()
    }
}

fn turn(calls: Vec<pdp_cua::types::ProposedAction>) -> ModelTurn {
    ModelTurn::with_calls(calls)
}

fn click(x: f64, y: f64) -> ModelTurn {
    turn(vec![call("click_at", json!({"x": x, "y": y}))])
}

fn back() -> ModelTurn {
    turn(vec![call("go_back", json!({}))])
}

/// Home page with two product links; `variant` marks which product pages show variant pickers.
fn shop(variant: [bool; 2]) -> FakeBrowser {
    let mut browser = FakeBrowser::new("about:blank");
    browser
        .page_at(HOME)
        .add_link(rect(0.0, 0.0, 100.0, 50.0), chain("a", &["li", "ul", "body", "html"]), "https://example-shop.test/p/1")
        .add_link(rect(0.0, 100.0, 100.0, 50.0), chain("a", &["li", "ul", "body", "html"]), "https://example-shop.test/p/2");
    for (i, has_variants) in variant.into_iter().enumerate() {
        if has_variants {
            browser
                .page_at(&format!("https://example-shop.test/p/{}", i + 1))
                .add_element("[data-variant]", true, "Size");
        }
    }
    browser
}

async fn run(
    cfg: SessionConfig,
    browser: FakeBrowser,
    model: ScriptedModel,
    confirmer: ScriptedConfirmer,
) -> (SessionRecord, Session<FakeBrowser, ScriptedModel, ScriptedConfirmer, MemorySink>) {
    let mut session = Session::new(cfg, browser, model, confirmer, MemorySink::default()).unwrap();
    let record = session.run(CancellationToken::new()).await;
    (record, session)
}

#[tokio::test]
async fn click_to_variantless_pdp_end_to_end() {
    let start = "https://example-shop.test";
    let mut browser = FakeBrowser::new("about:blank");
    browser.page_at(start).add_link(
        rect(90.0, 190.0, 40.0, 20.0),
        chain("button", &["div", "body"]),
        "https://example-shop.test/p/123",
    );
    let model = ScriptedModel::new(vec![click(100.0, 200.0)]);

    let (record, session) = run(config(start), browser, model, ScriptedConfirmer::default()).await;

    let outcome = &record.steps[0].outcomes[0];
    let capture = outcome.capture.as_ref().unwrap();
    assert_eq!(capture.target.tag, "button");
    assert_eq!(capture.ancestors.len(), 2);

    assert_eq!(record.pdps.len(), 1);
    let pdp = &record.pdps[0];
    assert_eq!(pdp.url, "https://example-shop.test/p/123");
    assert_eq!(pdp.kind, PdpKind::Variantless);
    assert_eq!(pdp.classified_by, ClassificationSource::DomSignals);

    let requests = &session.model().requests;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].screenshot, b"png#2@https://example-shop.test/p/123");
    assert_ne!(requests[1].screenshot, requests[0].screenshot);
    assert_eq!(requests[1].results.len(), 1);
    assert_eq!(
        requests[1].results[0].result,
        ToolResult::ok("https://example-shop.test/p/123")
    );
    assert_eq!(record.termination, TerminationReason::ModelDone);
}

#[tokio::test]
async fn model_never_sees_capture_data() {
    let mut browser = shop([false, false]);
    browser
        .page_at("https://example-shop.test/p/1")
        .add_hit(rect(0.0, 0.0, 500.0, 500.0), chain("button", &["form", "main", "body", "html"]));
    let model = ScriptedModel::new(vec![
        click(10.0, 10.0),
        turn(vec![
            call("click_at", json!({"x": 20, "y": 20})),
            call("type_text_at", json!({"x": 30, "y": 30, "text": "size 9"})),
        ]),
    ]);

    let (record, session) = run(config(HOME), browser, model, ScriptedConfirmer::default()).await;

    assert!(record.steps.iter().flat_map(|s| &s.outcomes).all(|o| o.capture.is_some()));
    assert_eq!(record.pdps[0].captures.len(), 2);
    for request in &session.model().requests {
        for response in &request.results {
            let value = serde_json::to_value(&response.result).unwrap();
            let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
            assert_eq!(keys, vec!["status", "url"]);
        }
        let text = serde_json::to_string(&request.results).unwrap();
        assert!(!text.contains("locator"));
        assert!(!text.contains("ancestors"));
    }
}

#[test]
fn capture_is_repeatable_on_unchanged_page() {
    let mut browser = FakeBrowser::new(HOME);
    browser
        .page_mut()
        .add_hit(rect(0.0, 0.0, 100.0, 100.0), chain("img", &["picture", "a", "body", "html"]));

    let point = Point::new(40.0, 40.0);
    let first = dom::capture(&mut browser, point, 32).unwrap();
    let second = dom::capture(&mut browser, point, 32).unwrap();
    assert_eq!(first, second);
    assert!(browser.executed.is_empty());
}

#[tokio::test]
async fn budget_waits_for_a_variant_pdp_until_the_ceiling() {
    let model = ScriptedModel::new(vec![click(10.0, 10.0), back(), click(10.0, 110.0), back(), back()]);
    let (record, session) = run(config(HOME), shop([false, true]), model, ScriptedConfirmer::default()).await;

    assert_eq!(record.termination, TerminationReason::BudgetMet);
    // Still running after the variantless PDP was recorded.
    assert_eq!(record.steps.len(), 4);
    assert_eq!(record.counts.variantless, 1);
    assert_eq!(record.counts.variant, 1);

    let pdps = &session.sink().pdps;
    assert_eq!(pdps.len(), 2);
    assert_eq!(pdps[0].kind, PdpKind::Variantless);
    assert_eq!(pdps[1].kind, PdpKind::Variant);
    assert!(pdps.iter().all(|p| p.finalized_by == Some(FinalizeCause::Navigation)));
}

#[tokio::test]
async fn minimums_policy_decides_whether_to_keep_exploring() {
    let script = || ScriptedModel::new(vec![click(10.0, 10.0), back(), click(10.0, 110.0), back(), back()]);

    let (stopped, _) = run(config(HOME), shop([true, false]), script(), ScriptedConfirmer::default()).await;
    assert_eq!(stopped.termination, TerminationReason::BudgetMet);
    assert_eq!(stopped.steps.len(), 2);
    assert_eq!(stopped.pdps.len(), 1);

    let mut cfg = config(HOME);
    cfg.budget = PdpBudget {
        on_minimums_met: MinimumsPolicy::ExploreToMax,
        ..PdpBudget::default()
    };
    let (explored, _) = run(cfg, shop([true, false]), script(), ScriptedConfirmer::default()).await;
    assert_eq!(explored.termination, TerminationReason::BudgetMet);
    assert_eq!(explored.steps.len(), 4);
    assert_eq!(explored.counts.total(), 2);
}

#[tokio::test]
async fn one_failed_action_does_not_stop_the_batch() {
    let mut browser = FakeBrowser::new("about:blank");
    browser.fail_execute(1, BrowserError::Transient("element detached".into()));
    let model = ScriptedModel::new(vec![turn(vec![
        call("scroll_document", json!({"direction": "down"})),
        call("hover_at", json!({"x": 5, "y": 5})),
        call("key_combination", json!({"keys": "End"})),
    ])]);

    let (record, session) = run(config(HOME), browser, model, ScriptedConfirmer::default()).await;

    assert_eq!(record.termination, TerminationReason::ModelDone);
    assert_eq!(session.browser().executed.len(), 3);
    let statuses: Vec<ToolStatus> = session.model().requests[1]
        .results
        .iter()
        .map(|r| r.result.status)
        .collect();
    assert_eq!(statuses, vec![ToolStatus::Ok, ToolStatus::Error, ToolStatus::Ok]);
    let failed = &record.steps[0].outcomes[1];
    assert!(failed.error.as_deref().unwrap().contains("element detached"));
}

fn flagged_click() -> pdp_cua::types::ProposedAction {
    call(
        "click_at",
        json!({
            "x": 10,
            "y": 10,
            "safety_decision": {"decision": "require_confirmation", "explanation": "checkout"}
        }),
    )
}

#[tokio::test]
async fn approved_action_runs_after_confirmation() {
    let log = event_log();
    let browser = FakeBrowser::new("about:blank").with_log(log.clone());
    let confirmer = ScriptedConfirmer::new(vec![true]).with_log(log.clone());
    let model = ScriptedModel::new(vec![turn(vec![flagged_click()])]);

    let (record, session) = run(config(HOME), browser, model, confirmer).await;

    let events = log.lock().unwrap().clone();
    let confirmed = events.iter().position(|e| e == "confirm:click_at=true").unwrap();
    let executed = events.iter().position(|e| e == "execute:click_at").unwrap();
    assert!(confirmed < executed);
    assert_eq!(record.steps[0].outcomes[0].confirmed, Some(true));
    assert!(session.model().requests[1].results[0].safety_acknowledged);
}

#[tokio::test]
async fn declined_action_is_skipped_not_failed() {
    let log = event_log();
    let browser = FakeBrowser::new("about:blank").with_log(log.clone());
    let confirmer = ScriptedConfirmer::new(vec![false]).with_log(log.clone());
    let model = ScriptedModel::new(vec![turn(vec![
        flagged_click(),
        call("scroll_document", json!({"direction": "down"})),
    ])]);

    let (record, session) = run(config(HOME), browser, model, confirmer).await;

    let events = log.lock().unwrap().clone();
    assert!(!events.iter().any(|e| e == "execute:click_at"));
    let executed: Vec<&str> = session.browser().executed.iter().map(Action::name).collect();
    assert_eq!(executed, vec!["scroll_document"]);

    let declined = &record.steps[0].outcomes[0];
    assert_eq!(declined.result, ToolResult::declined(HOME));
    assert_eq!(declined.error, None);
    assert_eq!(record.termination, TerminationReason::ModelDone);
    assert!(!session.model().requests[1].results[0].safety_acknowledged);
}

#[tokio::test]
async fn pdp_complete_overrides_dom_guess_and_ends_the_batch() {
    let start = "https://example-shop.test/p/7";
    let model = ScriptedModel::new(vec![turn(vec![
        call("pdp_complete", json!({"has_variants": true, "label": "Trail runner"})),
        call("click_at", json!({"x": 10, "y": 10})),
    ])]);

    let (record, session) =
        run(config(start), FakeBrowser::new("about:blank"), model, ScriptedConfirmer::default()).await;

    assert_eq!(record.termination, TerminationReason::BudgetMet);
    assert_eq!(record.steps[0].outcomes.len(), 1);
    assert!(session.browser().executed.is_empty());
    let pdp = &record.pdps[0];
    assert_eq!(pdp.kind, PdpKind::Variant);
    assert_eq!(pdp.classified_by, ClassificationSource::Model);
    assert_eq!(pdp.label.as_deref(), Some("Trail runner"));
    assert_eq!(pdp.finalized_by, Some(FinalizeCause::ModelComplete));
}

#[tokio::test]
async fn repeated_pdp_complete_counts_the_page_once() {
    let start = "https://example-shop.test/p/7";
    let done = || turn(vec![call("pdp_complete", json!({"has_variants": false}))]);
    let model = ScriptedModel::new(vec![done(), done(), done()]);

    let (record, session) =
        run(config(start), FakeBrowser::new("about:blank"), model, ScriptedConfirmer::default()).await;

    assert_eq!(record.termination, TerminationReason::ModelDone);
    assert_eq!(record.counts.variantless, 1);
    assert_eq!(record.counts.total(), 1);
    assert_eq!(record.pdps.len(), 1);
    assert_eq!(session.sink().pdps.len(), 1);
    assert!(record
        .steps
        .iter()
        .flat_map(|s| &s.outcomes)
        .all(|o| o.result.status == ToolStatus::Ok));
}

fn cancel_after(cancel: &CancellationToken, delay: Duration) {
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}

#[tokio::test]
async fn cancellation_while_waiting_for_load_still_flushes() {
    let mut cfg = config(HOME);
    cfg.wait.timeout = Duration::from_secs(30);
    let mut session = Session::new(
        cfg,
        shop([false, false]).with_load_timeouts(),
        ScriptedModel::new(vec![click(10.0, 10.0)]),
        ScriptedConfirmer::default(),
        MemorySink::default(),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(50));
    let started = Instant::now();
    let record = session.run(cancel).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(record.termination, TerminationReason::Cancelled);
    assert!(session.model().requests.is_empty());
    assert_eq!(
        session.sink().finished.as_ref().unwrap().termination,
        TerminationReason::Cancelled
    );
    assert!(session.browser().closed);
}

#[tokio::test]
async fn wait_action_is_paused_by_the_session_not_the_browser() {
    let start = "https://example-shop.test/p/9";
    let mut session = Session::new(
        config(start),
        FakeBrowser::new("about:blank"),
        ScriptedModel::new(vec![turn(vec![call("wait_5_seconds", json!({}))])]),
        ScriptedConfirmer::default(),
        MemorySink::default(),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(50));
    let started = Instant::now();
    let record = session.run(cancel).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(record.termination, TerminationReason::Cancelled);
    assert!(session.browser().executed.is_empty());
    assert!(session.browser().closed);
}

#[tokio::test]
async fn cancellation_during_model_call_still_flushes() {
    let start = "https://example-shop.test/p/9";
    let model = ScriptedModel::new(vec![]).with_delay(Duration::from_secs(30));
    let mut session = Session::new(
        config(start),
        FakeBrowser::new("about:blank"),
        model,
        ScriptedConfirmer::default(),
        MemorySink::default(),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let started = Instant::now();
    let record = session.run(cancel).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(record.termination, TerminationReason::Cancelled);
    let sink = session.sink();
    assert_eq!(sink.pdps.len(), 1);
    assert_eq!(sink.pdps[0].finalized_by, Some(FinalizeCause::SessionEnd));
    assert_eq!(sink.finished.as_ref().unwrap().termination, TerminationReason::Cancelled);
    assert!(session.browser().closed);
}

#[tokio::test]
async fn browser_death_ends_the_run_with_artifacts() {
    let start = "https://example-shop.test/p/9";
    let mut browser = FakeBrowser::new("about:blank");
    browser.fail_execute(0, BrowserError::Fatal("target crashed".into()));
    let model = ScriptedModel::new(vec![click(10.0, 10.0)]);

    let (record, session) = run(config(start), browser, model, ScriptedConfirmer::default()).await;

    assert!(matches!(
        record.termination,
        TerminationReason::FatalError { ref message } if message.contains("target crashed")
    ));
    let sink = session.sink();
    assert_eq!(sink.steps.len(), 1);
    assert_eq!(sink.pdps.len(), 1);
    assert!(sink.finished.is_some());
    assert!(session.browser().closed);
}

#[tokio::test]
async fn load_timeouts_are_not_fatal() {
    let browser = shop([false, false]).with_load_timeouts();
    let model = ScriptedModel::new(vec![click(10.0, 10.0)]);
    let mut cfg = config(HOME);
    cfg.wait.timeout = Duration::from_millis(20);

    let (record, _) = run(cfg, browser, model, ScriptedConfirmer::default()).await;

    assert_eq!(record.termination, TerminationReason::ModelDone);
    assert_eq!(record.steps[0].outcomes[0].result, ToolResult::ok("https://example-shop.test/p/1"));
}

/// Refuses to store screenshots.
#[derive(Default)]
struct FullDisk {
    finished: Option<SessionRecord>,
}

impl RunSink for FullDisk {
    fn on_start(&mut self, _config: &SessionConfig) -> anyhow::Result<()> {
        Ok(())
    }

    fn store_screenshot(&mut self, _step: usize, _png: &[u8]) -> anyhow::Result<String> {
        anyhow::bail!("no space left on device")
    }

    fn on_step(&mut self, _step: &StepRecord) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_pdp(&mut self, _pdp: &PdpRecord) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_finish(&mut self, session: &SessionRecord) -> anyhow::Result<()> {
        self.finished = Some(session.clone());
        Ok(())
    }
}

#[tokio::test]
async fn artifact_write_failure_is_fatal() {
    let mut session = Session::new(
        config(HOME),
        FakeBrowser::new("about:blank"),
        ScriptedModel::default(),
        ScriptedConfirmer::default(),
        FullDisk::default(),
    )
    .unwrap();
    let record = session.run(CancellationToken::new()).await;

    assert!(matches!(
        record.termination,
        TerminationReason::FatalError { ref message } if message.contains("no space left")
    ));
    assert!(session.model().requests.is_empty());
    assert!(session.sink().finished.is_some());
}
