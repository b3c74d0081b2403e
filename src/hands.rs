use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use headless_chrome::browser::tab::ModifierKey;
use headless_chrome::browser::tab::point::Point as ChromePoint;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dom::{RawNode, capture_script};
use crate::error::BrowserError;
use crate::types::{Action, Viewport};

/// Page readiness milestone to wait for after an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    #[default]
    Load,
    #[value(name = "domcontentloaded")]
    DomContentLoaded,
    #[value(name = "networkidle")]
    NetworkIdle,
}

impl LoadState {
    /// Whether `now` satisfies this state. Network idle also needs the
    /// resource count to hold still since the `previous` probe.
    pub fn reached(self, now: &LoadProgress, previous: Option<&LoadProgress>) -> bool {
        match self {
            LoadState::DomContentLoaded => {
                now.ready_state == "interactive" || now.ready_state == "complete"
            }
            LoadState::Load => now.ready_state == "complete",
            LoadState::NetworkIdle => {
                now.ready_state == "complete"
                    && now.resources.is_some()
                    && previous.is_some_and(|p| p.resources == now.resources)
            }
        }
    }

    /// Delay between readiness probes.
    pub fn poll_interval(self) -> Duration {
        match self {
            LoadState::NetworkIdle => Duration::from_millis(500),
            _ => Duration::from_millis(100),
        }
    }
}

/// One readiness probe of the current document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadProgress {
    /// `document.readyState`.
    pub ready_state: String,
    /// Resource timing entries seen so far.
    pub resources: Option<u64>,
}

/// What a selector query found.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ElementInfo {
    pub visible: bool,
    pub text: String,
}

/// What to read from elements matched by a relative selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Text,
    /// `src`, falling back to `data-src`.
    ImageUrl,
}

/// Primitive operations against one live page.
///
/// Both the action loop and the rule evaluator talk to the browser only
/// through this trait. Implementations classify their failures: anything that
/// leaves the page usable is [`BrowserError::Transient`].
pub trait BrowserControl {
    fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;

    /// Dispatch one action. Control actions (`wait_5_seconds`, `pdp_complete`,
    /// `finish`) are no-ops; the session owns them.
    fn execute(&mut self, action: &Action) -> Result<(), BrowserError>;

    fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError>;

    /// Probe readiness once without blocking. Callers poll.
    fn load_progress(&mut self) -> Result<LoadProgress, BrowserError>;

    /// Element chain under a viewport point, target first, or `None`.
    fn hit_test(
        &mut self,
        x: f64,
        y: f64,
        max_depth: usize,
    ) -> Result<Option<Vec<RawNode>>, BrowserError>;

    fn query_element(&mut self, selector: &str) -> Result<Option<ElementInfo>, BrowserError>;

    fn count(&mut self, selector: &str) -> Result<usize, BrowserError>;

    /// For every match of `selector`, read the first match of `relative` inside it.
    fn extract_within(
        &mut self,
        selector: &str,
        relative: &str,
        mode: ReadMode,
    ) -> Result<Vec<Option<String>>, BrowserError>;

    /// Evaluate `expr` with `el` bound to the first match of `selector`.
    /// `None` when nothing matches.
    fn evaluate_predicate(
        &mut self,
        selector: &str,
        expr: &str,
    ) -> Result<Option<bool>, BrowserError>;

    fn click_element(&mut self, selector: &str) -> Result<(), BrowserError>;

    fn current_url(&mut self) -> Result<String, BrowserError>;

    fn viewport(&mut self) -> Result<Viewport, BrowserError>;

    fn close(&mut self) -> Result<(), BrowserError>;
}

/// Options for launching Chrome.
#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub headless: bool,
    pub viewport: Viewport,
    pub idle_timeout: Duration,
}

impl Default for ChromeOptions {
    fn default() -> Self {
        Self {
            headless: false,
            viewport: Viewport::default(),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// A Chrome instance driven over CDP. Owns the browser process for its lifetime.
pub struct ChromeBrowser {
    browser: Option<Browser>,
    tab: Arc<Tab>,
    viewport: Viewport,
}

impl ChromeBrowser {
    pub fn launch(options: &ChromeOptions) -> anyhow::Result<Self> {
        let launch = LaunchOptions {
            headless: options.headless,
            window_size: Some((options.viewport.width, options.viewport.height)),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
            ],
            idle_browser_timeout: options.idle_timeout,
            ..Default::default()
        };

        info!(headless = options.headless, "launching chrome");
        let browser = Browser::new(launch)
            .map_err(|e| anyhow::anyhow!("Browser launch failed: {}", e))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        debug!("chrome ready");

        Ok(Self {
            browser: Some(browser),
            tab,
            viewport: options.viewport,
        })
    }

    fn eval_string(&self, js: &str) -> Result<Option<String>, BrowserError> {
        let result = self.tab.evaluate(js, false).map_err(classify)?;
        Ok(result.value.and_then(|v| v.as_str().map(String::from)))
    }

    /// Evaluate a script that returns `JSON.stringify(..)` and parse it.
    fn eval_json(&self, js: &str) -> Result<Value, BrowserError> {
        let raw = self
            .eval_string(js)?
            .ok_or_else(|| BrowserError::Transient("script returned no value".into()))?;
        serde_json::from_str(&raw)
            .map_err(|e| BrowserError::Transient(format!("script returned bad JSON: {e}")))
    }

    /// Run `body` after checking every selector parses, so a `SyntaxError` from
    /// a selector becomes [`BrowserError::InvalidSelector`] and any other throw
    /// becomes a transient error. `body` sees the selectors as `selectors[i]`.
    fn query_json(&self, selectors: &[&str], body: &str) -> Result<Value, BrowserError> {
        let list = Value::Array(selectors.iter().map(|s| Value::String(s.to_string())).collect());
        let js = format!(
            r#"(() => {{
  const selectors = {list};
  for (const s of selectors) {{
    try {{ document.querySelector(s); }}
    catch (e) {{ return JSON.stringify({{ invalid: s, reason: String(e.message || e) }}); }}
  }}
  try {{ return JSON.stringify({{ ok: (() => {{ {body} }})() }}); }}
  catch (e) {{ return JSON.stringify({{ failed: String(e && e.message || e) }}); }}
}})()"#
        );
        let mut value = self.eval_json(&js)?;
        if let Some(selector) = value.get("invalid").and_then(Value::as_str) {
            return Err(BrowserError::InvalidSelector {
                selector: selector.to_string(),
                reason: value
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        if let Some(reason) = value.get("failed").and_then(Value::as_str) {
            return Err(BrowserError::Transient(format!("page script failed: {reason}")));
        }
        Ok(value.get_mut("ok").map(Value::take).unwrap_or(Value::Null))
    }

    fn point(x: f64, y: f64) -> ChromePoint {
        ChromePoint { x, y }
    }

    fn scroll_by(&self, dx: f64, dy: f64) -> Result<(), BrowserError> {
        self.tab
            .evaluate(&format!("window.scrollBy({dx}, {dy})"), false)
            .map_err(classify)?;
        Ok(())
    }

    fn press_combination(&self, keys: &str) -> Result<(), BrowserError> {
        let mut parts: Vec<&str> = keys.split('+').map(str::trim).filter(|k| !k.is_empty()).collect();
        let Some(key) = parts.pop() else {
            return Ok(());
        };
        let modifiers: Vec<ModifierKey> = parts
            .iter()
            .filter_map(|m| match m.to_ascii_lowercase().as_str() {
                "control" | "ctrl" => Some(ModifierKey::Ctrl),
                "shift" => Some(ModifierKey::Shift),
                "alt" => Some(ModifierKey::Alt),
                "meta" | "command" | "cmd" => Some(ModifierKey::Meta),
                _ => None,
            })
            .collect();
        if modifiers.is_empty() {
            self.tab.press_key(key).map_err(classify)?;
        } else {
            self.tab
                .press_key_with_modifiers(key, Some(modifiers.as_slice()))
                .map_err(classify)?;
        }
        Ok(())
    }
}

impl BrowserControl for ChromeBrowser {
    fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.tab.navigate_to(url).map_err(classify)?;
        Ok(())
    }

    fn execute(&mut self, action: &Action) -> Result<(), BrowserError> {
        let tab = self.tab.clone();
        match action {
            Action::OpenWebBrowser => {}
            Action::GoBack => {
                tab.evaluate("history.back()", false).map_err(classify)?;
            }
            Action::GoForward => {
                tab.evaluate("history.forward()", false).map_err(classify)?;
            }
            Action::Search { query } => {
                tab.navigate_to("https://www.google.com").map_err(classify)?;
                tab.wait_until_navigated().map_err(classify)?;
                if !query.is_empty() {
                    tab.find_element("textarea[name='q'], input[name='q']")
                        .and_then(|el| el.click().map(|_| ()))
                        .map_err(classify)?;
                    tab.type_str(query).map_err(classify)?;
                    tab.press_key("Enter").map_err(classify)?;
                }
            }
            Action::Navigate { url } => {
                tab.navigate_to(url).map_err(classify)?;
            }
            Action::ClickAt { x, y } => {
                tab.click_point(Self::point(*x, *y)).map_err(classify)?;
            }
            Action::HoverAt { x, y } => {
                tab.move_mouse_to_point(Self::point(*x, *y))
                    .map_err(classify)?;
            }
            Action::TypeTextAt {
                x,
                y,
                text,
                press_enter,
                clear_before_typing,
            } => {
                tab.click_point(Self::point(*x, *y)).map_err(classify)?;
                if *clear_before_typing {
                    let select_all = if cfg!(target_os = "macos") {
                        "Meta+a"
                    } else {
                        "Control+a"
                    };
                    self.press_combination(select_all)?;
                    tab.press_key("Backspace").map_err(classify)?;
                }
                if !text.is_empty() {
                    tab.type_str(text).map_err(classify)?;
                }
                if *press_enter {
                    tab.press_key("Enter").map_err(classify)?;
                }
            }
            Action::KeyCombination { keys } => self.press_combination(keys)?,
            Action::ScrollDocument {
                direction,
                magnitude,
            } => {
                let (dx, dy) = direction.delta(*magnitude);
                self.scroll_by(dx, dy)?;
            }
            Action::ScrollAt {
                x,
                y,
                direction,
                magnitude,
            } => {
                let (dx, dy) = direction.delta(*magnitude);
                tab.move_mouse_to_point(Self::point(*x, *y))
                    .map_err(classify)?;
                tab.evaluate(
                    &format!(
                        r#"(() => {{
  let n = document.elementFromPoint({x}, {y});
  while (n && n !== document.body && n.scrollHeight <= n.clientHeight && n.scrollWidth <= n.clientWidth) n = n.parentElement;
  (n && n !== document.body ? n : window).scrollBy({dx}, {dy});
}})()"#
                    ),
                    false,
                )
                .map_err(classify)?;
            }
            Action::DragAndDrop { .. } => {
                return Err(BrowserError::Transient(
                    "drag_and_drop is not supported by this browser".into(),
                ));
            }
            Action::Scroll { dx, dy } => self.scroll_by(*dx, *dy)?,
            Action::Wait5Seconds | Action::PdpComplete { .. } | Action::Finish => {}
        }
        Ok(())
    }

    fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
        self.tab
            .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
            .map_err(classify)
    }

    fn load_progress(&mut self) -> Result<LoadProgress, BrowserError> {
        let value = self.eval_json(
            "JSON.stringify({ ready: document.readyState, resources: performance.getEntriesByType('resource').length })",
        )?;
        Ok(LoadProgress {
            ready_state: value
                .get("ready")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            resources: value.get("resources").and_then(Value::as_u64),
        })
    }

    fn hit_test(
        &mut self,
        x: f64,
        y: f64,
        max_depth: usize,
    ) -> Result<Option<Vec<RawNode>>, BrowserError> {
        let value = self.eval_json(&capture_script(crate::types::Point::new(x, y), max_depth))?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| BrowserError::Transient(format!("unexpected capture shape: {e}")))
    }

    fn query_element(&mut self, selector: &str) -> Result<Option<ElementInfo>, BrowserError> {
        let value = self.query_json(
            &[selector],
            r#"const el = document.querySelector(selectors[0]);
  if (!el) return null;
  const s = getComputedStyle(el);
  const r = el.getBoundingClientRect();
  const visible = s.display !== 'none' && s.visibility !== 'hidden' && r.width > 0 && r.height > 0;
  return { visible, text: (el.innerText || '').trim().slice(0, 200) };"#,
        )?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| BrowserError::Transient(e.to_string()))
    }

    fn count(&mut self, selector: &str) -> Result<usize, BrowserError> {
        let value =
            self.query_json(&[selector], "return document.querySelectorAll(selectors[0]).length;")?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    fn extract_within(
        &mut self,
        selector: &str,
        relative: &str,
        mode: ReadMode,
    ) -> Result<Vec<Option<String>>, BrowserError> {
        let read = match mode {
            ReadMode::Text => "(c.innerText || c.textContent || '').trim()",
            ReadMode::ImageUrl => "c.getAttribute('src') || c.getAttribute('data-src')",
        };
        let body = format!(
            r#"const [selector, relative] = selectors;
  return Array.from(document.querySelectorAll(selector)).map(item => {{
    const c = item.matches(relative) ? item : item.querySelector(relative);
    return c ? ({read}) || null : null;
  }});"#
        );
        let value = self.query_json(&[selector, relative], &body)?;
        serde_json::from_value(value).map_err(|e| BrowserError::Transient(e.to_string()))
    }

    fn evaluate_predicate(
        &mut self,
        selector: &str,
        expr: &str,
    ) -> Result<Option<bool>, BrowserError> {
        let body = format!(
            r#"const el = document.querySelector(selectors[0]);
  if (!el) return null;
  return !!(function(el) {{ return eval({expr}); }})(el);"#,
            expr = js_string(expr),
        );
        let value = self.query_json(&[selector], &body)?;
        Ok(value.as_bool())
    }

    fn click_element(&mut self, selector: &str) -> Result<(), BrowserError> {
        self.tab
            .find_element(selector)
            .and_then(|el| el.click().map(|_| ()))
            .map_err(classify)
    }

    fn current_url(&mut self) -> Result<String, BrowserError> {
        Ok(self.tab.get_url())
    }

    fn viewport(&mut self) -> Result<Viewport, BrowserError> {
        match self.eval_json("JSON.stringify({ width: window.innerWidth, height: window.innerHeight })") {
            Ok(value) => Ok(serde_json::from_value(value).unwrap_or(self.viewport)),
            Err(e) if !e.is_fatal() => Ok(self.viewport),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) -> Result<(), BrowserError> {
        if self.browser.take().is_some() {
            info!("chrome closed");
        }
        Ok(())
    }
}

impl Drop for ChromeBrowser {
    fn drop(&mut self) {
        if self.browser.is_some() {
            warn!("chrome dropped without close");
        }
    }
}

/// Errors that mean the CDP connection is gone are fatal; everything else is transient.
fn classify(err: anyhow::Error) -> BrowserError {
    let message = format!("{err:#}");
    let lower = message.to_ascii_lowercase();
    let dead = [
        "connection is closed",
        "connection closed",
        "channel closed",
        "receiving on a closed channel",
        "browser process exited",
        "target closed",
    ];
    if dead.iter().any(|needle| lower.contains(needle)) {
        BrowserError::Fatal(message)
    } else {
        BrowserError::Transient(message)
    }
}

fn js_string(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}
