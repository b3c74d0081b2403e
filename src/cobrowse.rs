//! Co-browse: replay an authored [`RuleSet`] against whatever page the browser
//! currently shows, and report per-rule results.
//!
//! Evaluation is read-only unless the evaluator is interactive, in which case
//! it clicks the add-to-cart element once per page. A rule that fails is
//! reported and the rest still run; only a dead browser stops an evaluation.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{BrowserError, RuleError};
use crate::hands::{BrowserControl, ElementInfo, ReadMode};
use crate::policy::page_key;
use crate::rules::RuleSet;

pub const PDP_URL_RULE: &str = "pdp_url_regex";
pub const ADD_TO_CART_RULE: &str = "add_to_cart_selector";
pub const CLICKABLE_RULE: &str = "clickable_js";
pub const ADD_TO_CART_CLICK: &str = "add_to_cart_click";

/// Id of one field of one variant group, e.g. `variant_extraction.groups[0].variant_selector`.
pub fn group_rule_id(group: usize, field: &str) -> String {
    format!("variant_extraction.groups[{group}].{field}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Extracted(Value),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleOutcome {
    pub matched: bool,
    #[serde(flatten)]
    pub resolution: Resolution,
}

impl RuleOutcome {
    fn extracted(matched: bool, value: Value) -> Self {
        Self {
            matched,
            resolution: Resolution::Extracted(value),
        }
    }

    fn error(err: &RuleError) -> Self {
        Self {
            matched: false,
            resolution: Resolution::Error(err.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.resolution, Resolution::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantOption {
    pub text: Option<String>,
    pub image: Option<String>,
    pub availability: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantGroupResult {
    pub index: usize,
    pub group_type: String,
    /// The option selector matched at least one element.
    pub satisfied: bool,
    pub options: Vec<VariantOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub url: String,
    pub evaluated_at: DateTime<Utc>,
    pub is_pdp: bool,
    pub rules: BTreeMap<String, RuleOutcome>,
    pub variant_groups: Vec<VariantGroupResult>,
}

/// Keep fatal errors for the caller; everything else becomes a rule error.
fn contain<T>(result: Result<T, BrowserError>) -> Result<Result<T, RuleError>, BrowserError> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => Ok(Err(RuleError::Browser(e))),
    }
}

pub struct RuleEvaluator {
    rules: RuleSet,
    pdp_regex: Result<Regex, RuleError>,
    interactive: bool,
    clicked: HashSet<String>,
}

impl RuleEvaluator {
    pub fn new(rules: RuleSet) -> Self {
        let pdp_regex = match rules.pdp_url_regex() {
            None => Err(RuleError::NotAuthored),
            Some(pattern) => Regex::new(pattern).map_err(|e| RuleError::InvalidRegex(e.to_string())),
        };
        Self {
            rules,
            pdp_regex,
            interactive: false,
            clicked: HashSet::new(),
        }
    }

    /// Click add-to-cart (once per page) when it is found and clickable.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn evaluate<B: BrowserControl + ?Sized>(
        &mut self,
        browser: &mut B,
    ) -> Result<EvaluationResult, BrowserError> {
        let url = browser.current_url()?;
        let mut rules = BTreeMap::new();

        let is_pdp = match &self.pdp_regex {
            Ok(re) => {
                let matched = re.is_match(&url);
                rules.insert(PDP_URL_RULE.to_string(), RuleOutcome::extracted(matched, json!(matched)));
                matched
            }
            Err(e) => {
                rules.insert(PDP_URL_RULE.to_string(), RuleOutcome::error(e));
                false
            }
        };

        let add_to_cart = self.evaluate_add_to_cart(browser, &url, &mut rules)?;

        let mut variant_groups = Vec::with_capacity(self.rules.variant_extraction.groups.len());
        for index in 0..self.rules.variant_extraction.groups.len() {
            variant_groups.push(self.evaluate_group(browser, index, &mut rules)?);
        }

        debug!(url = %url, is_pdp, add_to_cart, rules = rules.len(), "rules evaluated");
        Ok(EvaluationResult {
            url,
            evaluated_at: Utc::now(),
            is_pdp,
            rules,
            variant_groups,
        })
    }

    /// Returns whether add-to-cart was found and visible.
    fn evaluate_add_to_cart<B: BrowserControl + ?Sized>(
        &mut self,
        browser: &mut B,
        url: &str,
        rules: &mut BTreeMap<String, RuleOutcome>,
    ) -> Result<bool, BrowserError> {
        let selector = self.rules.add_to_cart_selector().map(String::from);
        let found: Result<Option<ElementInfo>, RuleError> = match &selector {
            None => Err(RuleError::NotAuthored),
            Some(selector) => contain(browser.query_element(selector))?,
        };
        let visible = matches!(&found, Ok(Some(info)) if info.visible);
        let outcome = match &found {
            Ok(Some(info)) => RuleOutcome::extracted(
                info.visible,
                json!({ "found": true, "visible": info.visible, "text": info.text }),
            ),
            Ok(None) => RuleOutcome::extracted(false, json!({ "found": false })),
            Err(e) => RuleOutcome::error(e),
        };
        rules.insert(ADD_TO_CART_RULE.to_string(), outcome);

        let clickable: Result<Option<bool>, RuleError> = match (&selector, self.rules.clickable_js()) {
            (_, None) => Err(RuleError::NotAuthored),
            (None, Some(_)) => Err(RuleError::Unresolved(ADD_TO_CART_RULE.into())),
            (Some(_), Some(_)) if found.is_err() => Err(RuleError::Unresolved(ADD_TO_CART_RULE.into())),
            (Some(selector), Some(expr)) => contain(browser.evaluate_predicate(selector, expr))?,
        };
        let outcome = match &clickable {
            Ok(Some(value)) => RuleOutcome::extracted(*value, json!(value)),
            Ok(None) => RuleOutcome::extracted(false, Value::Null),
            Err(e) => RuleOutcome::error(e),
        };
        rules.insert(CLICKABLE_RULE.to_string(), outcome);

        let not_blocked = !matches!(clickable, Ok(Some(false)));
        if let Some(selector) = selector.filter(|_| self.interactive && visible && not_blocked) {
            if self.clicked.insert(page_key(url)) {
                info!(url = %url, selector = %selector, "clicking add to cart");
                let outcome = match contain(browser.click_element(&selector))? {
                    Ok(()) => RuleOutcome::extracted(true, json!(true)),
                    Err(e) => RuleOutcome::error(&e),
                };
                rules.insert(ADD_TO_CART_CLICK.to_string(), outcome);
            }
        }
        Ok(visible)
    }

    fn evaluate_group<B: BrowserControl + ?Sized>(
        &self,
        browser: &mut B,
        index: usize,
        rules: &mut BTreeMap<String, RuleOutcome>,
    ) -> Result<VariantGroupResult, BrowserError> {
        let group = &self.rules.variant_extraction.groups[index];
        let option_rule = group_rule_id(index, "variant_selector");

        let count: Result<usize, RuleError> = match group.variant_selector() {
            None => Err(RuleError::NotAuthored),
            Some(selector) => contain(browser.count(selector))?,
        };
        let outcome = match &count {
            Ok(n) => RuleOutcome::extracted(*n > 0, json!(n)),
            Err(e) => RuleOutcome::error(e),
        };
        rules.insert(option_rule.clone(), outcome);

        let fields = [
            ("variant_text_selector", group.text_selector(), ReadMode::Text),
            ("variant_image_selector", group.image_selector(), ReadMode::ImageUrl),
            ("variant_availability_selector", group.availability_selector(), ReadMode::Text),
        ];
        let mut columns: [Vec<Option<String>>; 3] = Default::default();
        for (column, (field, relative, mode)) in fields.into_iter().enumerate() {
            let Some(relative) = relative else {
                continue;
            };
            let values = match (&count, group.variant_selector()) {
                (Ok(_), Some(selector)) => contain(browser.extract_within(selector, relative, mode))?,
                _ => Err(RuleError::Unresolved(option_rule.clone())),
            };
            let outcome = match &values {
                Ok(values) => RuleOutcome::extracted(values.iter().any(Option::is_some), json!(values)),
                Err(e) => RuleOutcome::error(e),
            };
            rules.insert(group_rule_id(index, field), outcome);
            if let Ok(values) = values {
                columns[column] = values;
            }
        }

        let total = count.as_ref().copied().unwrap_or(0);
        let cell = |column: &Vec<Option<String>>, row: usize| column.get(row).cloned().flatten();
        let options = (0..total)
            .map(|row| VariantOption {
                text: cell(&columns[0], row),
                image: cell(&columns[1], row),
                availability: cell(&columns[2], row),
            })
            .collect();

        Ok(VariantGroupResult {
            index,
            group_type: group.group_type.clone(),
            satisfied: total > 0,
            options,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CobrowseOptions {
    pub interval: Duration,
    /// Evaluate a single time and return.
    pub once: bool,
}

impl Default for CobrowseOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            once: false,
        }
    }
}

/// Re-evaluate on a fixed interval until cancelled. Returns the number of passes.
pub async fn cobrowse<B, F>(
    browser: &mut B,
    evaluator: &mut RuleEvaluator,
    options: CobrowseOptions,
    cancel: &CancellationToken,
    mut on_eval: F,
) -> Result<usize, BrowserError>
where
    B: BrowserControl + ?Sized,
    F: FnMut(&EvaluationResult),
{
    let mut passes = 0;
    while !cancel.is_cancelled() {
        let result = evaluator.evaluate(browser)?;
        passes += 1;
        on_eval(&result);
        if options.once {
            break;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(options.interval) => {}
        }
    }
    info!(passes, "co-browse stopped");
    Ok(passes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::VariantGroup;
    use crate::test_support::FakeBrowser;

    fn rules() -> RuleSet {
        RuleSet {
            pdp_url_regex: r"/p/\d+".into(),
            add_to_cart_selector: "button.atc".into(),
            clickable_js: "!el.disabled".into(),
            variant_extraction: crate::rules::VariantExtraction {
                groups: vec![VariantGroup {
                    group_type: "size".into(),
                    variant_selector: "li.size".into(),
                    variant_text_selector: "span".into(),
                    variant_availability_selector: ".stock".into(),
                    ..VariantGroup::default()
                }],
            },
            ..RuleSet::default()
        }
    }

    fn pdp() -> FakeBrowser {
        let mut browser = FakeBrowser::new("https://shop.test/p/42");
        browser
            .page_mut()
            .add_element("button.atc", true, "Add to cart")
            .set_predicate("button.atc", true)
            .set_count("li.size", 2)
            .add_extraction("li.size", "span", vec![Some("S"), Some("M")])
            .add_extraction("li.size", ".stock", vec![None, Some("Sold out")]);
        browser
    }

    #[test]
    fn resolves_every_rule_on_a_pdp() {
        let mut browser = pdp();
        let result = RuleEvaluator::new(rules()).evaluate(&mut browser).unwrap();

        assert!(result.is_pdp);
        assert!(result.rules.values().all(|r| r.matched), "{:?}", result.rules);
        let group = &result.variant_groups[0];
        assert!(group.satisfied);
        assert_eq!(
            group.options[1],
            VariantOption {
                text: Some("M".into()),
                image: None,
                availability: Some("Sold out".into()),
            }
        );
        assert!(!result.rules.contains_key(&group_rule_id(0, "variant_image_selector")));
        assert!(browser.clicked.is_empty());
    }

    #[test]
    fn partial_group_is_reported_per_field() {
        let mut browser = pdp();
        browser.page_mut().add_invalid_selector(".stock");
        let result = RuleEvaluator::new(rules()).evaluate(&mut browser).unwrap();

        assert!(result.variant_groups[0].satisfied);
        assert!(result.rules[&group_rule_id(0, "variant_text_selector")].matched);
        assert!(result.rules[&group_rule_id(0, "variant_availability_selector")].is_error());
        assert_eq!(result.variant_groups[0].options[0].text.as_deref(), Some("S"));
    }

    #[test]
    fn unresolved_option_selector_fails_dependent_fields() {
        let mut browser = FakeBrowser::new("https://shop.test/p/42");
        browser.page_mut().add_invalid_selector("li.size");
        let result = RuleEvaluator::new(rules()).evaluate(&mut browser).unwrap();

        let group = &result.variant_groups[0];
        assert!(!group.satisfied);
        assert!(group.options.is_empty());
        assert_eq!(
            result.rules[&group_rule_id(0, "variant_text_selector")].resolution,
            Resolution::Error("depends on unresolved rule 'variant_extraction.groups[0].variant_selector'".into())
        );
    }

    #[test]
    fn invalid_regex_does_not_block_other_rules() {
        let mut broken = rules();
        broken.pdp_url_regex = "(".into();
        let mut browser = pdp();
        let result = RuleEvaluator::new(broken).evaluate(&mut browser).unwrap();

        assert!(!result.is_pdp);
        assert!(result.rules[PDP_URL_RULE].is_error());
        assert!(result.rules[ADD_TO_CART_RULE].matched);
        assert!(result.variant_groups[0].satisfied);
    }

    #[test]
    fn interactive_mode_clicks_once_per_page() {
        let mut browser = pdp();
        let mut evaluator = RuleEvaluator::new(rules()).interactive(true);
        let first = evaluator.evaluate(&mut browser).unwrap();
        let second = evaluator.evaluate(&mut browser).unwrap();

        assert!(first.rules[ADD_TO_CART_CLICK].matched);
        assert!(!second.rules.contains_key(ADD_TO_CART_CLICK));
        assert_eq!(browser.clicked, vec!["button.atc"]);
    }

    #[test]
    fn interactive_mode_respects_clickable_check() {
        let mut browser = pdp();
        browser.page_mut().set_predicate("button.atc", false);
        let mut evaluator = RuleEvaluator::new(rules()).interactive(true);
        let result = evaluator.evaluate(&mut browser).unwrap();

        assert!(!result.rules[CLICKABLE_RULE].matched);
        assert!(browser.clicked.is_empty());
    }

    #[test]
    fn dead_browser_stops_evaluation() {
        let mut browser = pdp();
        browser.closed = true;
        let err = RuleEvaluator::new(rules()).evaluate(&mut browser).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn loop_runs_once_or_until_cancelled() {
        let mut browser = pdp();
        let mut evaluator = RuleEvaluator::new(rules());
        let cancel = CancellationToken::new();
        let once = CobrowseOptions {
            interval: Duration::from_millis(1),
            once: true,
        };
        let mut seen = Vec::new();
        let passes = cobrowse(&mut browser, &mut evaluator, once, &cancel, |r| seen.push(r.url.clone()))
            .await
            .unwrap();
        assert_eq!(passes, 1);
        assert_eq!(seen, vec!["https://shop.test/p/42"]);

        let repeat = CobrowseOptions {
            interval: Duration::from_millis(1),
            once: false,
        };
        let mut count = 0;
        let passes = cobrowse(&mut browser, &mut evaluator, repeat, &cancel, |_| {
            count += 1;
            if count == 3 {
                cancel.cancel();
            }
        })
        .await
        .unwrap();
        assert_eq!(passes, 3);
    }
}
