//! Budget & classification policy: which pages are PDPs, whether they have
//! variants, and when the run has collected enough of them.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{MinimumsPolicy, PdpBudget};
use crate::dom::CaptureRecord;
use crate::hands::BrowserControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdpKind {
    Variant,
    Variantless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    /// Guessed from variant selectors present in the DOM.
    DomSignals,
    /// Declared by the model through `pdp_complete`.
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeCause {
    Navigation,
    ModelComplete,
    SessionEnd,
}

/// Everything collected on one product detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdpRecord {
    /// 1-based, in the order PDPs were opened.
    pub index: usize,
    pub url: String,
    pub page_key: String,
    pub kind: PdpKind,
    pub classified_by: ClassificationSource,
    pub label: Option<String>,
    pub captures: Vec<CaptureRecord>,
    /// Indices of the steps during which this PDP was open.
    pub steps: Vec<usize>,
    pub finalized_by: Option<FinalizeCause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PdpCounts {
    pub variant: usize,
    pub variantless: usize,
}

impl PdpCounts {
    pub fn total(&self) -> usize {
        self.variant + self.variantless
    }

    fn record(&mut self, kind: PdpKind) {
        match kind {
            PdpKind::Variant => self.variant += 1,
            PdpKind::Variantless => self.variantless += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    Continue,
    /// Both minimums hold and the policy says stop.
    MinimumsMet,
    /// `max_pdp` reached, minimums or not.
    Ceiling,
}

impl BudgetVerdict {
    pub fn is_stop(self) -> bool {
        !matches!(self, BudgetVerdict::Continue)
    }
}

impl PdpBudget {
    pub fn verdict(&self, counts: PdpCounts) -> BudgetVerdict {
        if counts.total() >= self.max_pdp {
            return BudgetVerdict::Ceiling;
        }
        let minimums = counts.variant >= self.min_variant && counts.variantless >= self.min_variantless;
        match (minimums, self.on_minimums_met) {
            (true, MinimumsPolicy::Stop) => BudgetVerdict::MinimumsMet,
            _ => BudgetVerdict::Continue,
        }
    }
}

/// Decides whether a URL is a product detail page.
pub trait PdpDetector {
    fn is_pdp(&self, url: &str) -> bool;
}

pub struct UrlPatternDetector {
    pattern: Regex,
}

impl UrlPatternDetector {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl PdpDetector for UrlPatternDetector {
    fn is_pdp(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }
}

/// Classifies a PDP as variant or variantless from DOM selectors.
#[derive(Debug, Clone)]
pub struct VariantProbe {
    signals: Vec<String>,
}

impl VariantProbe {
    pub fn new(signals: Vec<String>) -> Self {
        Self { signals }
    }

    /// Any signal selector resolving means variants. Query failures count as absence.
    pub fn classify<B: BrowserControl + ?Sized>(&self, browser: &mut B) -> PdpKind {
        for signal in &self.signals {
            match browser.query_element(signal) {
                Ok(Some(_)) => {
                    debug!(signal = %signal, "variant signal found");
                    return PdpKind::Variant;
                }
                Ok(None) => {}
                Err(e) => warn!(signal = %signal, error = %e, "variant signal query failed"),
            }
        }
        PdpKind::Variantless
    }
}

/// Scheme, host and path of a URL; query and fragment dropped.
///
/// Variant pickers often rewrite the query string; the page stays the same PDP.
/// Scheme and host compare case-insensitively, the path does not.
pub fn page_key(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let url = url[..end].trim_end_matches('/');
    let authority_start = url.find("://").map_or(0, |i| i + 3);
    let path_start = url[authority_start..]
        .find('/')
        .map_or(url.len(), |i| authority_start + i);
    let (origin, path) = url.split_at(path_start);
    format!("{}{path}", origin.to_ascii_lowercase())
}

/// Single-writer accumulator of PDP records for one session.
#[derive(Debug, Default)]
pub struct PdpTracker {
    open: Option<PdpRecord>,
    seen: HashSet<String>,
    counts: PdpCounts,
    opened: usize,
}

impl PdpTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> PdpCounts {
        self.counts
    }

    pub fn current(&self) -> Option<&PdpRecord> {
        self.open.as_ref()
    }

    /// Attach a capture taken on `url` to the open PDP, if it is that page.
    pub fn attach_capture(&mut self, url: &str, capture: CaptureRecord) -> bool {
        match self.open.as_mut() {
            Some(pdp) if pdp.page_key == page_key(url) => {
                pdp.captures.push(capture);
                true
            }
            _ => false,
        }
    }

    /// Note that `step` ran while the open PDP (if any) was showing.
    pub fn touch(&mut self, step: usize) {
        if let Some(pdp) = self.open.as_mut() {
            if pdp.steps.last() != Some(&step) {
                pdp.steps.push(step);
            }
        }
    }

    /// Finalize the open PDP if the browser has moved to a different page.
    pub fn leave_if_navigated(&mut self, url: &str) -> Option<PdpRecord> {
        let moved = self
            .open
            .as_ref()
            .is_some_and(|pdp| pdp.page_key != page_key(url));
        if moved {
            self.finalize(FinalizeCause::Navigation)
        } else {
            None
        }
    }

    /// True when `url` is neither open nor already recorded.
    pub fn is_new(&self, url: &str) -> bool {
        let key = page_key(url);
        !self.seen.contains(&key) && self.open.as_ref().is_none_or(|pdp| pdp.page_key != key)
    }

    pub fn open(&mut self, url: &str, kind: PdpKind, step: usize) -> &PdpRecord {
        let record = self.new_record(url, kind, step);
        self.open.insert(record)
    }

    /// The model declared the current page done.
    ///
    /// Returns every record this finalizes, in order: a PDP the browser already
    /// left, then the completed one. A page never detected as a PDP gets a
    /// record opened for it first. A page already recorded is not counted again.
    pub fn complete(
        &mut self,
        url: &str,
        has_variants: bool,
        label: Option<String>,
        step: usize,
    ) -> Vec<PdpRecord> {
        let kind = if has_variants {
            PdpKind::Variant
        } else {
            PdpKind::Variantless
        };
        let mut finalized: Vec<PdpRecord> = self.leave_if_navigated(url).into_iter().collect();
        if self.open.is_none() && self.seen.contains(&page_key(url)) {
            debug!(url = %url, "pdp already recorded; ignoring completion");
            return finalized;
        }
        let mut pdp = match self.open.take() {
            Some(pdp) => pdp,
            None => self.new_record(url, kind, step),
        };
        pdp.kind = kind;
        pdp.classified_by = ClassificationSource::Model;
        pdp.label = label;
        self.open = Some(pdp);
        finalized.extend(self.finalize(FinalizeCause::ModelComplete));
        finalized
    }

    fn new_record(&mut self, url: &str, kind: PdpKind, step: usize) -> PdpRecord {
        self.opened += 1;
        info!(index = self.opened, url = %url, kind = ?kind, "pdp opened");
        PdpRecord {
            index: self.opened,
            url: url.to_string(),
            page_key: page_key(url),
            kind,
            classified_by: ClassificationSource::DomSignals,
            label: None,
            captures: Vec::new(),
            steps: vec![step],
            finalized_by: None,
        }
    }

    /// Finalize whatever is open at session end.
    pub fn finish(&mut self) -> Option<PdpRecord> {
        self.finalize(FinalizeCause::SessionEnd)
    }

    fn finalize(&mut self, cause: FinalizeCause) -> Option<PdpRecord> {
        let mut pdp = self.open.take()?;
        pdp.finalized_by = Some(cause);
        self.counts.record(pdp.kind);
        self.seen.insert(pdp.page_key.clone());
        info!(index = pdp.index, kind = ?pdp.kind, cause = ?cause, "pdp finalized");
        Some(pdp)
    }
}
