//! Run configuration for an exploration session.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hands::LoadState;

pub const DEFAULT_CUA_MODEL: &str = "gemini-2.5-computer-use-preview-10-2025";

/// Matches the common shapes of product URLs (`/p/123`, `/product/slug`, `/dp/B0..`).
pub const DEFAULT_PDP_URL_REGEX: &str =
    r"(?i)/(p|pd|pdp|product|products|dp|item|items|t)/[^/?#]+";

/// Selectors whose presence on a PDP suggests selectable variants.
pub const DEFAULT_VARIANT_SIGNALS: &[&str] = &[
    "select[name*='size' i]",
    "select[name*='color' i]",
    "select[name*='colour' i]",
    "[data-variant]",
    "[data-option-name]",
    "fieldset[aria-label*='size' i]",
    "fieldset[aria-label*='color' i]",
    "input[type='radio'][name*='size' i]",
    "input[type='radio'][name*='color' i]",
    "[role='radiogroup'][aria-label*='size' i]",
    "[role='radiogroup'][aria-label*='color' i]",
];

/// What to do once both minimums are met before `max_pdp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinimumsPolicy {
    /// Terminate as soon as both minimums hold.
    #[default]
    Stop,
    /// Keep exploring until `max_pdp` PDPs are recorded.
    ExploreToMax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdpBudget {
    pub min_variant: usize,
    pub min_variantless: usize,
    pub max_pdp: usize,
    pub on_minimums_met: MinimumsPolicy,
}

impl Default for PdpBudget {
    fn default() -> Self {
        Self {
            min_variant: 1,
            min_variantless: 0,
            max_pdp: 2,
            on_minimums_met: MinimumsPolicy::Stop,
        }
    }
}

/// How long to let the page settle after each action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
    pub load_state: LoadState,
    pub timeout: Duration,
    /// Fixed sleep after the load-state wait, for client-side rendering.
    pub settle: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            load_state: LoadState::Load,
            timeout: Duration::from_millis(5000),
            settle: Duration::from_millis(1000),
        }
    }
}

/// Bounded retry for model transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub start_url: String,
    pub goal: String,
    pub excluded_actions: Vec<String>,
    pub model: String,
    pub budget: PdpBudget,
    pub wait: WaitPolicy,
    pub max_steps: usize,
    /// Treat model coordinates as a 0..=1000 grid.
    pub normalize_coords: bool,
    /// Ancestors collected per capture.
    pub capture_depth: usize,
    pub pdp_url_regex: String,
    pub variant_signals: Vec<String>,
    pub model_timeout: Duration,
    pub model_retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_url: String::new(),
            goal: String::new(),
            excluded_actions: Vec::new(),
            model: DEFAULT_CUA_MODEL.to_string(),
            budget: PdpBudget::default(),
            wait: WaitPolicy::default(),
            max_steps: 60,
            normalize_coords: true,
            capture_depth: 32,
            pdp_url_regex: DEFAULT_PDP_URL_REGEX.to_string(),
            variant_signals: DEFAULT_VARIANT_SIGNALS.iter().map(|s| s.to_string()).collect(),
            model_timeout: Duration::from_secs(120),
            model_retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.start_url.trim();
        if url.is_empty() {
            return Err(ConfigError::new("start_url must not be empty"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::new(format!(
                "start_url must be http(s), got '{url}'"
            )));
        }
        if self.budget.max_pdp == 0 {
            return Err(ConfigError::new("max_pdp must be >= 1"));
        }
        if self.budget.min_variant + self.budget.min_variantless > self.budget.max_pdp {
            return Err(ConfigError::new(format!(
                "min_variant ({}) + min_variantless ({}) exceeds max_pdp ({})",
                self.budget.min_variant, self.budget.min_variantless, self.budget.max_pdp
            )));
        }
        if self.max_steps == 0 {
            return Err(ConfigError::new("max_steps must be >= 1"));
        }
        if self.model_retry.max_attempts == 0 {
            return Err(ConfigError::new("model_retry.max_attempts must be >= 1"));
        }
        Regex::new(&self.pdp_url_regex)
            .map_err(|e| ConfigError::new(format!("pdp_url_regex: {e}")))?;
        Ok(())
    }

    /// Goal text used when none is given, phrased from the budget.
    pub fn default_goal(budget: &PdpBudget) -> String {
        format!(
            "Starting from the site homepage, navigate to product detail pages (PDPs). \
             Collect at least {} PDP(s) with variants and at least {} PDP(s) without variants, \
             up to a maximum of {} total PDPs. For each PDP, click the Add to Cart button, then \
             call pdp_complete. For variant PDPs, click multiple variant options to capture their \
             elements. When all PDPs are done, call finish.",
            budget.min_variant, budget.min_variantless, budget.max_pdp
        )
    }
}
