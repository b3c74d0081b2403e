//! Authored extraction rules, as produced by the authoring step for a run.
//!
//! A rules file is either the bare rule object or the authoring envelope
//! `{"version", "created_at", "model", "rules": {...}}`. Missing, `null` and
//! blank fields all mean "not authored".

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const RULES_FILE_NAME: &str = "rules.json";

fn nullable<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn authored(field: &str) -> Option<&str> {
    let field = field.trim();
    (!field.is_empty()).then_some(field)
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    #[serde(deserialize_with = "nullable")]
    pub pdp_url_regex: String,
    #[serde(deserialize_with = "nullable")]
    pub pdp_url_reason: String,
    #[serde(deserialize_with = "nullable")]
    pub add_to_cart_selector: String,
    #[serde(deserialize_with = "nullable")]
    pub add_to_cart_selector_reason: String,
    /// JS expression over `el` (the add-to-cart element), truthy when clickable.
    #[serde(deserialize_with = "nullable")]
    pub clickable_js: String,
    #[serde(deserialize_with = "nullable")]
    pub clickable_js_reason: String,
    /// Free-text proposal for post-add-to-cart assertions. Not evaluated.
    #[serde(deserialize_with = "nullable")]
    pub assertion_proposal: String,
    #[serde(deserialize_with = "nullable")]
    pub assertion_proposal_reason: String,
    pub variant_extraction: VariantExtraction,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantExtraction {
    pub groups: Vec<VariantGroup>,
}

/// One option group (size, color, ...). The other selectors are relative to
/// each element matched by `variant_selector`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantGroup {
    #[serde(deserialize_with = "nullable")]
    pub group_type: String,
    #[serde(deserialize_with = "nullable")]
    pub group_reason: String,
    #[serde(deserialize_with = "nullable")]
    pub variant_selector: String,
    #[serde(deserialize_with = "nullable")]
    pub variant_selector_reason: String,
    #[serde(deserialize_with = "nullable")]
    pub variant_text_selector: String,
    #[serde(deserialize_with = "nullable")]
    pub variant_text_selector_reason: String,
    #[serde(deserialize_with = "nullable")]
    pub variant_image_selector: String,
    #[serde(deserialize_with = "nullable")]
    pub variant_image_selector_reason: String,
    #[serde(deserialize_with = "nullable")]
    pub variant_availability_selector: String,
    #[serde(deserialize_with = "nullable")]
    pub variant_availability_selector_reason: String,
}

impl RuleSet {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let mut value: Value = serde_json::from_str(text)?;
        let rules = if value.get("rules").is_some_and(Value::is_object) {
            value["rules"].take()
        } else {
            value
        };
        serde_json::from_value(rules)
    }

    /// Load from a rules file, or from `rules.json` inside a run directory.
    pub fn load(path: &Path) -> Result<Self> {
        let path = locate(path);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading rules from {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn pdp_url_regex(&self) -> Option<&str> {
        authored(&self.pdp_url_regex)
    }

    pub fn add_to_cart_selector(&self) -> Option<&str> {
        authored(&self.add_to_cart_selector)
    }

    pub fn clickable_js(&self) -> Option<&str> {
        authored(&self.clickable_js)
    }
}

impl VariantGroup {
    pub fn variant_selector(&self) -> Option<&str> {
        authored(&self.variant_selector)
    }

    pub fn text_selector(&self) -> Option<&str> {
        authored(&self.variant_text_selector)
    }

    pub fn image_selector(&self) -> Option<&str> {
        authored(&self.variant_image_selector)
    }

    pub fn availability_selector(&self) -> Option<&str> {
        authored(&self.variant_availability_selector)
    }
}

fn locate(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(RULES_FILE_NAME)
    } else {
        path.to_path_buf()
    }
}
