use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CaptureError;
use crate::hands::BrowserControl;
use crate::types::Point;

/// Longest element text kept in a capture.
pub const CAPTURE_TEXT_MAX_CHARS: usize = 200;

/// JavaScript evaluated in the page to resolve the element under a point.
///
/// READ-ONLY: hit-tests with `elementFromPoint` and walks `parentElement`
/// without touching attributes, styles or layout. Placeholders `__X__`, `__Y__`
/// and `__DEPTH__` are substituted before evaluation. Returns a JSON string
/// holding the node chain, target first, or `"null"` when nothing is hit.
pub const CAPTURE_JS: &str = r#"
(() => {
  const el = document.elementFromPoint(__X__, __Y__);
  if (!el) return "null";
  const maxDepth = __DEPTH__;

  function shortText(text) {
    if (!text) return "";
    const t = text.replace(/\s+/g, " ").trim();
    return t.length > 200 ? t.slice(0, 200) : t;
  }

  function nodeInfo(node) {
    const rect = node.getBoundingClientRect();
    const attributes = {};
    for (const attr of node.attributes) attributes[attr.name] = attr.value;
    let nth = 1;
    let same = 0;
    if (node.parentElement) {
      for (const sib of node.parentElement.children) {
        if (sib.tagName !== node.tagName) continue;
        same += 1;
        if (sib === node) nth = same;
      }
    } else {
      same = 1;
    }
    return {
      tag: node.tagName.toLowerCase(),
      id: node.id || null,
      classes: Array.from(node.classList || []),
      attributes,
      text: shortText(node.innerText || node.textContent || ""),
      rect: { x: rect.x, y: rect.y, width: rect.width, height: rect.height },
      nth_of_type: nth,
      same_type_count: same,
    };
  }

  const chain = [];
  let current = el;
  while (current && current.nodeType === 1 && chain.length <= maxDepth) {
    chain.push(nodeInfo(current));
    if (current === document.documentElement) break;
    current = current.parentElement;
  }
  return JSON.stringify(chain);
})()
"#;

pub fn capture_script(point: Point, max_depth: usize) -> String {
    CAPTURE_JS
        .replace("__X__", &format!("{:.2}", point.x))
        .replace("__Y__", &format!("{:.2}", point.y))
        .replace("__DEPTH__", &max_depth.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// One element as reported by the hit-test script, before structuring.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawNode {
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub rect: Rect,
    #[serde(default = "one")]
    pub nth_of_type: usize,
    #[serde(default = "one")]
    pub same_type_count: usize,
}

fn one() -> usize {
    1
}

/// The element that was hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
    pub rect: Rect,
    pub locator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AncestorSnapshot {
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub locator: String,
}

/// Local-only record of what sat under an interaction point.
///
/// Persisted with PDP records; never part of a model payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub point: Point,
    pub target: ElementSnapshot,
    /// Nearest parent first, ending at `<html>` unless the depth limit cut it.
    pub ancestors: Vec<AncestorSnapshot>,
}

/// Resolve the element at `point` and its ancestry into a [`CaptureRecord`].
///
/// `max_depth` bounds how many ancestors are collected.
pub fn capture<B: BrowserControl + ?Sized>(
    browser: &mut B,
    point: Point,
    max_depth: usize,
) -> Result<CaptureRecord, CaptureError> {
    let mut chain = browser
        .hit_test(point.x, point.y, max_depth)?
        .unwrap_or_default();
    chain.truncate(max_depth.saturating_add(1));
    build_record(point, &chain).ok_or(CaptureError::NoElementAtPoint {
        x: point.x,
        y: point.y,
    })
}

/// Structure a raw chain (target first). Returns `None` for an empty chain.
pub fn build_record(point: Point, chain: &[RawNode]) -> Option<CaptureRecord> {
    let target = chain.first()?;
    let ancestors = (1..chain.len())
        .map(|i| AncestorSnapshot {
            tag: chain[i].tag.clone(),
            attributes: chain[i].attributes.clone(),
            locator: locator(chain, i),
        })
        .collect();

    Some(CaptureRecord {
        point,
        target: ElementSnapshot {
            tag: target.tag.clone(),
            id: target.id.clone().filter(|id| !id.is_empty()),
            classes: target.classes.clone(),
            text: normalize_text(&target.text),
            attributes: target.attributes.clone(),
            rect: target.rect,
            locator: locator(chain, 0),
        },
        ancestors,
    })
}

/// Stable locator for `chain[index]`: its id if it has one, otherwise a child
/// path anchored at the nearest ancestor with an id (or the top of the chain),
/// with `:nth-of-type` wherever siblings share a tag.
pub fn locator(chain: &[RawNode], index: usize) -> String {
    if let Some(anchor) = chain.get(index).and_then(id_selector) {
        return anchor;
    }

    let mut segments = Vec::new();
    for node in &chain[index..] {
        if let Some(anchor) = id_selector(node) {
            segments.push(anchor);
            break;
        }
        segments.push(segment(node));
    }
    segments.reverse();
    segments.join(" > ")
}

fn id_selector(node: &RawNode) -> Option<String> {
    let id = node.id.as_deref().filter(|id| !id.is_empty())?;
    if is_css_ident(id) {
        Some(format!("#{id}"))
    } else {
        Some(format!("[id=\"{}\"]", id.replace('"', "\\\"")))
    }
}

fn segment(node: &RawNode) -> String {
    let mut out = node.tag.clone();
    for class in node.classes.iter().filter(|c| is_css_ident(c)).take(3) {
        out.push('.');
        out.push_str(class);
    }
    if node.same_type_count > 1 {
        out.push_str(&format!(":nth-of-type({})", node.nth_of_type));
    }
    out
}

fn is_css_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn normalize_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(CAPTURE_TEXT_MAX_CHARS).collect()
}
