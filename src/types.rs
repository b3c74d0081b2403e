use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ActionParseError;

/// Actions the computer-use tool can emit on its own.
pub const COMPUTER_USE_ACTIONS: &[&str] = &[
    "open_web_browser",
    "wait_5_seconds",
    "go_back",
    "go_forward",
    "search",
    "navigate",
    "click_at",
    "hover_at",
    "type_text_at",
    "key_combination",
    "scroll_document",
    "scroll_at",
    "drag_and_drop",
    "scroll",
];

/// Function declarations we add on top of the computer-use tool.
pub const CUSTOM_ACTIONS: &[&str] = &["pdp_complete", "finish"];

/// Side of the square grid the model uses for coordinates when normalisation is on.
pub const NORMALIZED_GRID: f64 = 1000.0;

pub const DEFAULT_SCROLL_MAGNITUDE: f64 = 800.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1440,
            height: 900,
        }
    }
}

impl Viewport {
    /// Map a point from the model's 0..=1000 grid into viewport pixels.
    ///
    /// Points outside the grid are assumed to already be pixels.
    pub fn resolve(&self, point: Point, normalize: bool) -> ResolvedPoint {
        let in_grid = (0.0..=NORMALIZED_GRID).contains(&point.x)
            && (0.0..=NORMALIZED_GRID).contains(&point.y);
        if normalize && in_grid {
            ResolvedPoint {
                raw: point,
                resolved: Point::new(
                    point.x / NORMALIZED_GRID * f64::from(self.width),
                    point.y / NORMALIZED_GRID * f64::from(self.height),
                ),
                normalized: true,
            }
        } else {
            ResolvedPoint {
                raw: point,
                resolved: point,
                normalized: false,
            }
        }
    }

    fn resolve_magnitude(&self, direction: ScrollDirection, magnitude: f64, normalize: bool) -> f64 {
        if !normalize || !(0.0..=NORMALIZED_GRID).contains(&magnitude) {
            return magnitude;
        }
        let extent = match direction {
            ScrollDirection::Left | ScrollDirection::Right => self.width,
            ScrollDirection::Up | ScrollDirection::Down => self.height,
        };
        magnitude / NORMALIZED_GRID * f64::from(extent)
    }
}

/// A model coordinate together with the pixel position it was executed at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPoint {
    pub raw: Point,
    pub resolved: Point,
    pub normalized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("up") => ScrollDirection::Up,
            Some("left") => ScrollDirection::Left,
            Some("right") => ScrollDirection::Right,
            _ => ScrollDirection::Down,
        }
    }

    /// Wheel delta `(dx, dy)` for a scroll of `magnitude` pixels.
    pub fn delta(self, magnitude: f64) -> (f64, f64) {
        match self {
            ScrollDirection::Up => (0.0, -magnitude),
            ScrollDirection::Down => (0.0, magnitude),
            ScrollDirection::Left => (-magnitude, 0.0),
            ScrollDirection::Right => (magnitude, 0.0),
        }
    }
}

/// One primitive operation the agent can perform.
///
/// Each variant carries only what its kind needs. Adding a variant forces every
/// `match` over actions (the executor included) to handle it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    OpenWebBrowser,
    #[serde(rename = "wait_5_seconds")]
    Wait5Seconds,
    GoBack,
    GoForward,
    Search {
        query: String,
    },
    Navigate {
        url: String,
    },
    ClickAt {
        x: f64,
        y: f64,
    },
    HoverAt {
        x: f64,
        y: f64,
    },
    TypeTextAt {
        x: f64,
        y: f64,
        text: String,
        press_enter: bool,
        clear_before_typing: bool,
    },
    KeyCombination {
        keys: String,
    },
    ScrollDocument {
        direction: ScrollDirection,
        magnitude: f64,
    },
    ScrollAt {
        x: f64,
        y: f64,
        direction: ScrollDirection,
        magnitude: f64,
    },
    DragAndDrop {
        x: f64,
        y: f64,
        destination_x: f64,
        destination_y: f64,
    },
    Scroll {
        dx: f64,
        dy: f64,
    },
    PdpComplete {
        label: Option<String>,
        has_variants: bool,
    },
    Finish,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::OpenWebBrowser => "open_web_browser",
            Action::Wait5Seconds => "wait_5_seconds",
            Action::GoBack => "go_back",
            Action::GoForward => "go_forward",
            Action::Search { .. } => "search",
            Action::Navigate { .. } => "navigate",
            Action::ClickAt { .. } => "click_at",
            Action::HoverAt { .. } => "hover_at",
            Action::TypeTextAt { .. } => "type_text_at",
            Action::KeyCombination { .. } => "key_combination",
            Action::ScrollDocument { .. } => "scroll_document",
            Action::ScrollAt { .. } => "scroll_at",
            Action::DragAndDrop { .. } => "drag_and_drop",
            Action::Scroll { .. } => "scroll",
            Action::PdpComplete { .. } => "pdp_complete",
            Action::Finish => "finish",
        }
    }

    /// Where a click-class action lands. Element Capture runs here.
    pub fn interaction_point(&self) -> Option<Point> {
        match self {
            Action::ClickAt { x, y } | Action::TypeTextAt { x, y, .. } => Some(Point::new(*x, *y)),
            _ => None,
        }
    }

    /// Rewrite model coordinates into viewport pixels.
    pub fn resolve(&self, viewport: &Viewport, normalize: bool) -> Action {
        let at = |x: f64, y: f64| viewport.resolve(Point::new(x, y), normalize).resolved;
        match self.clone() {
            Action::ClickAt { x, y } => {
                let p = at(x, y);
                Action::ClickAt { x: p.x, y: p.y }
            }
            Action::HoverAt { x, y } => {
                let p = at(x, y);
                Action::HoverAt { x: p.x, y: p.y }
            }
            Action::TypeTextAt {
                x,
                y,
                text,
                press_enter,
                clear_before_typing,
            } => {
                let p = at(x, y);
                Action::TypeTextAt {
                    x: p.x,
                    y: p.y,
                    text,
                    press_enter,
                    clear_before_typing,
                }
            }
            Action::ScrollDocument {
                direction,
                magnitude,
            } => Action::ScrollDocument {
                direction,
                magnitude: viewport.resolve_magnitude(direction, magnitude, normalize),
            },
            Action::ScrollAt {
                x,
                y,
                direction,
                magnitude,
            } => {
                let p = at(x, y);
                Action::ScrollAt {
                    x: p.x,
                    y: p.y,
                    direction,
                    magnitude: viewport.resolve_magnitude(direction, magnitude, normalize),
                }
            }
            Action::DragAndDrop {
                x,
                y,
                destination_x,
                destination_y,
            } => {
                let from = at(x, y);
                let to = at(destination_x, destination_y);
                Action::DragAndDrop {
                    x: from.x,
                    y: from.y,
                    destination_x: to.x,
                    destination_y: to.y,
                }
            }
            other => other,
        }
    }

    /// Build an action from a model function call.
    pub fn from_call(name: &str, args: &Value) -> Result<Action, ActionParseError> {
        let num = |key: &'static str| -> Result<f64, ActionParseError> {
            match args.get(key) {
                None | Some(Value::Null) => Err(ActionParseError::MissingArgument {
                    action: name.to_string(),
                    argument: key,
                }),
                Some(v) => v.as_f64().ok_or_else(|| ActionParseError::InvalidArgument {
                    action: name.to_string(),
                    argument: key,
                }),
            }
        };
        let text = |key: &'static str| args.get(key).and_then(Value::as_str).map(String::from);
        let flag = |key: &'static str, default: bool| {
            args.get(key).and_then(Value::as_bool).unwrap_or(default)
        };
        let magnitude = || {
            args.get("magnitude")
                .and_then(Value::as_f64)
                .unwrap_or(DEFAULT_SCROLL_MAGNITUDE)
        };
        let direction = || ScrollDirection::parse(args.get("direction").and_then(Value::as_str));

        let action = match name {
            "open_web_browser" => Action::OpenWebBrowser,
            "wait_5_seconds" => Action::Wait5Seconds,
            "go_back" => Action::GoBack,
            "go_forward" => Action::GoForward,
            "search" => Action::Search {
                query: text("query").unwrap_or_default(),
            },
            "navigate" => Action::Navigate {
                url: text("url").ok_or_else(|| ActionParseError::MissingArgument {
                    action: name.to_string(),
                    argument: "url",
                })?,
            },
            "click_at" => Action::ClickAt {
                x: num("x")?,
                y: num("y")?,
            },
            "hover_at" => Action::HoverAt {
                x: num("x")?,
                y: num("y")?,
            },
            "type_text_at" => Action::TypeTextAt {
                x: num("x")?,
                y: num("y")?,
                text: text("text").unwrap_or_default(),
                press_enter: flag("press_enter", true),
                clear_before_typing: flag("clear_before_typing", true),
            },
            "key_combination" => Action::KeyCombination {
                keys: text("keys").unwrap_or_default(),
            },
            "scroll_document" => Action::ScrollDocument {
                direction: direction(),
                magnitude: magnitude(),
            },
            "scroll_at" => Action::ScrollAt {
                x: num("x")?,
                y: num("y")?,
                direction: direction(),
                magnitude: magnitude(),
            },
            "drag_and_drop" => Action::DragAndDrop {
                x: num("x")?,
                y: num("y")?,
                destination_x: num("destination_x")?,
                destination_y: num("destination_y")?,
            },
            "scroll" => Action::Scroll {
                dx: args.get("dx").and_then(Value::as_f64).unwrap_or(0.0),
                dy: args.get("dy").and_then(Value::as_f64).unwrap_or(0.0),
            },
            "pdp_complete" => Action::PdpComplete {
                label: text("label"),
                has_variants: flag("has_variants", false),
            },
            "finish" => Action::Finish,
            other => return Err(ActionParseError::Unsupported(other.to_string())),
        };
        Ok(action)
    }
}

/// A function call exactly as the model proposed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub call_id: Option<String>,
    pub name: String,
    pub args: Value,
    pub require_confirmation: bool,
}

impl ProposedAction {
    /// Wrap a raw call, lifting the model's `safety_decision` into the confirmation flag.
    pub fn from_call(name: impl Into<String>, args: Value, call_id: Option<String>) -> Self {
        let decision = match args.get("safety_decision") {
            Some(Value::String(s)) => Some(s.as_str()),
            Some(Value::Object(map)) => map.get("decision").and_then(Value::as_str),
            _ => None,
        };
        let require_confirmation = decision == Some("require_confirmation");
        Self {
            call_id,
            name: name.into(),
            args,
            require_confirmation,
        }
    }

    pub fn action(&self) -> Result<Action, ActionParseError> {
        Action::from_call(&self.name, &self.args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
    /// The operator refused a confirmation gate. Not an error.
    Declined,
}

/// The only execution feedback the model ever sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    pub url: String,
}

impl ToolResult {
    pub fn ok(url: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Ok,
            url: url.into(),
        }
    }

    pub fn error(url: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            url: url.into(),
        }
    }

    pub fn declined(url: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Declined,
            url: url.into(),
        }
    }
}

/// A [`ToolResult`] addressed to the call that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub name: String,
    pub call_id: Option<String>,
    pub result: ToolResult,
    /// The operator approved a call the model flagged for confirmation.
    #[serde(default)]
    pub safety_acknowledged: bool,
}

/// Everything the model receives for one step.
///
/// Built only from the current screenshot and the previous step's
/// [`ToolResponse`]s. Local capture types are not reachable from here.
#[derive(Debug, Clone, Copy)]
pub struct ModelPayload<'a> {
    pub screenshot: &'a [u8],
    pub results: &'a [ToolResponse],
}

/// Static context of a run, identical on every model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    pub goal: String,
    pub excluded_actions: Vec<String>,
}
