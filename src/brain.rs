use std::future::Future;

use anyhow::{Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::ModelError;
use crate::types::{
    COMPUTER_USE_ACTIONS, ModelPayload, ProposedAction, TaskContext, ToolResponse,
};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// User turns that keep their inline screenshots; older ones are stripped.
pub const SCREENSHOT_TURNS_KEPT: usize = 3;

const SYSTEM_PROMPT: &str = "You are a browser automation agent. Use the provided tools to act on the page. \
Only call supported actions. For each PDP, click the Add to Cart button, then call \
`pdp_complete` with an argument has_variants=true or false. \
Ensure you collect PDPs with and without variants according to the user's targets. \
For variant PDPs, click multiple variant options (size/color/etc.) to capture their elements. \
After all required PDPs are done, call `finish`.";

/// Request and response of one model turn, kept for local artifacts only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTrace {
    /// The request with inline image data replaced by `<omitted>`.
    pub request: Value,
    pub response: Value,
}

/// What the model answered for one step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelTurn {
    pub calls: Vec<ProposedAction>,
    /// No further actions: the model considers the task finished.
    pub done: bool,
    /// Free text (and thoughts) the model returned alongside its calls.
    pub text: Vec<String>,
    pub trace: Option<ModelTrace>,
}

impl ModelTurn {
    pub fn with_calls(calls: Vec<ProposedAction>) -> Self {
        Self {
            done: calls.is_empty(),
            calls,
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}

/// A vision-language model that proposes the next batch of actions.
///
/// Implementations own their conversation state. Each call receives only the
/// current screenshot and the previous step's tool responses.
pub trait ModelAdapter {
    fn propose_actions(
        &mut self,
        payload: ModelPayload<'_>,
        task: &TaskContext,
    ) -> impl Future<Output = Result<ModelTurn, ModelError>> + Send;
}

/// Gemini computer-use model over the `generateContent` REST endpoint.
pub struct GeminiBrain {
    client: Client,
    api_key: String,
    model: String,
    temperature: f64,
    contents: Vec<Value>,
}

impl GeminiBrain {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.2,
            contents: Vec::new(),
        }
    }

    /// Reads `GEMINI_API_KEY`, falling back to `GOOGLE_API_KEY`.
    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .map_err(|_| anyhow!("GEMINI_API_KEY (or GOOGLE_API_KEY) not set in environment"))?;
        Ok(Self::new(model, api_key))
    }

    pub fn history_len(&self) -> usize {
        self.contents.len()
    }

    fn request_body(&self, contents: &[Value], task: &TaskContext) -> Value {
        json!({
            "systemInstruction": { "parts": [{ "text": SYSTEM_PROMPT }] },
            "contents": contents,
            "tools": tools(&task.excluded_actions),
            "generationConfig": { "temperature": self.temperature },
        })
    }

    async fn send(&self, body: &Value) -> Result<Value, ModelError> {
        let url = format!("{API_BASE}/{}:generateContent", self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ModelError::Transport(e.without_url().to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or_else(|| "Unknown API error".to_string());
            warn!(status = %status, message = %message, "model API error");
            return Err(classify_status(status, message));
        }

        serde_json::from_str(&text)
            .map_err(|e| ModelError::Rejected(format!("unparseable model response: {e}")))
    }
}

impl ModelAdapter for GeminiBrain {
    fn propose_actions(
        &mut self,
        payload: ModelPayload<'_>,
        task: &TaskContext,
    ) -> impl Future<Output = Result<ModelTurn, ModelError>> + Send {
        let turn = if self.contents.is_empty() {
            initial_turn(&task.goal, payload.screenshot)
        } else {
            response_turn(payload.results, payload.screenshot)
        };

        let mut contents = self.contents.clone();
        contents.push(turn.clone());
        let body = self.request_body(&contents, task);

        async move {
            debug!(history = contents.len(), model = %self.model, "querying model");
            let response = self.send(&body).await?;
            let parsed = parse_response(&response)?;

            // History only grows once the exchange succeeded, so a retry resends the same turn.
            self.contents.push(turn);
            if let Some(content) = parsed.content {
                self.contents.push(content);
            }
            prune_screenshots(&mut self.contents, SCREENSHOT_TURNS_KEPT);

            for line in &parsed.text {
                info!(text = %line, "model said");
            }

            Ok(ModelTurn {
                done: parsed.calls.is_empty(),
                calls: parsed.calls,
                text: parsed.text,
                trace: Some(ModelTrace {
                    request: redact_inline_data(&body),
                    response,
                }),
            })
        }
    }
}

fn tools(excluded: &[String]) -> Value {
    let excluded: Vec<&str> = excluded
        .iter()
        .map(String::as_str)
        .filter(|name| COMPUTER_USE_ACTIONS.contains(name))
        .collect();
    json!([
        {
            "computerUse": {
                "environment": "ENVIRONMENT_BROWSER",
                "excludedPredefinedFunctions": excluded,
            }
        },
        {
            "functionDeclarations": [
                {
                    "name": "pdp_complete",
                    "description": "Mark that add-to-cart was clicked on the current PDP.",
                    "parameters": {
                        "type": "OBJECT",
                        "properties": {
                            "label": { "type": "STRING" },
                            "has_variants": {
                                "type": "BOOLEAN",
                                "description": "Whether this PDP has selectable variants (size/color/etc.).",
                            },
                        },
                    },
                },
                {
                    "name": "finish",
                    "description": "Signal that the task is complete.",
                },
            ]
        }
    ])
}

fn inline_png(png: &[u8]) -> Value {
    json!({ "inlineData": { "mimeType": "image/png", "data": BASE64.encode(png) } })
}

fn initial_turn(goal: &str, screenshot: &[u8]) -> Value {
    let mut parts = vec![json!({ "text": goal })];
    if !screenshot.is_empty() {
        parts.push(inline_png(screenshot));
    }
    json!({ "role": "user", "parts": parts })
}

/// One `functionResponse` per result. The screenshot rides on computer-use
/// responses; if none of them can carry it, it is sent as a bare image part.
fn response_turn(results: &[ToolResponse], screenshot: &[u8]) -> Value {
    let mut parts = Vec::with_capacity(results.len() + 1);
    let mut attached = false;
    for response in results {
        let mut body = json!({ "status": response.result.status, "url": response.result.url });
        if response.safety_acknowledged {
            body["safety_acknowledgement"] = json!("true");
        }
        let mut function_response = json!({ "name": response.name, "response": body });
        if let Some(id) = &response.call_id {
            function_response["id"] = json!(id);
        }
        if !screenshot.is_empty() && COMPUTER_USE_ACTIONS.contains(&response.name.as_str()) {
            function_response["parts"] = json!([inline_png(screenshot)]);
            attached = true;
        }
        parts.push(json!({ "functionResponse": function_response }));
    }
    if parts.is_empty() {
        parts.push(json!({ "text": "Continue with the task." }));
    }
    if !attached && !screenshot.is_empty() {
        parts.push(inline_png(screenshot));
    }
    json!({ "role": "user", "parts": parts })
}

#[derive(Debug, Default)]
struct ParsedResponse {
    calls: Vec<ProposedAction>,
    text: Vec<String>,
    content: Option<Value>,
}

fn parse_response(response: &Value) -> Result<ParsedResponse, ModelError> {
    let Some(candidates) = response.get("candidates").and_then(Value::as_array) else {
        if let Some(reason) = response["promptFeedback"]["blockReason"].as_str() {
            return Err(ModelError::Rejected(format!("prompt blocked: {reason}")));
        }
        return Ok(ParsedResponse::default());
    };
    let Some(content) = candidates.first().and_then(|c| c.get("content")) else {
        return Ok(ParsedResponse::default());
    };

    let mut parsed = ParsedResponse::default();
    for part in content["parts"].as_array().into_iter().flatten() {
        if let Some(call) = part.get("functionCall") {
            let name = call["name"].as_str().unwrap_or_default();
            if name.is_empty() {
                return Err(ModelError::Rejected("function call without a name".into()));
            }
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            let id = call["id"].as_str().map(String::from);
            parsed.calls.push(ProposedAction::from_call(name, args, id));
        } else if let Some(text) = part["text"].as_str() {
            let prefix = if part["thought"].as_bool() == Some(true) {
                "[thought] "
            } else {
                ""
            };
            parsed.text.push(format!("{prefix}{text}"));
        }
    }
    parsed.content = Some(content.clone());
    Ok(parsed)
}

fn classify_status(status: StatusCode, message: String) -> ModelError {
    let detail = format!("{status}: {message}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ModelError::Transport(detail)
    } else {
        ModelError::Rejected(detail)
    }
}

/// Copy of `value` with every `inlineData.data` replaced by `<omitted>`.
pub fn redact_inline_data(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(redact_inline_data).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, v)| {
                    let v = match (key.as_str(), v) {
                        ("inlineData" | "inline_data", Value::Object(inline)) => {
                            let mut inline = inline.clone();
                            if inline.contains_key("data") {
                                inline.insert("data".into(), json!("<omitted>"));
                            }
                            Value::Object(inline)
                        }
                        _ => redact_inline_data(v),
                    };
                    (key.clone(), v)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Drop inline images from all but the last `keep` user turns.
pub fn prune_screenshots(contents: &mut [Value], keep: usize) {
    let user_turns: Vec<usize> = contents
        .iter()
        .enumerate()
        .filter(|(_, c)| c["role"] == "user")
        .map(|(i, _)| i)
        .collect();
    let stale = user_turns.len().saturating_sub(keep);
    for &index in &user_turns[..stale] {
        let Some(parts) = contents[index]["parts"].as_array_mut() else {
            continue;
        };
        parts.retain(|part| part.get("inlineData").is_none());
        for part in parts.iter_mut() {
            if let Some(fr) = part.get_mut("functionResponse").and_then(Value::as_object_mut) {
                fr.remove("parts");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolResult;

    #[test]
    fn parses_calls_text_and_safety() {
        let response = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        { "text": "Looking for a product", "thought": true },
                        { "functionCall": { "name": "click_at", "args": { "x": 10, "y": 20 }, "id": "c1" } },
                        { "functionCall": {
                            "name": "type_text_at",
                            "args": { "x": 1, "y": 2, "text": "x", "safety_decision": { "decision": "require_confirmation" } }
                        } }
                    ]
                }
            }]
        });
        let parsed = parse_response(&response).unwrap();
        assert_eq!(parsed.text, vec!["[thought] Looking for a product"]);
        assert_eq!(parsed.calls.len(), 2);
        assert_eq!(parsed.calls[0].call_id.as_deref(), Some("c1"));
        assert!(!parsed.calls[0].require_confirmation);
        assert!(parsed.calls[1].require_confirmation);
        assert!(parsed.content.is_some());
    }

    #[test]
    fn empty_candidates_mean_no_calls() {
        let parsed = parse_response(&json!({ "candidates": [] })).unwrap();
        assert!(parsed.calls.is_empty());
        assert!(parsed.content.is_none());

        let blocked = parse_response(&json!({ "promptFeedback": { "blockReason": "SAFETY" } }));
        assert!(matches!(blocked, Err(ModelError::Rejected(_))));
    }

    #[test]
    fn status_classes() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into()).is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "oops".into()).is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "bad key".into()).is_retryable());
    }

    #[test]
    fn function_responses_carry_status_url_and_screenshot() {
        let results = vec![
            ToolResponse {
                name: "click_at".into(),
                call_id: Some("c1".into()),
                result: ToolResult::ok("https://shop.test/p/1"),
                safety_acknowledged: true,
            },
            ToolResponse {
                name: "pdp_complete".into(),
                call_id: None,
                result: ToolResult::ok("https://shop.test/p/1"),
                safety_acknowledged: false,
            },
        ];
        let turn = response_turn(&results, b"png");
        let parts = turn["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);

        let click = &parts[0]["functionResponse"];
        assert_eq!(click["id"], "c1");
        assert_eq!(
            click["response"],
            json!({ "status": "ok", "url": "https://shop.test/p/1", "safety_acknowledgement": "true" })
        );
        assert_eq!(click["parts"][0]["inlineData"]["data"], BASE64.encode(b"png"));
        assert!(parts[1]["functionResponse"].get("parts").is_none());
    }

    #[test]
    fn screenshot_falls_back_to_bare_image_part() {
        let results = vec![ToolResponse {
            name: "finish".into(),
            call_id: None,
            result: ToolResult::ok("https://shop.test/"),
            safety_acknowledged: false,
        }];
        let turn = response_turn(&results, b"png");
        assert!(turn["parts"][1].get("inlineData").is_some());
    }

    #[test]
    fn redaction_hides_image_bytes() {
        let body = json!({ "contents": [initial_turn("goal", b"secret-bytes")] });
        let redacted = redact_inline_data(&body);
        assert_eq!(redacted["contents"][0]["parts"][1]["inlineData"]["data"], "<omitted>");
        assert_eq!(redacted["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert!(!redacted.to_string().contains(&BASE64.encode(b"secret-bytes")));
    }

    #[test]
    fn pruning_keeps_only_recent_screenshots() {
        let click = |n: u8| ToolResponse {
            name: "click_at".into(),
            call_id: None,
            result: ToolResult::ok(format!("https://shop.test/{n}")),
            safety_acknowledged: false,
        };
        let mut contents = vec![initial_turn("goal", b"0")];
        for n in 1..=4u8 {
            contents.push(json!({ "role": "model", "parts": [] }));
            contents.push(response_turn(&[click(n)], &[n]));
        }
        prune_screenshots(&mut contents, 3);

        let with_images = contents
            .iter()
            .filter(|c| c.to_string().contains("inlineData"))
            .count();
        assert_eq!(with_images, 3);
        assert_eq!(contents[0]["parts"].as_array().unwrap().len(), 1);
        assert!(contents[2]["parts"][0]["functionResponse"].get("parts").is_none());
        assert!(contents[8]["parts"][0]["functionResponse"].get("parts").is_some());
    }

    #[test]
    fn excluded_actions_filter_to_predefined_functions() {
        let tools = tools(&["drag_and_drop".into(), "pdp_complete".into()]);
        assert_eq!(
            tools[0]["computerUse"]["excludedPredefinedFunctions"],
            json!(["drag_and_drop"])
        );
    }
}
