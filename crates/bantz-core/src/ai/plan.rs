//! The plan JSON envelope emitted by the router.
//!
//! Parsing is lenient where the model is sloppy: tool plan entries may be
//! plain strings or `{name|tool|tool_name, args}` objects, out-of-range
//! confidence is clamped, and missing fields default conservatively
//! (route `unknown`, intent `none`, confidence 0.3). Unknown fields are
//! ignored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BrainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Calendar,
    Gmail,
    System,
    Smalltalk,
    Unknown,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Calendar => "calendar",
            Route::Gmail => "gmail",
            Route::System => "system",
            Route::Smalltalk => "smalltalk",
            Route::Unknown => "unknown",
        }
    }

    /// Lenient: anything unrecognized is `Unknown`.
    pub fn parse(text: &str) -> Self {
        match text {
            "calendar" => Route::Calendar,
            "gmail" => Route::Gmail,
            "system" => Route::System,
            "smalltalk" => Route::Smalltalk,
            _ => Route::Unknown,
        }
    }
}

/// One planned tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStep {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Structured router output for one turn.
#[derive(Debug, Clone, Serialize)]
pub struct RouterPlan {
    pub route: Route,
    pub calendar_intent: String,
    pub gmail_intent: String,
    pub slots: Map<String, Value>,
    pub confidence: f64,
    /// Tool names in plan order. Derived; the serialized envelope carries
    /// the with-args form under `tool_plan`.
    #[serde(skip_serializing)]
    pub tool_plan: Vec<String>,
    /// Same order, with per-step args.
    #[serde(rename = "tool_plan")]
    pub tool_plan_with_args: Vec<ToolStep>,
    pub assistant_reply: String,
    pub ask_user: bool,
    pub question: String,
    pub requires_confirmation: bool,
    pub confirmation_prompt: String,
    pub memory_update: Option<String>,
    pub reasoning_summary: Option<String>,
}

impl Default for RouterPlan {
    fn default() -> Self {
        Self {
            route: Route::Unknown,
            calendar_intent: "none".to_string(),
            gmail_intent: "none".to_string(),
            slots: Map::new(),
            confidence: 0.3,
            tool_plan: Vec::new(),
            tool_plan_with_args: Vec::new(),
            assistant_reply: String::new(),
            ask_user: false,
            question: String::new(),
            requires_confirmation: false,
            confirmation_prompt: String::new(),
            memory_update: None,
            reasoning_summary: None,
        }
    }
}

impl RouterPlan {
    pub fn has_tools(&self) -> bool {
        !self.tool_plan.is_empty()
    }

    /// Drop planned tools (used when validation downgrades the plan).
    pub fn strip_tools(&mut self) {
        self.tool_plan.clear();
        self.tool_plan_with_args.clear();
    }
}

/// Pull the first JSON object out of the model output, tolerating prose
/// and markdown fences around it.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn step_name(entry: &Value) -> Option<String> {
    match entry {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => ["name", "tool", "tool_name"]
            .iter()
            .find_map(|k| map.get(*k))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn step_args(entry: &Value) -> Value {
    match entry {
        Value::Object(map) => map.get("args").cloned().unwrap_or_else(|| Value::Object(Map::new())),
        _ => Value::Object(Map::new()),
    }
}

/// Parse the router's raw text into a [`RouterPlan`].
pub fn parse_plan(raw: &str) -> Result<RouterPlan, BrainError> {
    let body = extract_json_object(raw)
        .ok_or_else(|| BrainError::InvalidInput("router output contains no JSON object".into()))?;
    let value: Value = serde_json::from_str(body)
        .map_err(|e| BrainError::InvalidInput(format!("router JSON parse error: {e}")))?;
    let Value::Object(map) = value else {
        return Err(BrainError::InvalidInput("router output is not a JSON object".into()));
    };

    let mut plan = RouterPlan::default();

    if let Some(route) = map.get("route").and_then(Value::as_str) {
        plan.route = Route::parse(route);
    }
    if let Some(intent) = map.get("calendar_intent").and_then(Value::as_str) {
        if !intent.is_empty() {
            plan.calendar_intent = intent.to_string();
        }
    }
    if let Some(intent) = map.get("gmail_intent").and_then(Value::as_str) {
        if !intent.is_empty() {
            plan.gmail_intent = intent.to_string();
        }
    }
    if let Some(Value::Object(slots)) = map.get("slots") {
        plan.slots = slots.clone();
    }
    if let Some(confidence) = map.get("confidence").and_then(Value::as_f64) {
        plan.confidence = confidence.clamp(0.0, 1.0);
    }

    if let Some(Value::Array(entries)) = map.get("tool_plan") {
        for entry in entries {
            let Some(name) = step_name(entry) else {
                tracing::warn!(?entry, "dropping tool plan entry without a name");
                continue;
            };
            plan.tool_plan.push(name.clone());
            plan.tool_plan_with_args.push(ToolStep {
                name,
                args: step_args(entry),
            });
        }
    }

    if let Some(reply) = map.get("assistant_reply").and_then(Value::as_str) {
        plan.assistant_reply = reply.to_string();
    }
    plan.ask_user = map.get("ask_user").and_then(Value::as_bool).unwrap_or(false);
    if let Some(q) = map.get("question").and_then(Value::as_str) {
        plan.question = q.to_string();
    }
    plan.requires_confirmation = map
        .get("requires_confirmation")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if let Some(p) = map.get("confirmation_prompt").and_then(Value::as_str) {
        plan.confirmation_prompt = p.to_string();
    }
    plan.memory_update = map
        .get("memory_update")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    plan.reasoning_summary = map
        .get("reasoning_summary")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(plan)
}
