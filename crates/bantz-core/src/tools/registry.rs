//! Tool registry and the tool execution envelope.
//!
//! A tool is invoked with a keyword-style JSON argument map and returns an
//! `{ok: bool, ...}` envelope value. The kernel reifies every invocation
//! into a [`ToolExecution`] — timeouts, open circuits, and safety
//! rejections included — so failures flow to the finalizer instead of
//! aborting the turn.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use futures::Future;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boxed future returned by a tool function.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// A tool implementation: async fn(args) → result envelope.
pub type ToolFunction = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// A named capability with a parameter schema and a callable implementation.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON schema for the keyword argument map.
    pub parameters: Value,
    pub function: ToolFunction,
    /// Write tools that must pass the confirmation gate before running.
    pub requires_confirmation: bool,
}

impl Tool {
    pub fn new<F, Fut>(name: &str, description: &str, parameters: Value, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            function: Arc::new(move |args| Box::pin(f(args))),
            requires_confirmation: false,
        }
    }

    pub fn with_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("requires_confirmation", &self.requires_confirmation)
            .finish_non_exhaustive()
    }
}

// ── Execution envelope ─────────────────────────────────────────────────

/// Outcome of one tool invocation, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutcome {
    Ok { result: Value },
    Error { error: String },
    Timeout { error: String },
    CircuitOpen { error: String },
    SafetyRejected { reason: String },
}

/// One tool invocation, stamped with its originating turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub tool: String,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
    pub elapsed_ms: f64,
    #[serde(default)]
    pub retried: bool,
    #[serde(default)]
    pub turn_id: String,
    /// Position of this step in the plan (arrival order may differ when a
    /// parallel scheduler is used).
    #[serde(default)]
    pub step_index: usize,
}

impl ToolExecution {
    pub fn ok(tool: &str, result: Value, elapsed_ms: f64) -> Self {
        Self {
            tool: tool.to_string(),
            outcome: ToolOutcome::Ok { result },
            elapsed_ms,
            retried: false,
            turn_id: String::new(),
            step_index: 0,
        }
    }

    pub fn error(tool: &str, error: impl Into<String>, elapsed_ms: f64) -> Self {
        Self {
            tool: tool.to_string(),
            outcome: ToolOutcome::Error { error: error.into() },
            elapsed_ms,
            retried: false,
            turn_id: String::new(),
            step_index: 0,
        }
    }

    pub fn safety_rejected(tool: &str, reason: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            outcome: ToolOutcome::SafetyRejected { reason: reason.into() },
            elapsed_ms: 0.0,
            retried: false,
            turn_id: String::new(),
            step_index: 0,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Ok { .. })
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Timeout { .. })
    }

    pub fn circuit_open(&self) -> bool {
        matches!(self.outcome, ToolOutcome::CircuitOpen { .. })
    }

    pub fn is_safety_rejected(&self) -> bool {
        if matches!(self.outcome, ToolOutcome::SafetyRejected { .. }) {
            return true;
        }
        // Envelope flags and error text count too, so a changed rejection
        // format cannot silently bypass the verifier.
        if let ToolOutcome::Ok { result } = &self.outcome {
            if result.get("safety_rejected").and_then(Value::as_bool) == Some(true)
                || result.get("blocked").and_then(Value::as_bool) == Some(true)
            {
                return true;
            }
        }
        let text = self.error_text().to_lowercase();
        text.contains("safety") || text.contains("blocked")
    }

    pub fn error_text(&self) -> &str {
        match &self.outcome {
            ToolOutcome::Ok { .. } => "",
            ToolOutcome::Error { error }
            | ToolOutcome::Timeout { error }
            | ToolOutcome::CircuitOpen { error } => error,
            ToolOutcome::SafetyRejected { reason } => reason,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            ToolOutcome::Ok { result } => Some(result),
            _ => None,
        }
    }

    /// Empty success: null result, empty string, zero-length list/map, or an
    /// `{ok: true}` envelope whose payload lists/maps are all empty.
    pub fn is_empty(&self) -> bool {
        let Some(result) = self.result() else {
            return false;
        };
        match result {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(map) => {
                let payload: Vec<&Value> = map
                    .iter()
                    .filter(|(k, _)| *k != "ok" && *k != "display_hint")
                    .map(|(_, v)| v)
                    .collect();
                !payload.is_empty()
                    && payload.iter().all(|v| match v {
                        Value::Array(a) => a.is_empty(),
                        Value::Object(m) => m.is_empty(),
                        Value::Null => true,
                        _ => false,
                    })
            }
            _ => false,
        }
    }
}

// ── Registry ───────────────────────────────────────────────────────────

struct RegistryInner {
    /// Insertion order preserved; duplicate registration overwrites in place.
    order: Vec<String>,
    tools: HashMap<String, Arc<Tool>>,
}

/// Insertion-ordered tool table. Share via `Arc`.
pub struct ToolRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                order: Vec::new(),
                tools: HashMap::new(),
            }),
        }
    }

    pub fn register(&self, tool: Tool) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let name = tool.name.clone();
        if inner.tools.insert(name.clone(), Arc::new(tool)).is_none() {
            inner.order.push(name);
        } else {
            tracing::debug!(tool = %name, "tool re-registered, overwriting");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .tools
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .tools
            .contains_key(name)
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().expect("registry lock poisoned").order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.get(name).map(|t| t.requires_confirmation).unwrap_or(false)
    }
}
