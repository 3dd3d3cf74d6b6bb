//! Built-in local tools and the canonical registry builder.
//!
//! Only the tools with no external backend live here (`time.now`,
//! `system.status`); calendar, gmail, and contacts capabilities are
//! supplied by the embedding application as tool functions and wired in
//! through [`RegistryBuilder`]. Schemas keep `additionalProperties` open
//! because the router passes common slots through to any tool.

use serde_json::{json, Value};

use super::registry::{Tool, ToolFunction, ToolRegistry};

fn common_slot_props() -> Value {
    json!({
        "date": {},
        "time": {},
        "duration": {},
        "title": {},
        "window_hint": {}
    })
}

fn object_schema(properties: Value) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": [],
        "additionalProperties": true
    })
}

/// `time.now` — current local time/date.
pub fn time_now_tool() -> Tool {
    Tool::new(
        "time.now",
        "Time: current local time/date (timezone-aware)",
        object_schema(json!({})),
        |_args| async {
            let now = chrono::Local::now();
            Ok(json!({
                "ok": true,
                "iso": now.to_rfc3339(),
                "time": now.format("%H:%M").to_string(),
                "date": now.format("%Y-%m-%d").to_string(),
                "weekday": now.format("%A").to_string(),
            }))
        },
    )
}

/// `system.status` — best-effort host health snapshot.
pub fn system_status_tool() -> Tool {
    Tool::new(
        "system.status",
        "System health: loadavg, CPU count, memory usage (best-effort)",
        object_schema(json!({"include_env": {"type": "boolean"}})),
        |_args| async {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            let loadavg = std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|s| s.split_whitespace().next().map(str::to_string));
            Ok(json!({
                "ok": true,
                "cpus": cpus,
                "loadavg_1m": loadavg,
                "os": std::env::consts::OS,
            }))
        },
    )
}

/// Assembles the runtime tool surface: built-in local tools plus the
/// externally supplied calendar/gmail/contacts functions.
#[derive(Default)]
pub struct RegistryBuilder {
    external: Vec<Tool>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only calendar listing backed by the given function.
    pub fn calendar_list_events(mut self, f: ToolFunction) -> Self {
        self.external.push(Tool {
            name: "calendar.list_events".to_string(),
            description: "Google Calendar: list upcoming events (read-only)".to_string(),
            parameters: object_schema(json!({
                "date": {"type": "string"},
                "time": {"type": "string"},
                "window_hint": {"type": "string"},
                "max_results": {"type": "integer"},
                "query": {"type": "string"}
            })),
            function: f,
            requires_confirmation: false,
        });
        self
    }

    /// Calendar event creation; always confirmation-gated.
    pub fn calendar_create_event(mut self, f: ToolFunction) -> Self {
        self.external.push(Tool {
            name: "calendar.create_event".to_string(),
            description: "Google Calendar: create an event (write). Requires confirmation."
                .to_string(),
            parameters: object_schema(common_slot_props()),
            function: f,
            requires_confirmation: true,
        });
        self
    }

    /// Gmail inbox listing.
    pub fn gmail_list_messages(mut self, f: ToolFunction) -> Self {
        self.external.push(Tool {
            name: "gmail.list_messages".to_string(),
            description:
                "Gmail: list inbox messages with optional search query and label filtering (read-only)"
                    .to_string(),
            parameters: object_schema(json!({
                "max_results": {"type": "integer"},
                "unread_only": {"type": "boolean"},
                "query": {"type": "string"},
                "category": {"type": "string"},
                "label": {"type": "string"}
            })),
            function: f,
            requires_confirmation: false,
        });
        self
    }

    /// Gmail send; always confirmation-gated.
    pub fn gmail_send(mut self, f: ToolFunction) -> Self {
        self.external.push(Tool {
            name: "gmail.send".to_string(),
            description: "Gmail: send an email (write). Requires confirmation.".to_string(),
            parameters: object_schema(json!({
                "to": {"type": "string"},
                "subject": {"type": "string"},
                "body": {"type": "string"},
                "cc": {"type": "string"},
                "bcc": {"type": "string"}
            })),
            function: f,
            requires_confirmation: true,
        });
        self
    }

    /// Any additional tool under the caller's own name/schema.
    pub fn tool(mut self, tool: Tool) -> Self {
        self.external.push(tool);
        self
    }

    /// Build the registry: built-ins first, then external tools in the
    /// order they were added.
    pub fn build(self) -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry.register(time_now_tool());
        registry.register(system_status_tool());
        for tool in self.external {
            registry.register(tool);
        }
        registry
    }
}
