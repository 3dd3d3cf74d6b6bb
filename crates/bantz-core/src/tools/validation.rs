//! Registry validation: mandatory tools, route dependencies, health.
//!
//! A missing mandatory tool is an error (report not ok); a missing route
//! dependency only degrades that route and produces a warning.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use super::registry::ToolRegistry;

/// Tools every runtime must register.
pub const MANDATORY_TOOLS: &[&str] = &[
    "time.now",
    "calendar.list_events",
    "gmail.list_messages",
    "system.status",
];

/// Route → tools that route's intents depend on.
pub fn route_tool_dependencies() -> HashMap<&'static str, Vec<&'static str>> {
    HashMap::from([
        (
            "calendar",
            vec![
                "calendar.list_events",
                "calendar.create_event",
                "calendar.find_free_slots",
            ],
        ),
        (
            "gmail",
            vec![
                "gmail.list_messages",
                "gmail.get_message",
                "gmail.send",
                "gmail.unread_count",
                "gmail.smart_search",
            ],
        ),
        ("system", vec!["system.status", "time.now"]),
        ("browser", vec!["browser.open", "browser.search"]),
    ])
}

/// Reverse index: tool → routes that depend on it.
pub fn tool_route_map() -> HashMap<&'static str, Vec<&'static str>> {
    let mut map: HashMap<&'static str, Vec<&'static str>> = HashMap::new();
    for (route, tools) in route_tool_dependencies() {
        for tool in tools {
            map.entry(tool).or_default().push(route);
        }
    }
    map
}

/// Validation policy. Defaults match the documented tool surface; both
/// sets are deployment-configurable.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub mandatory_tools: Vec<String>,
    pub route_dependencies: HashMap<String, Vec<String>>,
    /// Per-tool probe budget when health checks run.
    pub health_timeout: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            mandatory_tools: MANDATORY_TOOLS.iter().map(|s| s.to_string()).collect(),
            route_dependencies: route_tool_dependencies()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into_iter().map(str::to_string).collect()))
                .collect(),
            health_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub missing_mandatory: Vec<String>,
    /// route → missing tools for that route.
    pub missing_route_deps: HashMap<String, Vec<String>>,
    pub registered_tools: Vec<String>,
    /// tool → probe passed.
    pub health_results: HashMap<String, bool>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Ok iff no mandatory tool is missing.
    pub fn ok(&self) -> bool {
        self.missing_mandatory.is_empty()
    }

    /// Healthy iff every executed health probe passed.
    pub fn healthy(&self) -> bool {
        self.health_results.values().all(|ok| *ok)
    }
}

pub struct RegistryValidator {
    config: ValidationConfig,
}

impl Default for RegistryValidator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

impl RegistryValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Static validation: mandatory set and route dependencies.
    pub fn validate(&self, registry: &ToolRegistry) -> ValidationReport {
        let mut report = ValidationReport {
            registered_tools: registry.names(),
            ..Default::default()
        };

        for tool in &self.config.mandatory_tools {
            if !registry.contains(tool) {
                report.missing_mandatory.push(tool.clone());
                report.errors.push(format!("missing mandatory tool: {tool}"));
            }
        }

        for (route, deps) in &self.config.route_dependencies {
            let missing: Vec<String> = deps
                .iter()
                .filter(|t| !registry.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                report.warnings.push(format!(
                    "route '{route}' degraded, missing tools: {}",
                    missing.join(", ")
                ));
                report.missing_route_deps.insert(route.clone(), missing);
            }
        }

        if !report.ok() {
            tracing::error!(missing = ?report.missing_mandatory, "registry validation failed");
        } else if !report.warnings.is_empty() {
            tracing::warn!(warnings = report.warnings.len(), "registry validation warnings");
        }

        report
    }

    /// Static validation plus a live probe of every mandatory tool: call
    /// with empty args under the health budget, pass when an envelope
    /// comes back at all.
    pub async fn validate_with_health(&self, registry: &ToolRegistry) -> ValidationReport {
        let mut report = self.validate(registry);

        for tool_name in &self.config.mandatory_tools {
            let Some(tool) = registry.get(tool_name) else {
                continue;
            };
            let probe = (tool.function)(json!({}));
            let passed = matches!(
                tokio::time::timeout(self.config.health_timeout, probe).await,
                Ok(Ok(_))
            );
            if !passed {
                report.warnings.push(format!("health check failed: {tool_name}"));
            }
            report.health_results.insert(tool_name.clone(), passed);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::Tool;
    use anyhow::anyhow;

    fn make_registry(names: &[&str]) -> ToolRegistry {
        let reg = ToolRegistry::new();
        for name in names {
            reg.register(Tool::new(name, "stub", json!({"type": "object"}), |_| async {
                Ok(json!({"ok": true}))
            }));
        }
        reg
    }

    #[test]
    fn full_registry_is_ok() {
        let reg = make_registry(&[
            "time.now",
            "calendar.list_events",
            "gmail.list_messages",
            "system.status",
        ]);
        let report = RegistryValidator::default().validate(&reg);
        assert!(report.ok());
        assert!(report.missing_mandatory.is_empty());
        assert_eq!(report.registered_tools.len(), 4);
    }

    #[test]
    fn empty_registry_fails_mandatory() {
        let reg = ToolRegistry::new();
        let report = RegistryValidator::default().validate(&reg);
        assert!(!report.ok());
        assert!(report.missing_mandatory.contains(&"time.now".to_string()));
        assert!(!report.errors.is_empty());
    }

    #[test]
    fn missing_route_dep_is_warning_not_error() {
        let reg = make_registry(&[
            "time.now",
            "calendar.list_events",
            "gmail.list_messages",
            "system.status",
        ]);
        let report = RegistryValidator::default().validate(&reg);
        assert!(report.ok());
        assert!(report.missing_route_deps.contains_key("gmail"));
        assert!(report
            .missing_route_deps["gmail"]
            .contains(&"gmail.send".to_string()));
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn tool_route_map_reverses_dependencies() {
        let map = tool_route_map();
        assert!(map["calendar.list_events"].contains(&"calendar"));
        assert!(map["time.now"].contains(&"system"));
    }

    #[tokio::test]
    async fn health_probe_passes_for_working_tools() {
        let reg = make_registry(&[
            "time.now",
            "calendar.list_events",
            "gmail.list_messages",
            "system.status",
        ]);
        let report = RegistryValidator::default().validate_with_health(&reg).await;
        assert!(report.healthy());
        assert_eq!(report.health_results.len(), 4);
    }

    #[tokio::test]
    async fn health_probe_failure_marks_unhealthy() {
        let reg = make_registry(&["calendar.list_events", "gmail.list_messages", "system.status"]);
        reg.register(Tool::new("time.now", "broken", json!({}), |_| async {
            Err(anyhow!("clock offline"))
        }));

        let report = RegistryValidator::default().validate_with_health(&reg).await;
        assert!(report.ok());
        assert!(!report.healthy());
        assert_eq!(report.health_results["time.now"], false);
    }
}
