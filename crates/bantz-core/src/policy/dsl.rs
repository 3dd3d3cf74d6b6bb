//! Permission rule DSL.
//!
//! Rules load from YAML or JSON, form an ordered list, and match tool and
//! action separately with shell-style globs (`*` any chars, `?` one char).
//! First match wins; a catch-all confirm at the end guarantees closure.

use std::path::Path;

use anyhow::{Context, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Confirm,
    Deny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Confirm => "confirm",
            Decision::Deny => "deny",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
    Critical,
}

impl Risk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
            Risk::Critical => "critical",
        }
    }
}

/// Rate-limit conditions attached to a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConditions {
    pub max_per_session: Option<u32>,
    pub max_per_day: Option<u32>,
}

impl RuleConditions {
    pub fn is_empty(&self) -> bool {
        self.max_per_session.is_none() && self.max_per_day.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionRule {
    pub tool: String,
    pub action: String,
    pub risk: Risk,
    pub decision: Decision,
    pub conditions: RuleConditions,
}

impl Default for PermissionRule {
    fn default() -> Self {
        Self {
            tool: "*".to_string(),
            action: "*".to_string(),
            risk: Risk::Medium,
            decision: Decision::Confirm,
            conditions: RuleConditions::default(),
        }
    }
}

impl PermissionRule {
    pub fn new(tool: &str, action: &str, risk: Risk, decision: Decision) -> Self {
        Self {
            tool: tool.to_string(),
            action: action.to_string(),
            risk,
            decision,
            conditions: RuleConditions::default(),
        }
    }

    pub fn with_max_per_session(mut self, max: u32) -> Self {
        self.conditions.max_per_session = Some(max);
        self
    }

    pub fn with_max_per_day(mut self, max: u32) -> Self {
        self.conditions.max_per_day = Some(max);
        self
    }
}

fn glob_match(pattern: &str, value: &str) -> bool {
    match Pattern::new(pattern) {
        // `require_literal_separator = false` so `time.*` matches `time.now`
        // and `google.*.read` matches `google.drive.read`.
        Ok(p) => p.matches_with(
            value,
            glob::MatchOptions {
                case_sensitive: true,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            },
        ),
        Err(_) => {
            tracing::warn!(pattern, "invalid permission glob, treating as non-match");
            false
        }
    }
}

/// Does this rule match the given tool and action?
pub fn match_rule(rule: &PermissionRule, tool: &str, action: &str) -> bool {
    glob_match(&rule.tool, tool) && glob_match(&rule.action, action)
}

/// Does this rule's tool glob match, ignoring the action?
pub fn match_tool(rule: &PermissionRule, tool: &str) -> bool {
    glob_match(&rule.tool, tool)
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    permissions: Vec<PermissionRule>,
}

/// Parse a policy document from a YAML or JSON string (YAML is a superset,
/// so one parser covers both).
pub fn load_policy_str(text: &str) -> Result<Vec<PermissionRule>> {
    let file: PolicyFile =
        serde_yaml::from_str(text).context("policy is not valid YAML/JSON with a `permissions` list")?;
    Ok(file.permissions)
}

/// Load a policy document from disk.
pub fn load_policy(path: &Path) -> Result<Vec<PermissionRule>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read policy file {}", path.display()))?;
    load_policy_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        let rule = PermissionRule::new("calendar.create_event", "write", Risk::Medium, Decision::Confirm);
        assert!(match_rule(&rule, "calendar.create_event", "write"));
        assert!(!match_rule(&rule, "gmail.send", "write"));
    }

    #[test]
    fn wildcard_tool_matches_prefix() {
        let rule = PermissionRule::new("calendar.*", "read", Risk::Low, Decision::Allow);
        assert!(match_rule(&rule, "calendar.list_events", "read"));
        assert!(match_rule(&rule, "calendar.get_event", "read"));
        assert!(!match_rule(&rule, "gmail.read", "read"));
    }

    #[test]
    fn wildcard_action_matches_anything() {
        let rule = PermissionRule::new("gmail.send", "*", Risk::High, Decision::Confirm);
        assert!(match_rule(&rule, "gmail.send", "write"));
        assert!(match_rule(&rule, "gmail.send", "read"));
    }

    #[test]
    fn star_star_matches_everything() {
        let rule = PermissionRule::default();
        assert!(match_rule(&rule, "anything", "everything"));
    }

    #[test]
    fn question_mark_matches_single_char() {
        let rule = PermissionRule::new("calendar.?et_event", "read", Risk::Low, Decision::Allow);
        assert!(match_rule(&rule, "calendar.get_event", "read"));
        assert!(!match_rule(&rule, "calendar.list_event", "read"));
    }

    #[test]
    fn nested_wildcard() {
        let rule = PermissionRule::new("google.*.read", "*", Risk::Low, Decision::Allow);
        assert!(match_rule(&rule, "google.drive.read", "read"));
    }

    #[test]
    fn loads_yaml() {
        let rules = load_policy_str(
            "permissions:\n  - tool: \"gmail.send\"\n    action: \"write\"\n    risk: \"high\"\n    decision: \"confirm\"\n",
        )
        .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].tool, "gmail.send");
        assert_eq!(rules[0].decision, Decision::Confirm);
    }

    #[test]
    fn loads_json() {
        let rules = load_policy_str(
            r#"{"permissions": [{"tool": "x.y", "action": "read", "risk": "low", "decision": "allow"}]}"#,
        )
        .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].decision, Decision::Allow);
    }

    #[test]
    fn loads_conditions() {
        let rules = load_policy_str(
            "permissions:\n  - tool: \"api.call\"\n    action: \"write\"\n    decision: \"allow\"\n    conditions:\n      max_per_session: 3\n",
        )
        .unwrap();
        assert_eq!(rules[0].conditions.max_per_session, Some(3));
        assert_eq!(rules[0].conditions.max_per_day, None);
    }

    #[test]
    fn invalid_text_errors() {
        assert!(load_policy_str("this is not valid json or yaml @@@{{{").is_err());
    }

    #[test]
    fn rule_defaults() {
        let rule = PermissionRule::default();
        assert_eq!(rule.tool, "*");
        assert_eq!(rule.action, "*");
        assert_eq!(rule.risk, Risk::Medium);
        assert!(rule.conditions.is_empty());
    }
}
