//! Action risk classifier.
//!
//! Static action → permission level mapping plus context elevation.
//! Context can raise the level, never lower it.

use std::collections::HashMap;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Low,
    Medium,
    High,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Low => "low",
            PermissionLevel::Medium => "medium",
            PermissionLevel::High => "high",
        }
    }

    /// High-level actions always need confirmation.
    pub fn requires_confirmation(&self) -> bool {
        *self == PermissionLevel::High
    }
}

/// Context facts that may elevate an action's level.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub domain: Option<String>,
    pub amount: f64,
    pub target_count: u32,
    pub is_sensitive_file: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionClassification {
    pub action: String,
    pub level: PermissionLevel,
    pub is_destructive: bool,
    pub is_external: bool,
    pub requires_confirmation: bool,
    pub reason: String,
}

const DESTRUCTIVE_ACTIONS: &[&str] = &[
    "delete_file",
    "delete_directory",
    "delete_event",
    "format_disk",
    "system_shutdown",
    "modify_system",
    "make_payment",
];

const EXTERNAL_ACTIONS: &[&str] = &[
    "send_email",
    "post_social",
    "send_message",
    "api_call",
    "download_file",
    "upload_file",
    "git_push",
    "share_screen",
    "remote_access",
];

fn builtin_levels() -> Vec<(&'static str, PermissionLevel)> {
    use PermissionLevel::*;
    vec![
        // Read-only, local
        ("browser_open", Low),
        ("web_search", Low),
        ("read_file", Low),
        ("list_dir", Low),
        ("list_events", Low),
        ("get_time", Low),
        ("get_weather", Low),
        ("read_message", Low),
        ("system_status", Low),
        // External access, first-time ask
        ("read_clipboard", Medium),
        ("send_email", Medium),
        ("calendar_access", Medium),
        ("calendar_create", Medium),
        ("create_event", Medium),
        ("update_event", Medium),
        ("post_social", Medium),
        ("api_call", Medium),
        ("write_file", Medium),
        ("create_file", Medium),
        ("download_file", Medium),
        ("install_package", Medium),
        ("git_commit", Medium),
        ("git_push", Medium),
        // Destructive, always ask
        ("delete_file", High),
        ("delete_directory", High),
        ("delete_event", High),
        ("make_payment", High),
        ("send_message", High),
        ("execute_command", High),
        ("run_script", High),
        ("system_shutdown", High),
        ("format_disk", High),
        ("modify_system", High),
        ("access_credentials", High),
        ("share_screen", High),
        ("remote_access", High),
    ]
}

pub struct ActionClassifier {
    levels: HashMap<String, PermissionLevel>,
    default_level: PermissionLevel,
}

impl Default for ActionClassifier {
    fn default() -> Self {
        Self::new(None, PermissionLevel::High)
    }
}

impl ActionClassifier {
    pub fn new(
        custom_levels: Option<HashMap<String, PermissionLevel>>,
        default_level: PermissionLevel,
    ) -> Self {
        let mut levels: HashMap<String, PermissionLevel> = builtin_levels()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        if let Some(custom) = custom_levels {
            levels.extend(custom);
        }
        Self {
            levels,
            default_level,
        }
    }

    pub fn classify(&self, action: &str, context: &ActionContext) -> ActionClassification {
        let known = self.levels.contains_key(action);
        let base = self.levels.get(action).copied().unwrap_or(self.default_level);
        let level = elevate(base, context);

        let reason = if !known {
            format!("unknown action, using default: {}", self.default_level.as_str())
        } else if level != base {
            format!(
                "mapped action: {action} → {}, elevated to {} by context",
                base.as_str(),
                level.as_str()
            )
        } else {
            format!("mapped action: {action} → {}", level.as_str())
        };

        ActionClassification {
            action: action.to_string(),
            level,
            is_destructive: DESTRUCTIVE_ACTIONS.contains(&action),
            is_external: EXTERNAL_ACTIONS.contains(&action),
            requires_confirmation: level.requires_confirmation(),
            reason,
        }
    }

    pub fn level_of(&self, action: &str) -> PermissionLevel {
        self.levels.get(action).copied().unwrap_or(self.default_level)
    }
}

/// Elevation rules: sensitive domains, large amounts, many targets, and
/// sensitive files raise the level. Never lowers.
fn elevate(base: PermissionLevel, context: &ActionContext) -> PermissionLevel {
    let mut level = base;

    if matches!(
        context.domain.as_deref(),
        Some("banking") | Some("medical") | Some("legal")
    ) {
        level = level.max(PermissionLevel::High);
    }
    if context.amount > 1000.0 {
        level = level.max(PermissionLevel::High);
    }
    if context.target_count > 10 {
        level = level.max(PermissionLevel::Medium);
    }
    if context.is_sensitive_file {
        level = level.max(PermissionLevel::High);
    }

    level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_actions_are_low() {
        let c = ActionClassifier::default();
        assert_eq!(c.level_of("list_events"), PermissionLevel::Low);
        assert_eq!(c.level_of("get_time"), PermissionLevel::Low);
    }

    #[test]
    fn unknown_action_uses_default_high() {
        let c = ActionClassifier::default();
        let out = c.classify("teleport_user", &ActionContext::default());
        assert_eq!(out.level, PermissionLevel::High);
        assert!(out.reason.contains("unknown action"));
    }

    #[test]
    fn destructive_and_external_flags() {
        let c = ActionClassifier::default();
        let out = c.classify("delete_file", &ActionContext::default());
        assert!(out.is_destructive);
        assert!(!out.is_external);

        let out = c.classify("send_email", &ActionContext::default());
        assert!(out.is_external);
        assert!(!out.is_destructive);
    }

    #[test]
    fn high_level_requires_confirmation() {
        let c = ActionClassifier::default();
        let out = c.classify("execute_command", &ActionContext::default());
        assert!(out.requires_confirmation);

        let out = c.classify("list_events", &ActionContext::default());
        assert!(!out.requires_confirmation);
    }

    #[test]
    fn banking_domain_elevates_to_high() {
        let c = ActionClassifier::default();
        let ctx = ActionContext {
            domain: Some("banking".to_string()),
            ..Default::default()
        };
        let out = c.classify("send_email", &ctx);
        assert_eq!(out.level, PermissionLevel::High);
        assert!(out.reason.contains("elevated"));
    }

    #[test]
    fn large_amount_elevates() {
        let c = ActionClassifier::default();
        let ctx = ActionContext {
            amount: 5000.0,
            ..Default::default()
        };
        assert_eq!(c.classify("api_call", &ctx).level, PermissionLevel::High);
    }

    #[test]
    fn many_targets_elevates_to_medium_only() {
        let c = ActionClassifier::default();
        let ctx = ActionContext {
            target_count: 50,
            ..Default::default()
        };
        assert_eq!(c.classify("list_events", &ctx).level, PermissionLevel::Medium);
    }

    #[test]
    fn context_never_lowers() {
        let c = ActionClassifier::default();
        let ctx = ActionContext {
            target_count: 50,
            ..Default::default()
        };
        assert_eq!(c.classify("delete_file", &ctx).level, PermissionLevel::High);
    }

    #[test]
    fn custom_mapping_overrides() {
        let mut custom = HashMap::new();
        custom.insert("send_email".to_string(), PermissionLevel::High);
        let c = ActionClassifier::new(Some(custom), PermissionLevel::High);
        assert_eq!(c.level_of("send_email"), PermissionLevel::High);
    }
}
