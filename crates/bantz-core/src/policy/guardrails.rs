//! Destructive shell command guardrails.
//!
//! Preflight regex screen over the command representation of a planned
//! action. Hard patterns block outright; soft patterns demand explicit
//! confirmation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

struct GuardPattern {
    regex: Regex,
    reason: &'static str,
}

fn pat(re: &str, reason: &'static str) -> GuardPattern {
    GuardPattern {
        regex: Regex::new(re).expect("guard pattern compiles"),
        reason,
    }
}

/// Commands that are never allowed to run.
static BLOCK_PATTERNS: Lazy<Vec<GuardPattern>> = Lazy::new(|| {
    vec![
        pat(r"(?i)\brm\s+(-[a-z]*r[a-z]*f|-[a-z]*f[a-z]*r)[a-z]*\b", "recursive force delete"),
        pat(r":\(\)\s*\{\s*:\|:&\s*\};", "fork bomb"),
        pat(r"(?i)\bmkfs(\.[a-z0-9]+)?\b", "filesystem format"),
        pat(r"(?i)\bdd\s+[^|]*of=/dev/", "raw device write"),
        pat(r"(?i)>\s*/dev/sd[a-z]\b", "raw device overwrite"),
        pat(r"(?i)\bchmod\s+(-[a-z]+\s+)*777\s+/\s*$", "world-writable root"),
        pat(r"(?i)\bcurl\b[^|]*\|\s*(ba)?sh\b", "pipe remote script to shell"),
        pat(r"(?i)\bwget\b[^|]*\|\s*(ba)?sh\b", "pipe remote script to shell"),
    ]
});

/// Commands that run only after explicit user confirmation.
static CONFIRM_PATTERNS: Lazy<Vec<GuardPattern>> = Lazy::new(|| {
    vec![
        pat(r"(?i)\bsudo\b", "privilege escalation"),
        pat(r"(?i)\bgit\s+push\b", "remote repository write"),
        pat(r"(?i)\bshutdown\b|\breboot\b|\bpoweroff\b", "power state change"),
        pat(r"(?i)\bkill\s+-9\b|\bpkill\b", "process kill"),
        pat(r"(?i)\bsystemctl\s+(stop|disable|mask)\b", "service stop"),
    ]
});

/// Outcome of a guardrail screen.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GuardrailVerdict {
    pub blocked: bool,
    pub confirmation_required: bool,
    pub reason: Option<String>,
}

impl GuardrailVerdict {
    fn clean() -> Self {
        Self {
            blocked: false,
            confirmation_required: false,
            reason: None,
        }
    }
}

/// Stateless pattern screen. Cheap to construct; share freely.
#[derive(Debug, Default, Clone, Copy)]
pub struct SafetyGuard;

impl SafetyGuard {
    pub fn new() -> Self {
        Self
    }

    /// Screen a command string. Block patterns win over confirm patterns.
    pub fn check(&self, command: &str) -> GuardrailVerdict {
        if command.trim().is_empty() {
            return GuardrailVerdict::clean();
        }

        for p in BLOCK_PATTERNS.iter() {
            if p.regex.is_match(command) {
                tracing::warn!(reason = p.reason, "guardrail blocked command");
                return GuardrailVerdict {
                    blocked: true,
                    confirmation_required: false,
                    reason: Some(p.reason.to_string()),
                };
            }
        }

        for p in CONFIRM_PATTERNS.iter() {
            if p.regex.is_match(command) {
                return GuardrailVerdict {
                    blocked: false,
                    confirmation_required: true,
                    reason: Some(p.reason.to_string()),
                };
            }
        }

        GuardrailVerdict::clean()
    }
}
