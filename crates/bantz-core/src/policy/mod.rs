//! Permission and safety gate: rule DSL, evaluation engine, destructive
//! command guardrails, and the action risk classifier.

pub mod classifier;
pub mod dsl;
pub mod engine;
pub mod guardrails;

pub use classifier::{ActionClassification, ActionClassifier, PermissionLevel};
pub use dsl::{load_policy, load_policy_str, match_rule, Decision, PermissionRule, Risk};
pub use engine::PermissionEngine;
pub use guardrails::{GuardrailVerdict, SafetyGuard};
