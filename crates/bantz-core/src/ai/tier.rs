//! Tiered finalization policy: fast local model for routing-style turns,
//! quality model only for writing-heavy requests.

use serde::Serialize;

use crate::config::ForcedTier;

use super::plan::{Route, RouterPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizerTier {
    Fast,
    Quality,
}

impl FinalizerTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizerTier::Fast => "fast",
            FinalizerTier::Quality => "quality",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierDecision {
    pub tier: FinalizerTier,
    pub reason: &'static str,
}

/// Gmail intents that produce prose worth escalating for.
const WRITING_GMAIL_INTENTS: &[&str] = &["send", "create_draft", "generate_reply", "reply", "compose"];

fn is_writing_heavy(plan: &RouterPlan) -> bool {
    if WRITING_GMAIL_INTENTS.contains(&plan.gmail_intent.as_str()) {
        return true;
    }
    // Long-form asks show up as explain/summarize slots on any route.
    plan.slots
        .get("style")
        .and_then(|v| v.as_str())
        .is_some_and(|s| matches!(s, "long" | "detailed" | "creative"))
        || plan
            .slots
            .get("length_hint")
            .and_then(|v| v.as_str())
            .is_some_and(|s| s == "long")
}

fn is_routing_only(plan: &RouterPlan) -> bool {
    plan.has_tools()
        || plan.requires_confirmation
        || matches!(plan.route, Route::System)
        || (!plan.assistant_reply.is_empty() && plan.assistant_reply.chars().count() < 120)
}

/// Pick the finalizer tier for this turn. The forced override wins, then
/// writing-heavy plans escalate when the quality client exists, and an
/// absent quality client always falls back to fast.
pub fn decide_tier(
    plan: &RouterPlan,
    quality_available: bool,
    force: Option<ForcedTier>,
) -> TierDecision {
    match force {
        Some(ForcedTier::Quality) if quality_available => {
            return TierDecision {
                tier: FinalizerTier::Quality,
                reason: "forced",
            };
        }
        Some(ForcedTier::Quality) => {
            return TierDecision {
                tier: FinalizerTier::Fast,
                reason: "fallback",
            };
        }
        Some(ForcedTier::Fast) => {
            return TierDecision {
                tier: FinalizerTier::Fast,
                reason: "forced",
            };
        }
        None => {}
    }

    if is_writing_heavy(plan) {
        if quality_available {
            return TierDecision {
                tier: FinalizerTier::Quality,
                reason: "writing_heavy",
            };
        }
        return TierDecision {
            tier: FinalizerTier::Fast,
            reason: "fallback",
        };
    }

    if is_routing_only(plan) {
        return TierDecision {
            tier: FinalizerTier::Fast,
            reason: "routing_only",
        };
    }

    TierDecision {
        tier: FinalizerTier::Fast,
        reason: "default_fast",
    }
}
