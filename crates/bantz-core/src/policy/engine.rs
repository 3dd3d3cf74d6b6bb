//! Permission engine: ordered first-match rule evaluation with
//! per-session and per-day rate limits.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use chrono::NaiveDate;

use super::dsl::{load_policy_str, match_rule, match_tool, Decision, PermissionRule, Risk};

/// Built-in policy used when no policy document is supplied. Ordered;
/// first match wins.
pub fn default_rules() -> Vec<PermissionRule> {
    vec![
        PermissionRule::new("time.*", "*", Risk::Low, Decision::Allow),
        PermissionRule::new("system.status", "*", Risk::Low, Decision::Allow),
        PermissionRule::new("system.*", "execute", Risk::Critical, Decision::Deny),
        PermissionRule::new("calendar.create_event", "*", Risk::Medium, Decision::Confirm),
        PermissionRule::new("calendar.update_event", "*", Risk::Medium, Decision::Confirm),
        PermissionRule::new("calendar.delete_event", "*", Risk::High, Decision::Confirm),
        PermissionRule::new("gmail.send", "*", Risk::High, Decision::Confirm),
        PermissionRule::new("gmail.create_draft", "*", Risk::Medium, Decision::Confirm),
        PermissionRule::new("calendar.*", "read", Risk::Low, Decision::Allow),
        PermissionRule::new("gmail.*", "read", Risk::Low, Decision::Allow),
        PermissionRule::new("contacts.*", "read", Risk::Low, Decision::Allow),
        // Catch-all: anything unmatched needs explicit user confirmation.
        PermissionRule::default(),
    ]
}

struct Counters {
    /// rule index → calls this session.
    session: HashMap<usize, u32>,
    /// rule index → (day, calls that day).
    day: HashMap<usize, (NaiveDate, u32)>,
}

/// Evaluates tool+action pairs against the ordered rule list.
/// Share via `Arc`; counters sit behind a per-engine lock.
pub struct PermissionEngine {
    rules: Mutex<Vec<PermissionRule>>,
    counters: Mutex<Counters>,
}

impl Default for PermissionEngine {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl PermissionEngine {
    pub fn new(rules: Vec<PermissionRule>) -> Self {
        Self {
            rules: Mutex::new(rules),
            counters: Mutex::new(Counters {
                session: HashMap::new(),
                day: HashMap::new(),
            }),
        }
    }

    /// Prepend custom rules so they take priority over whatever is loaded.
    pub fn load_policy_str(&self, text: &str) -> Result<usize> {
        let custom = load_policy_str(text)?;
        let count = custom.len();
        let mut rules = self.rules.lock().expect("rules lock poisoned");
        let existing = std::mem::take(&mut *rules);
        *rules = custom.into_iter().chain(existing).collect();
        Ok(count)
    }

    /// Evaluate a tool+action pair. Always terminates with one of
    /// Allow/Confirm/Deny; rate-limit exhaustion turns the base decision
    /// into Deny.
    pub fn evaluate(&self, tool: &str, action: &str) -> Decision {
        let rules = self.rules.lock().expect("rules lock poisoned");
        let matched = rules
            .iter()
            .enumerate()
            .find(|(_, r)| match_rule(r, tool, action));

        let Some((index, rule)) = matched else {
            // Unknown tool with no matching rule: confirm.
            return Decision::Confirm;
        };

        let decision = rule.decision;
        if rule.conditions.is_empty() {
            return decision;
        }

        let mut counters = self.counters.lock().expect("counters lock poisoned");

        if let Some(max) = rule.conditions.max_per_session {
            let count = counters.session.entry(index).or_insert(0);
            *count += 1;
            if *count > max {
                tracing::warn!(tool, rule = index, max, "session rate limit exhausted");
                return Decision::Deny;
            }
        }

        if let Some(max) = rule.conditions.max_per_day {
            let today = chrono::Utc::now().date_naive();
            let entry = counters.day.entry(index).or_insert((today, 0));
            if entry.0 != today {
                *entry = (today, 0);
            }
            entry.1 += 1;
            if entry.1 > max {
                tracing::warn!(tool, rule = index, max, "daily rate limit exhausted");
                return Decision::Deny;
            }
        }

        decision
    }

    /// Risk level of the first rule whose tool glob matches, ignoring the
    /// action. Falls back to the catch-all medium.
    pub fn get_risk(&self, tool: &str) -> Risk {
        let rules = self.rules.lock().expect("rules lock poisoned");
        rules
            .iter()
            .find(|r| match_tool(r, tool))
            .map(|r| r.risk)
            .unwrap_or(Risk::Medium)
    }

    /// Clear all per-session counters (daily counters are left alone).
    pub fn reset_session(&self) {
        let mut counters = self.counters.lock().expect("counters lock poisoned");
        counters.session.clear();
    }
}
