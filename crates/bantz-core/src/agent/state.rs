//! Session-level orchestrator state with hard-capped collections.
//!
//! Every mutable collection grows only through its mutator, and every
//! mutator evicts oldest-first at its cap, so a long-lived session can
//! never grow without bound. One state per session; never shared across
//! sessions.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;

pub const CONVERSATION_CAP: usize = 50;
pub const PENDING_CONFIRMATIONS_CAP: usize = 10;
pub const TRACE_CAP: usize = 20;
pub const LISTED_REFS_CAP: usize = 50;
pub const REACT_OBSERVATIONS_CAP: usize = 50;

/// One completed (user, assistant) exchange.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub user: String,
    pub assistant: String,
    pub turn_number: u64,
    pub timestamp: DateTime<Utc>,
}

/// A stored write-intent awaiting explicit user confirmation.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub tool: String,
    pub args: Value,
    /// Opaque token the caller echoes back to approve.
    pub token: String,
    pub expires_at: Instant,
    pub prompt: String,
}

impl PendingConfirmation {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Bounded per-session memory across turns.
#[derive(Debug, Default)]
pub struct OrchestratorState {
    pub session_id: String,
    pub session_context: String,
    turn_number: u64,
    conversation_history: VecDeque<ConversationTurn>,
    pending_confirmations: VecDeque<PendingConfirmation>,
    /// Insertion-ordered; updates in place never evict.
    trace: Vec<(String, Value)>,
    gmail_listed_messages: Vec<Value>,
    calendar_listed_events: Vec<Value>,
    react_observations: VecDeque<String>,
}

impl OrchestratorState {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Default::default()
        }
    }

    // ── Turn counter ───────────────────────────────────────────────────

    pub fn turn_number(&self) -> u64 {
        self.turn_number
    }

    pub fn next_turn(&mut self) -> u64 {
        self.turn_number += 1;
        self.turn_number
    }

    // ── Conversation history ───────────────────────────────────────────

    pub fn add_conversation_turn(&mut self, user: &str, assistant: &str) {
        self.conversation_history.push_back(ConversationTurn {
            user: user.to_string(),
            assistant: assistant.to_string(),
            turn_number: self.turn_number,
            timestamp: Utc::now(),
        });
        while self.conversation_history.len() > CONVERSATION_CAP {
            self.conversation_history.pop_front();
        }
    }

    pub fn conversation_history(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.conversation_history.iter()
    }

    pub fn conversation_len(&self) -> usize {
        self.conversation_history.len()
    }

    /// Last `n` exchanges, oldest first.
    pub fn recent_conversation(&self, n: usize) -> Vec<&ConversationTurn> {
        let skip = self.conversation_history.len().saturating_sub(n);
        self.conversation_history.iter().skip(skip).collect()
    }

    // ── Pending confirmations ──────────────────────────────────────────

    pub fn add_pending_confirmation(&mut self, pending: PendingConfirmation) {
        self.pending_confirmations.push_back(pending);
        while self.pending_confirmations.len() > PENDING_CONFIRMATIONS_CAP {
            self.pending_confirmations.pop_front();
        }
    }

    /// Look up and consume a pending confirmation by token. Expired
    /// entries are dropped, never returned.
    pub fn take_pending_confirmation(&mut self, token: &str) -> Option<PendingConfirmation> {
        self.pending_confirmations.retain(|p| !p.is_expired());
        let index = self.pending_confirmations.iter().position(|p| p.token == token)?;
        self.pending_confirmations.remove(index)
    }

    pub fn pending_confirmations(&self) -> impl Iterator<Item = &PendingConfirmation> {
        self.pending_confirmations.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_confirmations.len()
    }

    // ── Trace ──────────────────────────────────────────────────────────

    /// Set a trace key. Updating an existing key rewrites in place; a
    /// new key at cap evicts the oldest key.
    pub fn update_trace(&mut self, key: &str, value: Value) {
        if let Some(entry) = self.trace.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
            return;
        }
        self.trace.push((key.to_string(), value));
        while self.trace.len() > TRACE_CAP {
            self.trace.remove(0);
        }
    }

    pub fn trace_get(&self, key: &str) -> Option<&Value> {
        self.trace.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn trace_len(&self) -> usize {
        self.trace.len()
    }

    // ── Listed-ref snapshots ───────────────────────────────────────────

    /// Replace atomically, keeping the most recent tail at the cap.
    pub fn set_gmail_listed_messages(&mut self, refs: Vec<Value>) {
        self.gmail_listed_messages = keep_latest(refs, LISTED_REFS_CAP);
    }

    pub fn gmail_listed_messages(&self) -> &[Value] {
        &self.gmail_listed_messages
    }

    pub fn set_calendar_listed_events(&mut self, refs: Vec<Value>) {
        self.calendar_listed_events = keep_latest(refs, LISTED_REFS_CAP);
    }

    pub fn calendar_listed_events(&self) -> &[Value] {
        &self.calendar_listed_events
    }

    // ── React observations ─────────────────────────────────────────────

    pub fn add_react_observation(&mut self, observation: &str) {
        self.react_observations.push_back(observation.to_string());
        while self.react_observations.len() > REACT_OBSERVATIONS_CAP {
            self.react_observations.pop_front();
        }
    }

    pub fn react_observations(&self) -> impl Iterator<Item = &String> {
        self.react_observations.iter()
    }

    pub fn react_len(&self) -> usize {
        self.react_observations.len()
    }
}

fn keep_latest(mut items: Vec<Value>, cap: usize) -> Vec<Value> {
    let len = items.len();
    if len > cap {
        items.drain(..len - cap);
    }
    items
}
