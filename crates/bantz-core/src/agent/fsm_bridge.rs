//! Bridge between orchestrator phase boundaries and the conversation FSM.
//!
//! Each phase boundary maps to FSM events, and every resulting state
//! change is published to the event bus as `fsm.state_changed`. A turn
//! starting while the FSM is still RESPONDING is a barge-in and records
//! `trigger="barge_in"`. Degrades to a no-op when no FSM is attached.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Value};

use crate::conversation::fsm::{ConversationFsm, FsmEvent, FsmState};
use crate::events::EventBus;

const MAX_RECORDS: usize = 200;

/// One observed state change, for traces.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FsmTransitionRecord {
    pub turn_number: u64,
    pub old_state: String,
    pub new_state: String,
    pub trigger: String,
}

impl FsmTransitionRecord {
    pub fn to_trace_line(&self) -> String {
        format!(
            "[fsm] {} → {} trigger={} turn={}",
            self.old_state, self.new_state, self.trigger, self.turn_number
        )
    }
}

struct BridgeInner {
    records: Vec<FsmTransitionRecord>,
    turn_number: u64,
    barge_in: bool,
}

pub struct FsmBridge {
    fsm: Option<Arc<ConversationFsm>>,
    bus: Option<Arc<EventBus>>,
    inner: Mutex<BridgeInner>,
}

impl FsmBridge {
    pub fn new(fsm: Option<Arc<ConversationFsm>>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            fsm,
            bus,
            inner: Mutex::new(BridgeInner {
                records: Vec::new(),
                turn_number: 0,
                barge_in: false,
            }),
        }
    }

    /// Detached bridge: every hook is a no-op.
    pub fn detached() -> Self {
        Self::new(None, None)
    }

    pub fn current_state(&self) -> String {
        self.fsm
            .as_ref()
            .map(|f| f.state().as_str().to_string())
            .unwrap_or_else(|| "detached".to_string())
    }

    /// Was the current turn started over an in-progress reply?
    pub fn is_barge_in(&self) -> bool {
        self.inner.lock().expect("bridge lock poisoned").barge_in
    }

    pub fn records(&self) -> Vec<FsmTransitionRecord> {
        self.inner.lock().expect("bridge lock poisoned").records.clone()
    }

    // ── Phase hooks ────────────────────────────────────────────────────

    /// Turn start: IDLE → LISTENING → PLANNING. A start while still
    /// RESPONDING is a barge-in; the interrupted reply is closed out
    /// first.
    pub fn on_turn_start(&self, turn_number: u64) {
        let Some(fsm) = &self.fsm else { return };

        let barge_in = fsm.state() == FsmState::Responding;
        {
            let mut inner = self.inner.lock().expect("bridge lock poisoned");
            inner.turn_number = turn_number;
            inner.barge_in = barge_in;
        }

        let trigger = if barge_in { "barge_in" } else { "turn_start" };
        if barge_in {
            self.fire(fsm, FsmEvent::ResponseDelivered, trigger, json!({"interrupted": true}));
        }
        // Recover terminal states left over from a previous turn.
        match fsm.state() {
            FsmState::Error => self.fire(fsm, FsmEvent::ErrorHandled, trigger, json!({})),
            FsmState::Cancelled => self.fire(fsm, FsmEvent::Reset, trigger, json!({})),
            _ => {}
        }
        self.fire(fsm, FsmEvent::UserInput, trigger, json!({}));
        self.fire(fsm, FsmEvent::InputComplete, trigger, json!({}));
    }

    /// Planning finished with tools: PLANNING → EXECUTING.
    pub fn on_plan_ready(&self) {
        if let Some(fsm) = &self.fsm {
            self.fire(fsm, FsmEvent::PlanReady, "plan_ready", json!({}));
        }
    }

    /// Planning finished without tools: PLANNING → RESPONDING.
    pub fn on_no_tools(&self) {
        if let Some(fsm) = &self.fsm {
            self.fire(fsm, FsmEvent::NoTools, "no_tools", json!({}));
        }
    }

    /// A write needs explicit approval: EXECUTING → CONFIRMING.
    pub fn on_confirmation_required(&self, tool: &str) {
        if let Some(fsm) = &self.fsm {
            self.fire(
                fsm,
                FsmEvent::ConfirmationRequired,
                "confirmation_required",
                json!({"tool": tool}),
            );
        }
    }

    /// User approved the pending write: CONFIRMING → EXECUTING.
    pub fn on_user_confirmed(&self) {
        if let Some(fsm) = &self.fsm {
            self.fire(fsm, FsmEvent::UserConfirmed, "user_confirmed", json!({}));
        }
    }

    /// User denied: CONFIRMING → CANCELLED.
    pub fn on_user_denied(&self) {
        if let Some(fsm) = &self.fsm {
            self.fire(fsm, FsmEvent::UserDenied, "user_denied", json!({}));
        }
    }

    /// Tool phase done: EXECUTING → RESPONDING.
    pub fn on_tools_complete(&self) {
        if let Some(fsm) = &self.fsm {
            self.fire(fsm, FsmEvent::ToolsComplete, "tools_complete", json!({}));
        }
    }

    /// Finalization produced the reply; make sure we are RESPONDING.
    pub fn on_finalization_done(&self) {
        let Some(fsm) = &self.fsm else { return };
        match fsm.state() {
            FsmState::Executing => {
                self.fire(fsm, FsmEvent::ToolsComplete, "finalization_done", json!({}))
            }
            FsmState::Planning => self.fire(fsm, FsmEvent::NoTools, "finalization_done", json!({})),
            _ => {}
        }
    }

    /// Reply delivered: RESPONDING → IDLE.
    pub fn on_turn_end(&self) {
        if let Some(fsm) = &self.fsm {
            self.fire(fsm, FsmEvent::ResponseDelivered, "turn_end", json!({}));
        }
    }

    pub fn on_error(&self, reason: &str) {
        if let Some(fsm) = &self.fsm {
            self.fire(fsm, FsmEvent::Error, "error", json!({"reason": reason}));
        }
    }

    pub fn on_cancel(&self) {
        if let Some(fsm) = &self.fsm {
            self.fire(fsm, FsmEvent::UserCancel, "user_cancel", json!({}));
        }
    }

    fn fire(&self, fsm: &ConversationFsm, event: FsmEvent, trigger: &str, metadata: Value) {
        let old = fsm.state();
        let new = fsm.transition(event, metadata.clone());
        if old == new {
            return;
        }

        let record = {
            let mut inner = self.inner.lock().expect("bridge lock poisoned");
            let record = FsmTransitionRecord {
                turn_number: inner.turn_number,
                old_state: old.as_str().to_string(),
                new_state: new.as_str().to_string(),
                trigger: trigger.to_string(),
            };
            inner.records.push(record.clone());
            let len = inner.records.len();
            if len > MAX_RECORDS {
                inner.records.drain(..len - MAX_RECORDS);
            }
            record
        };

        tracing::debug!("{}", record.to_trace_line());

        if let Some(bus) = &self.bus {
            bus.publish(
                "fsm.state_changed",
                json!({
                    "old_state": record.old_state,
                    "new_state": record.new_state,
                    "trigger": record.trigger,
                    "turn_number": record.turn_number,
                    "metadata": metadata,
                }),
                "fsm_bridge",
            );
        }
    }
}
