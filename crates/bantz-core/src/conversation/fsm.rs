//! Formal conversation FSM.
//!
//! Strict transition table; invalid (state, event) pairs are logged and
//! ignored, never panic. EXECUTING carries a wall-clock timeout that
//! auto-transitions to ERROR on the next state read.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FsmState {
    Idle,
    Listening,
    Planning,
    Executing,
    Confirming,
    Responding,
    Error,
    Cancelled,
}

impl FsmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmState::Idle => "idle",
            FsmState::Listening => "listening",
            FsmState::Planning => "planning",
            FsmState::Executing => "executing",
            FsmState::Confirming => "confirming",
            FsmState::Responding => "responding",
            FsmState::Error => "error",
            FsmState::Cancelled => "cancelled",
        }
    }

    pub const ALL: [FsmState; 8] = [
        FsmState::Idle,
        FsmState::Listening,
        FsmState::Planning,
        FsmState::Executing,
        FsmState::Confirming,
        FsmState::Responding,
        FsmState::Error,
        FsmState::Cancelled,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FsmEvent {
    UserInput,
    InputComplete,
    PlanReady,
    NoTools,
    ConfirmationRequired,
    ToolsComplete,
    UserConfirmed,
    UserDenied,
    ResponseDelivered,
    Error,
    UserCancel,
    ErrorHandled,
    Reset,
}

impl FsmEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmEvent::UserInput => "user_input",
            FsmEvent::InputComplete => "input_complete",
            FsmEvent::PlanReady => "plan_ready",
            FsmEvent::NoTools => "no_tools",
            FsmEvent::ConfirmationRequired => "confirmation_required",
            FsmEvent::ToolsComplete => "tools_complete",
            FsmEvent::UserConfirmed => "user_confirmed",
            FsmEvent::UserDenied => "user_denied",
            FsmEvent::ResponseDelivered => "response_delivered",
            FsmEvent::Error => "error",
            FsmEvent::UserCancel => "user_cancel",
            FsmEvent::ErrorHandled => "error_handled",
            FsmEvent::Reset => "reset",
        }
    }
}

/// Legal (state, event) → next state. Returns `None` for illegal pairs.
pub fn legal_transition(state: FsmState, event: FsmEvent) -> Option<FsmState> {
    use FsmEvent as E;
    use FsmState as S;

    // Any non-terminal state reaches ERROR / CANCELLED directly.
    if !matches!(state, S::Error | S::Cancelled) {
        match event {
            E::Error => return Some(S::Error),
            E::UserCancel => return Some(S::Cancelled),
            _ => {}
        }
    }

    match (state, event) {
        (S::Idle, E::UserInput) => Some(S::Listening),
        (S::Listening, E::InputComplete) => Some(S::Planning),
        (S::Planning, E::PlanReady) => Some(S::Executing),
        (S::Planning, E::NoTools) => Some(S::Responding),
        (S::Executing, E::ConfirmationRequired) => Some(S::Confirming),
        (S::Executing, E::ToolsComplete) => Some(S::Responding),
        (S::Confirming, E::UserConfirmed) => Some(S::Executing),
        (S::Confirming, E::UserDenied) => Some(S::Cancelled),
        (S::Responding, E::ResponseDelivered) => Some(S::Idle),
        (S::Error, E::ErrorHandled) => Some(S::Idle),
        (S::Cancelled, E::Reset) => Some(S::Idle),
        _ => None,
    }
}

/// Log entry for one transition.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from_state: FsmState,
    pub to_state: FsmState,
    pub event: FsmEvent,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

type StateCallback = Box<dyn Fn(FsmState, FsmState, FsmEvent) + Send + Sync>;

struct FsmInner {
    state: FsmState,
    executing_entered: Option<Instant>,
    history: Vec<TransitionRecord>,
    on_enter: HashMap<FsmState, Vec<StateCallback>>,
    on_exit: HashMap<FsmState, Vec<StateCallback>>,
}

/// Conversation FSM with interior locking; the bridge, barge-in handler,
/// and external threads may all call in.
pub struct ConversationFsm {
    inner: Mutex<FsmInner>,
    executing_timeout: Duration,
}

impl Default for ConversationFsm {
    fn default() -> Self {
        Self::new(FsmState::Idle, Duration::from_secs(60))
    }
}

impl ConversationFsm {
    pub fn new(initial: FsmState, executing_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(FsmInner {
                state: initial,
                executing_entered: None,
                history: Vec::new(),
                on_enter: HashMap::new(),
                on_exit: HashMap::new(),
            }),
            executing_timeout,
        }
    }

    /// Current state. Reading has a side effect: an expired EXECUTING
    /// auto-transitions to ERROR with reason `executing_timeout`.
    pub fn state(&self) -> FsmState {
        let mut inner = self.inner.lock().expect("fsm lock poisoned");
        self.check_executing_timeout(&mut inner);
        inner.state
    }

    /// Attempt a transition. Illegal pairs return the current state
    /// unchanged after a warning.
    pub fn transition(&self, event: FsmEvent, metadata: Value) -> FsmState {
        let mut inner = self.inner.lock().expect("fsm lock poisoned");
        self.check_executing_timeout(&mut inner);

        let prev = inner.state;
        let Some(next) = legal_transition(prev, event) else {
            tracing::warn!(
                state = prev.as_str(),
                event = event.as_str(),
                "invalid FSM transition ignored"
            );
            return prev;
        };

        run_callbacks(&inner.on_exit, prev, prev, next, event);

        inner.state = next;
        inner.executing_entered = if next == FsmState::Executing {
            Some(Instant::now())
        } else {
            None
        };
        inner.history.push(TransitionRecord {
            from_state: prev,
            to_state: next,
            event,
            timestamp: Utc::now(),
            metadata,
        });

        tracing::info!(
            from = prev.as_str(),
            to = next.as_str(),
            event = event.as_str(),
            "FSM transition"
        );

        run_callbacks(&inner.on_enter, next, prev, next, event);
        next
    }

    /// Is `event` legal from the current state?
    pub fn can_transition(&self, event: FsmEvent) -> bool {
        let mut inner = self.inner.lock().expect("fsm lock poisoned");
        self.check_executing_timeout(&mut inner);
        legal_transition(inner.state, event).is_some()
    }

    /// Every event legal from the current state.
    pub fn allowed_events(&self) -> Vec<FsmEvent> {
        let state = self.state();
        [
            FsmEvent::UserInput,
            FsmEvent::InputComplete,
            FsmEvent::PlanReady,
            FsmEvent::NoTools,
            FsmEvent::ConfirmationRequired,
            FsmEvent::ToolsComplete,
            FsmEvent::UserConfirmed,
            FsmEvent::UserDenied,
            FsmEvent::ResponseDelivered,
            FsmEvent::Error,
            FsmEvent::UserCancel,
            FsmEvent::ErrorHandled,
            FsmEvent::Reset,
        ]
        .into_iter()
        .filter(|e| legal_transition(state, *e).is_some())
        .collect()
    }

    /// Force IDLE and clear history.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("fsm lock poisoned");
        inner.state = FsmState::Idle;
        inner.executing_entered = None;
        inner.history.clear();
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.inner.lock().expect("fsm lock poisoned").history.clone()
    }

    pub fn on_enter<F>(&self, state: FsmState, callback: F)
    where
        F: Fn(FsmState, FsmState, FsmEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("fsm lock poisoned");
        inner.on_enter.entry(state).or_default().push(Box::new(callback));
    }

    pub fn on_exit<F>(&self, state: FsmState, callback: F)
    where
        F: Fn(FsmState, FsmState, FsmEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("fsm lock poisoned");
        inner.on_exit.entry(state).or_default().push(Box::new(callback));
    }

    fn check_executing_timeout(&self, inner: &mut FsmInner) {
        let expired = inner.state == FsmState::Executing
            && inner
                .executing_entered
                .is_some_and(|t| t.elapsed() > self.executing_timeout);
        if expired {
            tracing::warn!(
                timeout_secs = self.executing_timeout.as_secs(),
                "EXECUTING timeout, transitioning to ERROR"
            );
            let prev = inner.state;
            inner.state = FsmState::Error;
            inner.executing_entered = None;
            inner.history.push(TransitionRecord {
                from_state: prev,
                to_state: FsmState::Error,
                event: FsmEvent::Error,
                timestamp: Utc::now(),
                metadata: serde_json::json!({"reason": "executing_timeout"}),
            });
        }
    }
}

/// Run every callback registered for `key`, isolating panics.
fn run_callbacks(
    map: &HashMap<FsmState, Vec<StateCallback>>,
    key: FsmState,
    from: FsmState,
    to: FsmState,
    event: FsmEvent,
) {
    for cb in map.get(&key).map(Vec::as_slice).unwrap_or(&[]) {
        if catch_unwind(AssertUnwindSafe(|| cb(from, to, event))).is_err() {
            tracing::warn!(state = key.as_str(), "FSM callback panicked; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn happy_path_through_all_states() {
        let fsm = ConversationFsm::default();
        assert_eq!(fsm.state(), FsmState::Idle);

        assert_eq!(fsm.transition(FsmEvent::UserInput, json!({})), FsmState::Listening);
        assert_eq!(fsm.transition(FsmEvent::InputComplete, json!({})), FsmState::Planning);
        assert_eq!(fsm.transition(FsmEvent::PlanReady, json!({})), FsmState::Executing);
        assert_eq!(fsm.transition(FsmEvent::ToolsComplete, json!({})), FsmState::Responding);
        assert_eq!(fsm.transition(FsmEvent::ResponseDelivered, json!({})), FsmState::Idle);
    }

    #[test]
    fn no_tools_skips_executing() {
        let fsm = ConversationFsm::default();
        fsm.transition(FsmEvent::UserInput, json!({}));
        fsm.transition(FsmEvent::InputComplete, json!({}));
        assert_eq!(fsm.transition(FsmEvent::NoTools, json!({})), FsmState::Responding);
    }

    #[test]
    fn confirmation_flow() {
        let fsm = ConversationFsm::default();
        fsm.transition(FsmEvent::UserInput, json!({}));
        fsm.transition(FsmEvent::InputComplete, json!({}));
        fsm.transition(FsmEvent::PlanReady, json!({}));
        assert_eq!(
            fsm.transition(FsmEvent::ConfirmationRequired, json!({})),
            FsmState::Confirming
        );
        assert_eq!(fsm.transition(FsmEvent::UserConfirmed, json!({})), FsmState::Executing);
    }

    #[test]
    fn denial_cancels() {
        let fsm = ConversationFsm::default();
        fsm.transition(FsmEvent::UserInput, json!({}));
        fsm.transition(FsmEvent::InputComplete, json!({}));
        fsm.transition(FsmEvent::PlanReady, json!({}));
        fsm.transition(FsmEvent::ConfirmationRequired, json!({}));
        assert_eq!(fsm.transition(FsmEvent::UserDenied, json!({})), FsmState::Cancelled);
        assert_eq!(fsm.transition(FsmEvent::Reset, json!({})), FsmState::Idle);
    }

    #[test]
    fn any_state_reaches_error_and_cancelled() {
        for state in [FsmState::Idle, FsmState::Planning, FsmState::Responding] {
            assert_eq!(legal_transition(state, FsmEvent::Error), Some(FsmState::Error));
            assert_eq!(legal_transition(state, FsmEvent::UserCancel), Some(FsmState::Cancelled));
        }
        // Terminals do not loop back into themselves through those events.
        assert_eq!(legal_transition(FsmState::Error, FsmEvent::Error), None);
        assert_eq!(legal_transition(FsmState::Cancelled, FsmEvent::UserCancel), None);
    }

    #[test]
    fn invalid_transition_is_ignored() {
        let fsm = ConversationFsm::default();
        assert_eq!(fsm.transition(FsmEvent::ToolsComplete, json!({})), FsmState::Idle);
        assert_eq!(fsm.state(), FsmState::Idle);
        assert!(fsm.history().is_empty());
    }

    #[test]
    fn history_records_every_legal_transition() {
        let fsm = ConversationFsm::default();
        fsm.transition(FsmEvent::UserInput, json!({"turn": 1}));
        fsm.transition(FsmEvent::InputComplete, json!({}));

        let history = fsm.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from_state, FsmState::Idle);
        assert_eq!(history[0].to_state, FsmState::Listening);
        assert_eq!(history[0].metadata["turn"], 1);
        // Every recorded transition is in the legal table.
        for rec in &history {
            assert_eq!(legal_transition(rec.from_state, rec.event), Some(rec.to_state));
        }
    }

    #[test]
    fn executing_timeout_auto_errors_on_read() {
        let fsm = ConversationFsm::new(FsmState::Idle, Duration::from_millis(0));
        fsm.transition(FsmEvent::UserInput, json!({}));
        fsm.transition(FsmEvent::InputComplete, json!({}));
        fsm.transition(FsmEvent::PlanReady, json!({}));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(fsm.state(), FsmState::Error);

        let last = fsm.history().last().cloned().unwrap();
        assert_eq!(last.to_state, FsmState::Error);
        assert_eq!(last.metadata["reason"], "executing_timeout");
    }

    #[test]
    fn reset_matches_fresh_fsm() {
        let fsm = ConversationFsm::default();
        fsm.transition(FsmEvent::UserInput, json!({}));
        fsm.transition(FsmEvent::Error, json!({}));
        fsm.reset();

        assert_eq!(fsm.state(), FsmState::Idle);
        assert!(fsm.history().is_empty());
        assert_eq!(fsm.transition(FsmEvent::UserInput, json!({})), FsmState::Listening);
    }

    #[test]
    fn callbacks_fire_exit_then_enter_and_isolate_panics() {
        let fsm = ConversationFsm::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        fsm.on_exit(FsmState::Idle, move |_, _, _| o.lock().unwrap().push("exit"));
        fsm.on_enter(FsmState::Listening, |_, _, _| panic!("boom"));
        let o = order.clone();
        fsm.on_enter(FsmState::Listening, move |_, _, _| o.lock().unwrap().push("enter"));

        assert_eq!(fsm.transition(FsmEvent::UserInput, json!({})), FsmState::Listening);
        assert_eq!(*order.lock().unwrap(), vec!["exit", "enter"]);
    }

    #[test]
    fn allowed_events_reflect_state() {
        let fsm = ConversationFsm::default();
        let allowed = fsm.allowed_events();
        assert!(allowed.contains(&FsmEvent::UserInput));
        assert!(allowed.contains(&FsmEvent::Error));
        assert!(!allowed.contains(&FsmEvent::ToolsComplete));

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        fsm.on_enter(FsmState::Cancelled, move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        fsm.transition(FsmEvent::UserCancel, json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(fsm.can_transition(FsmEvent::Reset));
        assert!(!fsm.can_transition(FsmEvent::UserCancel));
    }
}
