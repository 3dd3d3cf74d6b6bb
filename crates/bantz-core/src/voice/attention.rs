//! FSM-driven voice attention gate.
//!
//! Maps conversation states to listening modes and filters audio events:
//! FULL_LISTEN processes everything, WAKE_ONLY needs the wakeword,
//! COMMAND_ONLY passes wakeword or interrupt keywords, MUTED drops all.
//! TTS start mutes the gate; TTS end restores the saved mode.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionMode {
    FullListen,
    WakeOnly,
    CommandOnly,
    Muted,
}

impl AttentionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionMode::FullListen => "full_listen",
            AttentionMode::WakeOnly => "wake_only",
            AttentionMode::CommandOnly => "command_only",
            AttentionMode::Muted => "muted",
        }
    }
}

/// Fixed FSM state → attention mode mapping. Unknown states return `None`
/// and leave the gate untouched.
pub fn mode_for_state(state: &str) -> Option<AttentionMode> {
    match state {
        "idle" | "listening" | "confirming" | "error" | "cancelled" => {
            Some(AttentionMode::FullListen)
        }
        "thinking" | "planning" => Some(AttentionMode::WakeOnly),
        "executing" => Some(AttentionMode::CommandOnly),
        "speaking" | "responding" => Some(AttentionMode::Muted),
        _ => None,
    }
}

/// An incoming audio event for gate filtering.
#[derive(Debug, Clone, Default)]
pub struct AudioEvent {
    pub is_wakeword: bool,
    pub is_interrupt_keyword: bool,
    pub is_speech: bool,
    pub text: String,
}

/// Record of one mode change.
#[derive(Debug, Clone, Serialize)]
pub struct ModeTransition {
    pub old_mode: AttentionMode,
    pub new_mode: AttentionMode,
    pub reason: String,
}

type ModeCallback = Box<dyn Fn(AttentionMode, AttentionMode, &str) + Send + Sync>;

struct GateInner {
    mode: AttentionMode,
    pre_mute_mode: Option<AttentionMode>,
    wakeword_override_until: Option<Instant>,
    transitions: Vec<ModeTransition>,
    callbacks: Vec<ModeCallback>,
}

/// Attention gate with interior locking; FSM callbacks and the audio
/// thread both call in.
pub struct AttentionGate {
    inner: Mutex<GateInner>,
    wakeword_override_duration: Duration,
    max_history: usize,
}

impl Default for AttentionGate {
    fn default() -> Self {
        Self::new(AttentionMode::FullListen, Duration::from_secs(10), 500)
    }
}

impl AttentionGate {
    pub fn new(
        initial_mode: AttentionMode,
        wakeword_override_duration: Duration,
        max_history: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                mode: initial_mode,
                pre_mute_mode: None,
                wakeword_override_until: None,
                transitions: Vec::new(),
                callbacks: Vec::new(),
            }),
            wakeword_override_duration,
            max_history,
        }
    }

    /// Current mode, after expiring a stale wakeword override.
    pub fn mode(&self) -> AttentionMode {
        let mut inner = self.inner.lock().expect("gate lock poisoned");
        self.expire_wakeword_override(&mut inner);
        inner.mode
    }

    pub fn set_mode(&self, mode: AttentionMode, reason: &str) {
        let mut inner = self.inner.lock().expect("gate lock poisoned");
        if inner.mode == mode {
            return;
        }
        let old = inner.mode;
        inner.mode = mode;
        self.record(&mut inner, old, mode, reason);
    }

    /// FSM state-change hook: map the new state and update the mode.
    pub fn on_state_change(&self, old_state: &str, new_state: &str) {
        let Some(target) = mode_for_state(new_state) else {
            tracing::warn!(state = new_state, "unknown FSM state for attention mapping");
            return;
        };

        let mut inner = self.inner.lock().expect("gate lock poisoned");
        if inner.mode == target {
            return;
        }
        let old = inner.mode;
        inner.mode = target;
        inner.wakeword_override_until = None;
        let reason = format!("fsm:{old_state}->{new_state}");
        self.record(&mut inner, old, target, &reason);
    }

    /// Mute while TTS is speaking; the pre-mute mode is saved.
    pub fn on_tts_start(&self) {
        let mut inner = self.inner.lock().expect("gate lock poisoned");
        if inner.mode == AttentionMode::Muted {
            return;
        }
        let old = inner.mode;
        inner.pre_mute_mode = Some(old);
        inner.mode = AttentionMode::Muted;
        self.record(&mut inner, old, AttentionMode::Muted, "tts_start");
    }

    /// Restore the saved mode (or FULL_LISTEN) after TTS finishes.
    pub fn on_tts_end(&self) {
        let mut inner = self.inner.lock().expect("gate lock poisoned");
        if inner.mode != AttentionMode::Muted {
            return;
        }
        let restore = inner.pre_mute_mode.take().unwrap_or(AttentionMode::FullListen);
        let old = inner.mode;
        inner.mode = restore;
        self.record(&mut inner, old, restore, "tts_end");
    }

    /// Decide whether an audio event passes the gate. A wakeword in
    /// COMMAND_ONLY additionally opens the gate to FULL_LISTEN for the
    /// override window.
    pub fn should_process(&self, event: &AudioEvent) -> bool {
        let mut inner = self.inner.lock().expect("gate lock poisoned");
        self.expire_wakeword_override(&mut inner);

        match inner.mode {
            AttentionMode::FullListen => true,
            AttentionMode::Muted => false,
            AttentionMode::WakeOnly => event.is_wakeword,
            AttentionMode::CommandOnly => {
                if event.is_wakeword {
                    let old = inner.mode;
                    inner.mode = AttentionMode::FullListen;
                    inner.wakeword_override_until =
                        Some(Instant::now() + self.wakeword_override_duration);
                    self.record(&mut inner, old, AttentionMode::FullListen, "wakeword_override");
                    true
                } else {
                    event.is_interrupt_keyword
                }
            }
        }
    }

    /// Subscribe a gate to `fsm.state_changed` events so FSM transitions
    /// drive the listening mode without direct coupling.
    pub fn attach_to_bus(gate: &std::sync::Arc<Self>, bus: &crate::events::EventBus) {
        let gate = gate.clone();
        bus.subscribe("fsm.state_changed", move |event| {
            let old = event.data.get("old_state").and_then(|v| v.as_str()).unwrap_or("");
            let new = event.data.get("new_state").and_then(|v| v.as_str()).unwrap_or("");
            gate.on_state_change(old, new);
        });
    }

    /// Register a `(old, new, reason)` callback for mode transitions.
    pub fn on_mode_change<F>(&self, callback: F)
    where
        F: Fn(AttentionMode, AttentionMode, &str) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("gate lock poisoned");
        inner.callbacks.push(Box::new(callback));
    }

    /// Copy of the mode transition history.
    pub fn transitions(&self) -> Vec<ModeTransition> {
        self.inner.lock().expect("gate lock poisoned").transitions.clone()
    }

    fn expire_wakeword_override(&self, inner: &mut GateInner) {
        let expired = inner
            .wakeword_override_until
            .is_some_and(|until| Instant::now() > until);
        if expired {
            let old = inner.mode;
            inner.mode = AttentionMode::CommandOnly;
            inner.wakeword_override_until = None;
            self.record(inner, old, AttentionMode::CommandOnly, "wakeword_override_expired");
        }
    }

    fn record(&self, inner: &mut GateInner, old: AttentionMode, new: AttentionMode, reason: &str) {
        inner.transitions.push(ModeTransition {
            old_mode: old,
            new_mode: new,
            reason: reason.to_string(),
        });
        let len = inner.transitions.len();
        if len > self.max_history {
            inner.transitions.drain(..len - self.max_history);
        }

        tracing::info!(old = old.as_str(), new = new.as_str(), reason, "attention mode change");

        for cb in &inner.callbacks {
            if catch_unwind(AssertUnwindSafe(|| cb(old, new, reason))).is_err() {
                tracing::warn!("attention mode callback panicked; continuing");
            }
        }
    }
}
