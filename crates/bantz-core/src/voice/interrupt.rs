//! Interrupt controller: STOP / CANCEL / PAUSE / RESUME signals.
//!
//! Signals arrive from voice keywords, Ctrl-C, or the API; the
//! orchestrator polls `check_before_tool` between tool executions.
//! External threads may block in `wait`, so the controller is a plain
//! mutex + condvar state machine.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptType {
    Stop,
    Cancel,
    Pause,
    Resume,
}

impl InterruptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptType::Stop => "stop",
            InterruptType::Cancel => "cancel",
            InterruptType::Pause => "pause",
            InterruptType::Resume => "resume",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InterruptSignal {
    pub interrupt_type: InterruptType,
    pub source: String,
    #[serde(skip)]
    pub timestamp: Option<Instant>,
    pub metadata: HashMap<String, String>,
}

impl InterruptSignal {
    fn new(interrupt_type: InterruptType, source: &str, metadata: HashMap<String, String>) -> Self {
        Self {
            interrupt_type,
            source: source.to_string(),
            timestamp: Some(Instant::now()),
            metadata,
        }
    }
}

type Handler = Box<dyn Fn(&InterruptSignal) + Send + Sync>;

struct RegisteredHandler {
    id: u64,
    priority: i32,
    handler: Handler,
}

struct ControllerInner {
    pending: Option<InterruptSignal>,
    paused: bool,
    history: Vec<InterruptSignal>,
    handlers: Vec<RegisteredHandler>,
    next_handler_id: u64,
    ctrl_c_count: u32,
    ctrl_c_at: Option<Instant>,
}

/// Ctrl-C double-press window: first press cancels, second within the
/// window stops, expiry resets to first-press semantics.
const CTRL_C_WINDOW: Duration = Duration::from_secs(2);

pub struct InterruptController {
    inner: Mutex<ControllerInner>,
    signalled: Condvar,
    max_history: usize,
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new(100)
    }
}

impl InterruptController {
    pub fn new(max_history: usize) -> Self {
        Self {
            inner: Mutex::new(ControllerInner {
                pending: None,
                paused: false,
                history: Vec::new(),
                handlers: Vec::new(),
                next_handler_id: 0,
                ctrl_c_count: 0,
                ctrl_c_at: None,
            }),
            signalled: Condvar::new(),
            max_history,
        }
    }

    /// Place a pending signal, update the pause flag, record history,
    /// and dispatch handlers in priority order (highest first).
    pub fn signal(
        &self,
        interrupt_type: InterruptType,
        source: &str,
        metadata: HashMap<String, String>,
    ) {
        let signal = InterruptSignal::new(interrupt_type, source, metadata);

        let mut inner = self.inner.lock().expect("interrupt lock poisoned");
        match interrupt_type {
            InterruptType::Pause => inner.paused = true,
            InterruptType::Resume => inner.paused = false,
            _ => {}
        }
        inner.history.push(signal.clone());
        let len = inner.history.len();
        if len > self.max_history {
            inner.history.drain(..len - self.max_history);
        }
        inner.pending = Some(signal.clone());

        let mut ordered: Vec<&RegisteredHandler> = inner.handlers.iter().collect();
        ordered.sort_by_key(|h| std::cmp::Reverse(h.priority));
        for entry in ordered {
            if catch_unwind(AssertUnwindSafe(|| (entry.handler)(&signal))).is_err() {
                tracing::warn!(
                    interrupt = signal.interrupt_type.as_str(),
                    "interrupt handler panicked; continuing"
                );
            }
        }
        drop(inner);

        self.signalled.notify_all();
        tracing::info!(interrupt = interrupt_type.as_str(), source, "interrupt signalled");
    }

    pub fn signal_simple(&self, interrupt_type: InterruptType) {
        self.signal(interrupt_type, "api", HashMap::new());
    }

    /// Consume the pending signal atomically.
    pub fn get_pending(&self) -> Option<InterruptSignal> {
        self.inner.lock().expect("interrupt lock poisoned").pending.take()
    }

    /// Non-consuming check.
    pub fn is_interrupted(&self) -> bool {
        self.inner.lock().expect("interrupt lock poisoned").pending.is_some()
    }

    /// PAUSE vs RESUME, last writer wins.
    pub fn is_paused(&self) -> bool {
        self.inner.lock().expect("interrupt lock poisoned").paused
    }

    /// Consume-and-return, polled by the orchestrator before each tool.
    pub fn check_before_tool(&self) -> Option<InterruptSignal> {
        self.get_pending()
    }

    /// Block until a signal arrives or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock().expect("interrupt lock poisoned");
        let (inner, result) = self
            .signalled
            .wait_timeout_while(inner, timeout, |i| i.pending.is_none())
            .expect("interrupt lock poisoned");
        drop(inner);
        !result.timed_out()
    }

    /// Register a handler; higher priority runs first. Returns an id for
    /// `unregister_handler`.
    pub fn register_handler<F>(&self, priority: i32, handler: F) -> u64
    where
        F: Fn(&InterruptSignal) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("interrupt lock poisoned");
        inner.next_handler_id += 1;
        let id = inner.next_handler_id;
        inner.handlers.push(RegisteredHandler {
            id,
            priority,
            handler: Box::new(handler),
        });
        id
    }

    pub fn unregister_handler(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().expect("interrupt lock poisoned");
        let before = inner.handlers.len();
        inner.handlers.retain(|h| h.id != id);
        inner.handlers.len() != before
    }

    /// First press within the window → CANCEL; second press → STOP;
    /// expired window resets to first-press semantics.
    pub fn handle_ctrl_c(&self) -> InterruptType {
        let interrupt = {
            let mut inner = self.inner.lock().expect("interrupt lock poisoned");
            let now = Instant::now();
            let in_window = inner
                .ctrl_c_at
                .is_some_and(|at| now.duration_since(at) <= CTRL_C_WINDOW);
            if in_window && inner.ctrl_c_count >= 1 {
                inner.ctrl_c_count = 0;
                inner.ctrl_c_at = None;
                InterruptType::Stop
            } else {
                inner.ctrl_c_count = 1;
                inner.ctrl_c_at = Some(now);
                InterruptType::Cancel
            }
        };
        self.signal(interrupt, "keyboard", HashMap::new());
        interrupt
    }

    /// Clear pending signal and pause flag; history stays.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("interrupt lock poisoned");
        inner.pending = None;
        inner.paused = false;
    }

    /// Clear everything including history.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("interrupt lock poisoned");
        inner.pending = None;
        inner.paused = false;
        inner.history.clear();
        inner.ctrl_c_count = 0;
        inner.ctrl_c_at = None;
    }

    pub fn history(&self) -> Vec<InterruptSignal> {
        self.inner.lock().expect("interrupt lock poisoned").history.clone()
    }
}

/// Scan an utterance for interrupt keywords (Turkish first, English too).
/// The two-word `devam et` is checked before any single-token match so the
/// bare substring `devam` never shadows it.
pub fn detect_keyword(text: &str) -> Option<InterruptType> {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    if lower.contains("devam et") {
        return Some(InterruptType::Resume);
    }

    for token in lower.split_whitespace() {
        let hit = match token {
            "dur" | "stop" | "kapat" | "sus" => Some(InterruptType::Stop),
            "iptal" | "cancel" | "vazgeç" | "boşver" => Some(InterruptType::Cancel),
            "bekle" | "pause" | "duraklat" => Some(InterruptType::Pause),
            "devam" | "resume" | "sürdür" => Some(InterruptType::Resume),
            _ => None,
        };
        if hit.is_some() {
            return hit;
        }
    }
    None
}
