//! Barge-in handling: cooperative cancellation and per-turn isolation.
//!
//! Starting a new turn cancels the previous one, so a stale in-flight tool
//! can never leak its result into a later turn — every result is stamped
//! with its originating turn ID and checked on arrival.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;

use crate::tools::registry::ToolExecution;

// ── Cancellation token ─────────────────────────────────────────────────

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Monotonic cancellation latch. Once cancelled it stays cancelled; a
/// fresh token is created per turn.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled (immediately if it already is).
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Block until cancelled or `timeout` elapses. Returns whether the
    /// token was cancelled.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Re-check after registering: a cancel between the first check and
        // `notified()` would otherwise be missed.
        if self.is_cancelled() {
            return true;
        }
        tokio::time::timeout(timeout, &mut notified).await.is_ok() || self.is_cancelled()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ── Turn context ───────────────────────────────────────────────────────

/// Per-turn isolation context: unique turn ID, cancellation token, and
/// the tool results produced by this turn.
pub struct TurnContext {
    turn_id: String,
    token: CancellationToken,
    results: Mutex<Vec<ToolExecution>>,
}

impl Default for TurnContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnContext {
    pub fn new() -> Self {
        Self {
            turn_id: uuid::Uuid::new_v4().to_string(),
            token: CancellationToken::new(),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stamp the result with this turn's ID and append it.
    pub fn add_tool_result(&self, mut result: ToolExecution) {
        result.turn_id = self.turn_id.clone();
        self.results.lock().expect("turn results lock poisoned").push(result);
    }

    /// Copy of the results so callers cannot mutate the turn's record.
    pub fn tool_results(&self) -> Vec<ToolExecution> {
        self.results.lock().expect("turn results lock poisoned").clone()
    }
}

// ── Barge-in handler ───────────────────────────────────────────────────

/// Narrow TTS control surface; only play-state and stop matter here.
#[async_trait]
pub trait TtsControl: Send + Sync {
    fn is_playing(&self) -> bool;
    async fn stop(&self);
}

/// A detected user utterance while the system may be speaking.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BargeInEvent {
    /// Normalized 0..1 speech volume.
    pub speech_volume: f64,
    pub speech_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BargeInAction {
    /// TTS stopped, active turn cancelled, ready for the new utterance.
    CancelTurn,
    Ignore,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BargeInStats {
    pub started_turns: u64,
    pub cancelled_turns: u64,
    pub events_handled: u64,
}

/// Tracks the active turn and cancels it on interruption.
pub struct BargeInHandler {
    tts: Option<Arc<dyn TtsControl>>,
    interrupt_threshold: f64,
    active: Mutex<Option<Arc<TurnContext>>>,
    started_turns: AtomicU64,
    cancelled_turns: AtomicU64,
    events_handled: AtomicU64,
}

impl Default for BargeInHandler {
    fn default() -> Self {
        Self::new(None, 0.3)
    }
}

impl BargeInHandler {
    pub fn new(tts: Option<Arc<dyn TtsControl>>, interrupt_threshold: f64) -> Self {
        Self {
            tts,
            interrupt_threshold,
            active: Mutex::new(None),
            started_turns: AtomicU64::new(0),
            cancelled_turns: AtomicU64::new(0),
            events_handled: AtomicU64::new(0),
        }
    }

    /// Begin a new turn. Any previous turn is cancelled first — the
    /// cancel-old-turn-on-new-turn invariant that keeps stale tool
    /// results out.
    pub fn start_turn(&self) -> Arc<TurnContext> {
        let ctx = Arc::new(TurnContext::new());
        let mut active = self.active.lock().expect("active turn lock poisoned");
        if let Some(old) = active.replace(ctx.clone()) {
            if !old.is_cancelled() {
                old.cancel();
                tracing::debug!(turn_id = old.turn_id(), "previous turn cancelled by new turn");
            }
        }
        self.started_turns.fetch_add(1, Ordering::SeqCst);
        ctx
    }

    /// Clear the active turn reference.
    pub fn finish_turn(&self) {
        let mut active = self.active.lock().expect("active turn lock poisoned");
        *active = None;
    }

    pub fn active_turn(&self) -> Option<Arc<TurnContext>> {
        self.active.lock().expect("active turn lock poisoned").clone()
    }

    /// A turn is valid while it is the active one and not cancelled.
    pub fn is_turn_valid(&self, turn_id: &str) -> bool {
        self.active
            .lock()
            .expect("active turn lock poisoned")
            .as_ref()
            .is_some_and(|ctx| ctx.turn_id() == turn_id && !ctx.is_cancelled())
    }

    /// Handle a speech event. When TTS is playing and the volume clears
    /// the threshold: stop TTS and cancel the active turn.
    pub async fn handle(&self, event: BargeInEvent) -> BargeInAction {
        self.events_handled.fetch_add(1, Ordering::SeqCst);

        if event.speech_volume < self.interrupt_threshold {
            return BargeInAction::Ignore;
        }
        if let Some(tts) = &self.tts {
            if !tts.is_playing() {
                return BargeInAction::Ignore;
            }
            tts.stop().await;
        }

        let active = self.active_turn();
        if let Some(ctx) = active {
            if !ctx.is_cancelled() {
                ctx.cancel();
                self.cancelled_turns.fetch_add(1, Ordering::SeqCst);
                tracing::info!(
                    turn_id = ctx.turn_id(),
                    volume = event.speech_volume,
                    "barge-in cancelled active turn"
                );
            }
        }

        BargeInAction::CancelTurn
    }

    pub fn stats(&self) -> BargeInStats {
        BargeInStats {
            started_turns: self.started_turns.load(Ordering::SeqCst),
            cancelled_turns: self.cancelled_turns.load(Ordering::SeqCst),
            events_handled: self.events_handled.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct FakeTts {
        playing: AtomicBool,
        stops: AtomicUsize,
    }

    impl FakeTts {
        fn new(playing: bool) -> Arc<Self> {
            Arc::new(Self {
                playing: AtomicBool::new(playing),
                stops: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TtsControl for FakeTts {
        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }
        async fn stop(&self) {
            self.playing.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn loud() -> BargeInEvent {
        BargeInEvent {
            speech_volume: 0.8,
            speech_duration_ms: 500,
        }
    }

    #[test]
    fn token_cancel_is_monotonic_and_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn wait_returns_true_on_cancel() {
        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            t.cancel();
        });
        assert!(token.wait(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn wait_returns_false_on_timeout() {
        let token = CancellationToken::new();
        assert!(!token.wait(Duration::from_millis(10)).await);
    }

    #[test]
    fn turn_ids_are_unique_and_results_stamped() {
        let a = TurnContext::new();
        let b = TurnContext::new();
        assert_ne!(a.turn_id(), b.turn_id());

        a.add_tool_result(ToolExecution::ok("calendar.list_events", json!({"ok": true}), 1.0));
        let results = a.tool_results();
        assert_eq!(results[0].turn_id, a.turn_id());
    }

    #[test]
    fn tool_results_returns_copies() {
        let ctx = TurnContext::new();
        ctx.add_tool_result(ToolExecution::ok("t1", json!({}), 0.0));
        let mut copy = ctx.tool_results();
        copy.push(ToolExecution::ok("t2", json!({}), 0.0));
        assert_eq!(ctx.tool_results().len(), 1);
    }

    #[test]
    fn start_new_turn_cancels_old() {
        let handler = BargeInHandler::default();
        let old = handler.start_turn();
        let new = handler.start_turn();
        assert!(old.is_cancelled());
        assert!(!new.is_cancelled());
        assert!(handler.is_turn_valid(new.turn_id()));
        assert!(!handler.is_turn_valid(old.turn_id()));
    }

    #[test]
    fn finish_turn_clears_active() {
        let handler = BargeInHandler::default();
        let ctx = handler.start_turn();
        handler.finish_turn();
        assert!(handler.active_turn().is_none());
        assert!(!handler.is_turn_valid(ctx.turn_id()));
    }

    #[tokio::test]
    async fn barge_in_cancels_active_turn_and_stops_tts() {
        let tts = FakeTts::new(true);
        let handler = BargeInHandler::new(Some(tts.clone()), 0.3);
        let ctx = handler.start_turn();

        let action = handler.handle(loud()).await;
        assert_eq!(action, BargeInAction::CancelTurn);
        assert!(ctx.is_cancelled());
        assert_eq!(tts.stops.load(Ordering::SeqCst), 1);
        assert_eq!(handler.stats().cancelled_turns, 1);
    }

    #[tokio::test]
    async fn quiet_speech_is_ignored() {
        let tts = FakeTts::new(true);
        let handler = BargeInHandler::new(Some(tts), 0.9);
        let ctx = handler.start_turn();

        let action = handler
            .handle(BargeInEvent {
                speech_volume: 0.3,
                speech_duration_ms: 500,
            })
            .await;
        assert_eq!(action, BargeInAction::Ignore);
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn barge_in_without_active_turn_is_safe() {
        let tts = FakeTts::new(true);
        let handler = BargeInHandler::new(Some(tts), 0.3);
        assert_eq!(handler.handle(loud()).await, BargeInAction::CancelTurn);
    }

    #[tokio::test]
    async fn double_barge_in_counts_one_cancel() {
        let tts = FakeTts::new(true);
        let handler = BargeInHandler::new(Some(tts.clone()), 0.3);
        handler.start_turn();

        handler.handle(loud()).await;
        tts.playing.store(true, Ordering::SeqCst);
        handler.handle(loud()).await;

        assert_eq!(handler.stats().cancelled_turns, 1);
        assert_eq!(handler.stats().events_handled, 2);
    }

    #[test]
    fn stale_results_keep_their_turn_id() {
        let handler = BargeInHandler::default();
        let old = handler.start_turn();
        old.add_tool_result(ToolExecution::ok("t1", json!({}), 0.0));
        let new = handler.start_turn();

        assert!(new.tool_results().is_empty());
        assert_eq!(old.tool_results()[0].tool, "t1");
        assert_eq!(old.tool_results()[0].turn_id, old.turn_id());
    }
}
