//! Per-tool timeout enforcement and circuit breaking.
//!
//! After `failure_threshold` consecutive failures a tool's circuit opens
//! and calls are refused without running, until `recovery_timeout` elapses;
//! the next state read then moves the breaker to half-open, where a single
//! probe decides between closing and re-opening.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::registry::{ToolExecution, ToolFuture, ToolOutcome};

/// Built-in per-tool timeout table (seconds). Google APIs can be slow on
/// writes; local tools are tight.
fn builtin_timeout(tool: &str) -> Option<Duration> {
    let secs = match tool {
        "calendar.list_events" => 10.0,
        "calendar.create_event" => 15.0,
        "calendar.update_event" => 15.0,
        "calendar.delete_event" => 10.0,
        "calendar.find_free_slots" => 12.0,
        "gmail.list_messages" => 10.0,
        "gmail.get_message" => 8.0,
        "gmail.send" => 15.0,
        "gmail.smart_search" => 12.0,
        "gmail.archive" => 8.0,
        "gmail.generate_reply" => 20.0,
        "time.now" => 2.0,
        "system.status" => 5.0,
        "system.open_app" => 10.0,
        "system.shutdown" => 5.0,
        "browser.open" => 10.0,
        "browser.search" => 15.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs))
}

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

// ── Circuit breaker ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-tool breaker. Interior mutability so the manager can hand out
/// shared references while probes mutate state.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Current state. Reading auto-transitions Open → HalfOpen once the
    /// recovery timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed >= self.recovery_timeout {
                inner.state = CircuitState::HalfOpen;
            }
        }
        inner.state
    }

    pub fn is_available(&self) -> bool {
        matches!(self.state(), CircuitState::Closed | CircuitState::HalfOpen)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").consecutive_failures
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(Instant::now());
        if inner.consecutive_failures >= self.failure_threshold {
            inner.state = CircuitState::Open;
            tracing::warn!(
                failures = inner.consecutive_failures,
                recovery_secs = self.recovery_timeout.as_secs(),
                "circuit breaker opened"
            );
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
        inner.last_failure_at = None;
    }

    #[cfg(test)]
    fn backdate_last_failure(&self, by: Duration) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if let Some(t) = inner.last_failure_at {
            inner.last_failure_at = Some(t - by);
        }
    }
}

// ── Manager ────────────────────────────────────────────────────────────

/// Per-tool breaker status row for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub available: bool,
}

/// Manages per-tool timeouts and circuit breakers. Share via `Arc`.
pub struct ToolTimeoutManager {
    default_timeout: Duration,
    failure_threshold: u32,
    recovery_timeout: Duration,
    overrides: HashMap<String, Duration>,
    breakers: Mutex<HashMap<String, std::sync::Arc<CircuitBreaker>>>,
}

impl Default for ToolTimeoutManager {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT, 3, Duration::from_secs(60), HashMap::new())
    }
}

impl ToolTimeoutManager {
    pub fn new(
        default_timeout: Duration,
        failure_threshold: u32,
        recovery_timeout: Duration,
        override_secs: HashMap<String, f64>,
    ) -> Self {
        let overrides = override_secs
            .into_iter()
            .map(|(k, v)| (k, Duration::from_secs_f64(v)))
            .collect();
        Self {
            default_timeout,
            failure_threshold,
            recovery_timeout,
            overrides,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Effective timeout for a tool: config override → built-in table →
    /// default.
    pub fn timeout_for(&self, tool: &str) -> Duration {
        self.overrides
            .get(tool)
            .copied()
            .or_else(|| builtin_timeout(tool))
            .unwrap_or(self.default_timeout)
    }

    fn breaker(&self, tool: &str) -> std::sync::Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("breaker map lock poisoned");
        breakers
            .entry(tool.to_string())
            .or_insert_with(|| {
                std::sync::Arc::new(CircuitBreaker::new(
                    self.failure_threshold,
                    self.recovery_timeout,
                ))
            })
            .clone()
    }

    pub fn is_available(&self, tool: &str) -> bool {
        self.breaker(tool).is_available()
    }

    pub fn circuit_state(&self, tool: &str) -> CircuitState {
        self.breaker(tool).state()
    }

    /// Run a tool task under the tool's timeout and circuit breaker.
    ///
    /// Never returns an error: timeouts, open circuits, and task failures
    /// all come back as a [`ToolExecution`] envelope.
    pub async fn execute(
        &self,
        tool: &str,
        task: ToolFuture,
        override_timeout: Option<Duration>,
    ) -> ToolExecution {
        let breaker = self.breaker(tool);

        if !breaker.is_available() {
            return ToolExecution {
                tool: tool.to_string(),
                outcome: ToolOutcome::CircuitOpen {
                    error: format!("Araç geçici olarak devre dışı ({tool}, circuit open)"),
                },
                elapsed_ms: 0.0,
                retried: false,
                turn_id: String::new(),
                step_index: 0,
            };
        }

        let timeout = override_timeout.unwrap_or_else(|| self.timeout_for(tool));
        let start = Instant::now();

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => {
                breaker.record_success();
                ToolExecution::ok(tool, result, elapsed_ms(start))
            }
            Ok(Err(err)) => {
                breaker.record_failure();
                ToolExecution::error(tool, err.to_string(), elapsed_ms(start))
            }
            Err(_) => {
                breaker.record_failure();
                let elapsed = elapsed_ms(start);
                tracing::warn!(
                    tool,
                    elapsed_ms = elapsed,
                    timeout_secs = timeout.as_secs_f64(),
                    "tool execution timed out"
                );
                ToolExecution {
                    tool: tool.to_string(),
                    outcome: ToolOutcome::Timeout {
                        error: format!(
                            "İşlem zaman aşımına uğradı ({tool}, {:.0}s)",
                            timeout.as_secs_f64()
                        ),
                    },
                    elapsed_ms: elapsed,
                    retried: false,
                    turn_id: String::new(),
                    step_index: 0,
                }
            }
        }
    }

    /// Per-tool breaker status for every tool seen so far.
    pub fn dashboard(&self) -> HashMap<String, BreakerStatus> {
        let breakers = self.breakers.lock().expect("breaker map lock poisoned");
        breakers
            .iter()
            .map(|(name, b)| {
                (
                    name.clone(),
                    BreakerStatus {
                        state: b.state(),
                        consecutive_failures: b.consecutive_failures(),
                        available: b.is_available(),
                    },
                )
            })
            .collect()
    }

    pub fn reset_breaker(&self, tool: &str) {
        if let Some(b) = self.breakers.lock().expect("breaker map lock poisoned").get(tool) {
            b.reset();
        }
    }

    pub fn reset_all(&self) {
        for b in self.breakers.lock().expect("breaker map lock poisoned").values() {
            b.reset();
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_breaker(&self, tool: &str, by: Duration) {
        self.breaker(tool).backdate_last_failure(by);
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
