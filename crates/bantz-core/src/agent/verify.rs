//! Post-execution verification with a single idempotent retry.
//!
//! Sits between tool execution and finalization. Empty results from
//! query tools count as valid "no data"; safety-rejected results are
//! terminal; only tools on the explicit idempotent whitelist are ever
//! retried, exactly once. Mutating tools (create/send/delete) never
//! appear on the whitelist.

use std::collections::HashSet;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::tools::registry::ToolExecution;

/// Retry callback: `(tool, original) → new execution`.
pub type RetryFn<'a> =
    Box<dyn Fn(&str, &ToolExecution) -> BoxFuture<'a, ToolExecution> + Send + Sync + 'a>;

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub max_retries: u32,
    pub retry_empty: bool,
    pub retry_errors: bool,
    /// Idempotent, non-destructive tools safe to retry.
    pub retryable_tools: HashSet<String>,
    /// Tools for which an empty result is a valid "no data found".
    pub valid_empty_tools: HashSet<String>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        let retryable = [
            "calendar.list_events",
            "calendar.find_free_slots",
            "gmail.list_messages",
            "gmail.unread_count",
            "gmail.get_message",
            "gmail.smart_search",
            "contacts.list",
            "contacts.resolve",
            "time.now",
            "system.status",
        ];
        let valid_empty = [
            "calendar.list_events",
            "calendar.find_free_slots",
            "gmail.list_messages",
            "gmail.smart_search",
            "contacts.list",
        ];
        Self {
            max_retries: 1,
            retry_empty: true,
            retry_errors: true,
            retryable_tools: retryable.iter().map(|s| s.to_string()).collect(),
            valid_empty_tools: valid_empty.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Verification outcome for one tool result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolVerification {
    pub tool: String,
    pub original_success: bool,
    pub is_empty: bool,
    pub is_error: bool,
    pub retried: bool,
    pub retry_success: bool,
    pub final_success: bool,
    pub error_message: String,
}

/// Aggregate verification result for a turn.
#[derive(Debug, Default, Serialize)]
pub struct VerifyResult {
    pub verified: bool,
    pub tools_ok: usize,
    pub tools_retry: usize,
    pub tools_fail: usize,
    pub per_tool: Vec<ToolVerification>,
    #[serde(skip)]
    pub verified_results: Vec<ToolExecution>,
    pub elapsed_ms: u64,
}

impl VerifyResult {
    pub fn trace_line(&self) -> String {
        format!(
            "[verify] verified={} tools_ok={} tools_retry={} tools_fail={} elapsed={}ms",
            self.verified, self.tools_ok, self.tools_retry, self.tools_fail, self.elapsed_ms
        )
    }
}

/// Verify a turn's tool results, retrying whitelisted failures once
/// through `retry_fn`.
pub async fn verify_tool_results(
    results: Vec<ToolExecution>,
    config: &VerifyConfig,
    retry_fn: Option<RetryFn<'_>>,
) -> VerifyResult {
    let start = Instant::now();
    let mut out = VerifyResult::default();

    for result in results {
        let mut check = ToolVerification {
            tool: result.tool.clone(),
            original_success: result.success(),
            is_empty: result.is_empty(),
            is_error: !result.success(),
            ..Default::default()
        };

        // Empty is a valid answer for query tools ("no events today").
        if check.is_empty && config.valid_empty_tools.contains(&result.tool) {
            check.final_success = true;
            out.tools_ok += 1;
            out.verified_results.push(result);
            out.per_tool.push(check);
            continue;
        }

        // Safety rejections are terminal, never retried.
        if result.is_safety_rejected() {
            check.final_success = false;
            check.error_message = "safety_rejected — not retriable".to_string();
            out.tools_fail += 1;
            out.verified_results.push(result);
            out.per_tool.push(check);
            continue;
        }

        let needs_retry = ((check.is_empty && config.retry_empty)
            || (check.is_error && config.retry_errors))
            && config.max_retries > 0
            && retry_fn.is_some();
        let can_retry = config.retryable_tools.contains(&result.tool);

        if needs_retry && can_retry {
            check.retried = true;
            out.tools_retry += 1;

            let retry = retry_fn.as_ref().expect("checked above");
            let mut fresh = retry(&result.tool, &result).await;
            if fresh.success() && !fresh.is_empty() {
                check.retry_success = true;
                check.final_success = true;
                fresh.retried = true;
                out.tools_ok += 1;
                out.verified_results.push(fresh);
            } else {
                check.final_success = false;
                check.error_message = if fresh.error_text().is_empty() {
                    "retry returned empty".to_string()
                } else {
                    fresh.error_text().to_string()
                };
                out.tools_fail += 1;
                out.verified_results.push(result);
            }
        } else if check.is_empty || check.is_error {
            check.final_success = false;
            check.error_message = if result.error_text().is_empty() {
                "empty result".to_string()
            } else {
                result.error_text().to_string()
            };
            out.tools_fail += 1;
            out.verified_results.push(result);
        } else {
            check.final_success = true;
            out.tools_ok += 1;
            out.verified_results.push(result);
        }

        out.per_tool.push(check);
    }

    out.verified = out.tools_fail == 0;
    out.elapsed_ms = start.elapsed().as_millis() as u64;

    if out.verified {
        tracing::debug!("{}", out.trace_line());
    } else {
        tracing::warn!("{}", out.trace_line());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ok(tool: &str) -> ToolExecution {
        ToolExecution::ok(tool, json!({"ok": true, "items": [1]}), 2.0)
    }

    fn empty(tool: &str) -> ToolExecution {
        ToolExecution::ok(tool, json!([]), 2.0)
    }

    fn failed(tool: &str) -> ToolExecution {
        ToolExecution::error(tool, "backend 500", 2.0)
    }

    fn retry_returning(result: ToolExecution, counter: Arc<AtomicUsize>) -> RetryFn<'static> {
        Box::new(move |_tool, _orig| {
            let result = result.clone();
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                result
            })
        })
    }

    #[tokio::test]
    async fn all_ok_passes_through() {
        let out = verify_tool_results(
            vec![ok("calendar.list_events"), ok("time.now")],
            &VerifyConfig::default(),
            None,
        )
        .await;

        assert!(out.verified);
        assert_eq!(out.tools_ok, 2);
        assert_eq!(out.tools_retry, 0);
        assert_eq!(out.tools_fail, 0);
        assert_eq!(out.verified_results.len(), 2);
    }

    #[tokio::test]
    async fn empty_from_query_tool_is_valid() {
        let out = verify_tool_results(
            vec![empty("calendar.list_events")],
            &VerifyConfig::default(),
            None,
        )
        .await;

        assert!(out.verified);
        assert_eq!(out.tools_ok, 1);
        assert!(!out.per_tool[0].retried);
    }

    #[tokio::test]
    async fn failed_whitelisted_tool_retried_once_and_substituted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retry = retry_returning(ok("gmail.list_messages"), calls.clone());

        let out = verify_tool_results(
            vec![failed("gmail.list_messages")],
            &VerifyConfig::default(),
            Some(retry),
        )
        .await;

        assert!(out.verified);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.tools_retry, 1);
        assert_eq!(out.tools_ok, 1);
        assert!(out.verified_results[0].retried);
        assert!(out.verified_results[0].success());
    }

    #[tokio::test]
    async fn retry_failure_keeps_original_and_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retry = retry_returning(failed("gmail.list_messages"), calls.clone());

        let out = verify_tool_results(
            vec![failed("gmail.list_messages")],
            &VerifyConfig::default(),
            Some(retry),
        )
        .await;

        assert!(!out.verified);
        assert_eq!(out.tools_fail, 1);
        assert!(!out.verified_results[0].retried);
        assert!(out.per_tool[0].retried);
        assert!(!out.per_tool[0].retry_success);
    }

    #[tokio::test]
    async fn mutating_tool_never_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retry = retry_returning(ok("gmail.send"), calls.clone());

        let out = verify_tool_results(
            vec![failed("gmail.send")],
            &VerifyConfig::default(),
            Some(retry),
        )
        .await;

        assert!(!out.verified);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!out.per_tool[0].retried);
        assert!(!out.verified_results[0].retried);
    }

    #[tokio::test]
    async fn safety_rejected_never_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retry = retry_returning(ok("calendar.list_events"), calls.clone());

        let rejected = ToolExecution::safety_rejected("calendar.list_events", "blocked by policy");
        let out = verify_tool_results(vec![rejected], &VerifyConfig::default(), Some(retry)).await;

        assert!(!out.verified);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(out.per_tool[0].error_message, "safety_rejected — not retriable");
    }

    #[tokio::test]
    async fn successful_result_not_retried_even_if_whitelisted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retry = retry_returning(ok("time.now"), calls.clone());

        let out = verify_tool_results(vec![ok("time.now")], &VerifyConfig::default(), Some(retry)).await;

        assert!(out.verified);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!out.verified_results[0].retried);
    }

    #[tokio::test]
    async fn empty_list_with_no_retry_fn_fails() {
        let out = verify_tool_results(
            vec![empty("gmail.get_message")],
            &VerifyConfig::default(),
            None,
        )
        .await;
        assert!(!out.verified);
        assert_eq!(out.tools_fail, 1);
    }

    #[test]
    fn trace_line_format() {
        let out = VerifyResult {
            verified: true,
            tools_ok: 2,
            tools_retry: 1,
            tools_fail: 0,
            elapsed_ms: 7,
            ..Default::default()
        };
        assert_eq!(
            out.trace_line(),
            "[verify] verified=true tools_ok=2 tools_retry=1 tools_fail=0 elapsed=7ms"
        );
    }
}
