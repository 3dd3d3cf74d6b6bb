//! Finalization pipeline: turn the plan and verified tool results into
//! the spoken reply.
//!
//! Finalizer calls run through a bounded pool so concurrent sessions
//! cannot overrun the backend; the pool drains cleanly at shutdown.
//! A finalizer failure never loses the turn: the plan's own reply is the
//! first fallback, a Turkish apology the last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::conversation::bargein::CancellationToken;
use crate::metrics::MetricsCollector;
use crate::tools::registry::ToolExecution;
use crate::voice::style::{apology_reply, format_voice_reply, StyleOptions};

use super::client::{ChatMessage, LlmClient};
use super::plan::RouterPlan;
use super::tier::FinalizerTier;

const FINALIZER_TEMPERATURE: f64 = 0.4;
const FINALIZER_MAX_TOKENS: u32 = 768;

// ── Bounded pool ───────────────────────────────────────────────────────

/// Caps concurrent finalizer calls. Registered with the runtime for a
/// clean drain at process exit.
pub struct FinalizerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    shut_down: AtomicBool,
}

impl FinalizerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Run a future under a pool permit.
    pub async fn run<T>(&self, fut: impl std::future::Future<Output = T>) -> Result<T> {
        if self.is_shut_down() {
            return Err(anyhow!("finalizer pool is shut down"));
        }
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| anyhow!("finalizer pool is shut down"))?;
        let out = fut.await;
        drop(permit);
        Ok(out)
    }

    /// Drain: wait for in-flight calls to finish, then refuse new work.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Collecting every permit proves all in-flight calls completed.
        let _all = self.semaphore.acquire_many(self.size as u32).await;
        self.semaphore.close();
        tracing::debug!(size = self.size, "finalizer pool drained");
    }
}

// ── Pipeline ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct FinalizeMeta {
    pub tier: FinalizerTier,
    pub model: String,
    pub tokens_used: u64,
    /// True when the reply came from a fallback instead of the finalizer.
    pub fell_back: bool,
}

#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub reply: String,
    pub meta: FinalizeMeta,
    pub cancelled: bool,
}

pub struct FinalizationPipeline {
    fast: Arc<dyn LlmClient>,
    fast_model: String,
    quality: Option<Arc<dyn LlmClient>>,
    quality_model: String,
    pool: Arc<FinalizerPool>,
    metrics: Arc<MetricsCollector>,
    style: StyleOptions,
}

impl FinalizationPipeline {
    pub fn new(
        fast: Arc<dyn LlmClient>,
        fast_model: &str,
        quality: Option<Arc<dyn LlmClient>>,
        quality_model: &str,
        pool: Arc<FinalizerPool>,
        metrics: Arc<MetricsCollector>,
        style: StyleOptions,
    ) -> Self {
        Self {
            fast,
            fast_model: fast_model.to_string(),
            quality,
            quality_model: quality_model.to_string(),
            pool,
            metrics,
            style,
        }
    }

    pub fn quality_available(&self) -> bool {
        self.quality.is_some()
    }

    /// Produce the user-visible reply. Never fails; the outcome records
    /// which path produced the text.
    pub async fn finalize(
        &self,
        user_input: &str,
        plan: &RouterPlan,
        verified: &[ToolExecution],
        tier: FinalizerTier,
        cancel: &CancellationToken,
    ) -> FinalizeOutcome {
        let (client, model) = match tier {
            FinalizerTier::Quality => match &self.quality {
                Some(q) => (q.clone(), self.quality_model.clone()),
                None => (self.fast.clone(), self.fast_model.clone()),
            },
            FinalizerTier::Fast => (self.fast.clone(), self.fast_model.clone()),
        };

        let messages = self.build_messages(user_input, plan, verified);
        let start = Instant::now();

        let call = self.pool.run(async {
            client
                .chat_detailed(&messages, FINALIZER_TEMPERATURE, FINALIZER_MAX_TOKENS)
                .await
        });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = call => Some(result),
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record_value("finalize_ms", elapsed_ms, "ms");

        let Some(result) = result else {
            // Cancelled mid-call: abandon partial output.
            return FinalizeOutcome {
                reply: String::new(),
                meta: FinalizeMeta {
                    tier,
                    model,
                    tokens_used: 0,
                    fell_back: false,
                },
                cancelled: true,
            };
        };

        match result {
            Ok(Ok(response)) if !response.content.trim().is_empty() => FinalizeOutcome {
                reply: format_voice_reply(&response.content, &self.style),
                meta: FinalizeMeta {
                    tier,
                    model: if response.model.is_empty() { model } else { response.model },
                    tokens_used: response.tokens_used,
                    fell_back: false,
                },
                cancelled: false,
            },
            other => {
                if let Ok(Err(e)) | Err(e) = other {
                    tracing::warn!(error = %e, tier = tier.as_str(), "finalizer call failed");
                }
                let reply = if !plan.assistant_reply.trim().is_empty() {
                    plan.assistant_reply.clone()
                } else {
                    apology_reply(user_input).to_string()
                };
                FinalizeOutcome {
                    reply: format_voice_reply(&reply, &self.style),
                    meta: FinalizeMeta {
                        tier,
                        model,
                        tokens_used: 0,
                        fell_back: true,
                    },
                    cancelled: false,
                }
            }
        }
    }

    fn build_messages(
        &self,
        user_input: &str,
        plan: &RouterPlan,
        verified: &[ToolExecution],
    ) -> Vec<ChatMessage> {
        let failed: Vec<&str> = verified
            .iter()
            .filter(|r| !r.success())
            .map(|r| r.tool.as_str())
            .collect();

        let system = format!(
            "Sen Türkçe konuşan, kibar ve öz bir sesli asistansın. Kurallar:\n\
             - \"Efendim\" kelimesini en fazla bir kez kullan.\n\
             - En fazla {} cümle kur; konuşma diliyle yaz, madde işareti kullanma.\n\
             - Araç sonuçlarındaki bilgiyi aynen aktar, uydurma.\n\
             {}",
            self.style.max_sentences,
            if failed.is_empty() {
                String::new()
            } else {
                format!(
                    "- Şu araçlar başarısız oldu: {}. Kibarca özür dile ve elindeki bilgiyle yardımcı ol.",
                    failed.join(", ")
                )
            }
        );

        let results_json: Vec<serde_json::Value> = verified
            .iter()
            .map(|r| {
                json!({
                    "tool": r.tool,
                    "success": r.success(),
                    "result": r.result(),
                    "error": if r.error_text().is_empty() { None } else { Some(r.error_text()) },
                })
            })
            .collect();

        let user = format!(
            "KULLANICI: {user_input}\n\nPLAN: {}\n\nARAÇ SONUÇLARI: {}\n\nKullanıcıya söylenecek yanıtı yaz.",
            serde_json::to_string(plan).unwrap_or_else(|_| "{}".to_string()),
            serde_json::Value::Array(results_json),
        );

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }
}
