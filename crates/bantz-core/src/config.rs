//! Brain configuration.
//!
//! All options are optional; `BrainConfig::default()` is a working dev
//! setup and `BrainConfig::from_env()` layers the `BANTZ_*` environment
//! variables on top, the same precedence every entry point uses.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn env_get_any(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// Forced finalizer tier, parsed from `BANTZ_TIER_FORCE_FINALIZER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForcedTier {
    Fast,
    Quality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    // ── Router / finalizer backends ────────────────────────────────────
    /// Where the router client sends plan prompts (OpenAI-compatible).
    pub router_url: String,
    /// Router model name, included in prompts and telemetry.
    pub router_model: String,
    /// Quality finalizer API key. Absent → fast tier only.
    pub finalizer_key: Option<String>,
    /// Quality finalizer model name.
    pub finalizer_model: String,
    /// Forced tier override (`BANTZ_TIER_FORCE_FINALIZER=fast|quality`).
    pub force_tier: Option<ForcedTier>,

    // ── Planning ───────────────────────────────────────────────────────
    /// Below this confidence, a plan with `ask_user` short-circuits to a
    /// clarification question.
    pub confidence_threshold: f64,

    // ── FSM / timeouts ─────────────────────────────────────────────────
    /// EXECUTING auto-transitions to ERROR after this long.
    pub executing_timeout: Duration,
    /// Circuit breaker: consecutive failures before the circuit opens.
    pub circuit_failure_threshold: u32,
    /// Circuit breaker: how long an open circuit stays closed to traffic.
    pub circuit_recovery_timeout: Duration,
    /// Per-tool timeout overrides (seconds), merged over the built-in table.
    pub tool_timeouts: HashMap<String, f64>,
    /// Pending confirmations expire after this long.
    pub confirmation_ttl: Duration,

    // ── Observability ──────────────────────────────────────────────────
    /// Metrics ring buffer size.
    pub metrics_max_records: usize,
    /// Metrics JSONL flush target. `None` → in-memory only.
    pub metrics_jsonl_path: Option<PathBuf>,
    /// Audit log path. `None` → `~/.bantz/audit.jsonl`.
    pub audit_path: Option<PathBuf>,
    /// Audit rotation threshold in bytes.
    pub audit_max_bytes: u64,
    /// Rotated audit backups to keep.
    pub audit_max_backups: u32,
    /// Apply PII redaction to audit records.
    pub audit_redact: bool,
    /// Enable the external run-tracker/DB writer side channel.
    pub observability: bool,

    // ── Finalization ───────────────────────────────────────────────────
    /// Maximum concurrent finalizer calls.
    pub finalizer_pool_size: usize,
    /// Voice-style: strip emoji from replies.
    pub strip_emoji: bool,
    /// Voice-style: cap on sentences per spoken reply.
    pub max_sentences: usize,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            router_url: "http://localhost:8001".to_string(),
            router_model: "Qwen/Qwen2.5-3B-Instruct-AWQ".to_string(),
            finalizer_key: None,
            finalizer_model: "gemini-2.0-flash".to_string(),
            force_tier: None,
            confidence_threshold: 0.7,
            executing_timeout: Duration::from_secs(60),
            circuit_failure_threshold: 3,
            circuit_recovery_timeout: Duration::from_secs(60),
            tool_timeouts: HashMap::new(),
            confirmation_ttl: Duration::from_secs(300),
            metrics_max_records: 10_000,
            metrics_jsonl_path: None,
            audit_path: None,
            audit_max_bytes: 50 * 1024 * 1024,
            audit_max_backups: 5,
            audit_redact: true,
            observability: false,
            finalizer_pool_size: 4,
            strip_emoji: true,
            max_sentences: 6,
        }
    }
}

impl BrainConfig {
    /// Build a config from `BANTZ_*` environment variables layered over the
    /// defaults. Unset variables leave the default untouched.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(url) = env_get_any(&["BANTZ_VLLM_URL", "BANTZ_ROUTER_URL"]) {
            cfg.router_url = url;
        }
        if let Some(model) = env_get_any(&["BANTZ_VLLM_MODEL", "BANTZ_ROUTER_MODEL"]) {
            cfg.router_model = model;
        }
        cfg.finalizer_key = env_get_any(&[
            "GEMINI_API_KEY",
            "GOOGLE_API_KEY",
            "BANTZ_FINALIZER_API_KEY",
        ]);
        if let Some(model) = env_get_any(&["BANTZ_GEMINI_MODEL", "BANTZ_FINALIZER_MODEL"]) {
            cfg.finalizer_model = model;
        }
        cfg.force_tier = match env_get_any(&["BANTZ_TIER_FORCE_FINALIZER"]).as_deref() {
            Some("quality") => Some(ForcedTier::Quality),
            Some("fast") => Some(ForcedTier::Fast),
            _ => None,
        };
        if let Some(v) = env_get_any(&["BANTZ_CONFIDENCE_THRESHOLD"]) {
            if let Ok(t) = v.parse::<f64>() {
                cfg.confidence_threshold = t;
            }
        }
        if let Some(v) = env_get_any(&["BANTZ_AUDIT_PATH"]) {
            cfg.audit_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_get_any(&["BANTZ_METRICS_JSONL"]) {
            cfg.metrics_jsonl_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_get_any(&["BANTZ_OBSERVABILITY"]) {
            cfg.observability = matches!(v.as_str(), "1" | "true" | "on");
        }

        cfg
    }

    /// Resolved audit log path (`~/.bantz/audit.jsonl` when unset).
    pub fn audit_path_or_default(&self) -> PathBuf {
        self.audit_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".bantz")
                .join("audit.jsonl")
        })
    }
}
