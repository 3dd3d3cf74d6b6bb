//! Canonical runtime wiring.
//!
//! `Runtime` is the explicit dependency container for the observability
//! substrate (metrics, audit, events, finalizer pool) — constructed once
//! and passed down the call graph instead of living in process globals.
//! `BrainBuilder` assembles the orchestrator loop from a runtime plus
//! clients, tools, and policy; every entry point goes through it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agent::orchestrator::OrchestratorLoop;
use crate::ai::client::{HttpLlmClient, LlmClient};
use crate::ai::finalize::{FinalizationPipeline, FinalizerPool};
use crate::ai::router::RouterAdapter;
use crate::audit::AuditLogger;
use crate::config::BrainConfig;
use crate::conversation::bargein::{BargeInHandler, TtsControl};
use crate::conversation::fsm::ConversationFsm;
use crate::error::BrainError;
use crate::events::EventBus;
use crate::metrics::MetricsCollector;
use crate::policy::classifier::ActionClassifier;
use crate::policy::engine::PermissionEngine;
use crate::policy::guardrails::SafetyGuard;
use crate::tools::registry::ToolRegistry;
use crate::tools::timeout::ToolTimeoutManager;
use crate::tools::validation::{RegistryValidator, ValidationConfig};
use crate::voice::style::StyleOptions;

/// Shared observability substrate. One per process, torn down via
/// [`Runtime::shutdown`].
pub struct Runtime {
    pub metrics: Arc<MetricsCollector>,
    pub audit: Arc<AuditLogger>,
    pub events: Arc<EventBus>,
    pub finalizer_pool: Arc<FinalizerPool>,
    shut_down: AtomicBool,
}

impl Runtime {
    pub fn create(config: &BrainConfig) -> Result<Arc<Self>> {
        let metrics = Arc::new(MetricsCollector::new(
            config.metrics_max_records,
            config.metrics_jsonl_path.clone(),
        ));
        let audit = Arc::new(
            AuditLogger::new(
                config.audit_path_or_default(),
                config.audit_max_bytes,
                config.audit_max_backups,
                config.audit_redact,
            )
            .context("cannot create audit logger")?,
        );
        Ok(Arc::new(Self {
            metrics,
            audit,
            events: Arc::new(EventBus::default()),
            finalizer_pool: Arc::new(FinalizerPool::new(config.finalizer_pool_size)),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Flush metrics and drain the finalizer pool. Idempotent; call at
    /// process exit.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.finalizer_pool.shutdown().await;
        if let Err(e) = self.metrics.flush() {
            tracing::warn!(error = %e, "metrics flush failed at shutdown");
        }
        tracing::info!("runtime shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// Assembles an [`OrchestratorLoop`]. Missing pieces fall back to the
/// config-driven defaults (HTTP router client, built-in policy, fresh
/// FSM).
pub struct BrainBuilder {
    config: BrainConfig,
    runtime: Option<Arc<Runtime>>,
    router_client: Option<Arc<dyn LlmClient>>,
    quality_client: Option<Arc<dyn LlmClient>>,
    tools: Option<Arc<ToolRegistry>>,
    permissions: Option<Arc<PermissionEngine>>,
    fsm: Option<Arc<ConversationFsm>>,
    tts: Option<Arc<dyn TtsControl>>,
    validation: ValidationConfig,
}

impl BrainBuilder {
    pub fn new(config: BrainConfig) -> Self {
        Self {
            config,
            runtime: None,
            router_client: None,
            quality_client: None,
            tools: None,
            permissions: None,
            fsm: None,
            tts: None,
            validation: ValidationConfig::default(),
        }
    }

    pub fn runtime(mut self, runtime: Arc<Runtime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn router_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.router_client = Some(client);
        self
    }

    pub fn quality_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.quality_client = Some(client);
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn permissions(mut self, engine: Arc<PermissionEngine>) -> Self {
        self.permissions = Some(engine);
        self
    }

    pub fn fsm(mut self, fsm: Arc<ConversationFsm>) -> Self {
        self.fsm = Some(fsm);
        self
    }

    pub fn tts(mut self, tts: Arc<dyn TtsControl>) -> Self {
        self.tts = Some(tts);
        self
    }

    pub fn validation(mut self, validation: ValidationConfig) -> Self {
        self.validation = validation;
        self
    }

    /// Wire everything together. Registry validation runs here; a
    /// missing mandatory tool is fatal.
    pub fn build(self) -> std::result::Result<OrchestratorLoop, BrainError> {
        let config = self.config;

        let runtime = match self.runtime {
            Some(r) => r,
            None => Runtime::create(&config).map_err(|e| BrainError::Fatal(e.to_string()))?,
        };

        let tools = self.tools.unwrap_or_else(|| Arc::new(ToolRegistry::new()));
        let report = RegistryValidator::new(self.validation).validate(&tools);
        if !report.ok() {
            return Err(BrainError::Fatal(format!(
                "tool registry invalid, missing mandatory tools: {}",
                report.missing_mandatory.join(", ")
            )));
        }

        let router_client: Arc<dyn LlmClient> = self.router_client.unwrap_or_else(|| {
            Arc::new(HttpLlmClient::new(&config.router_url, &config.router_model, None))
        });
        let router = Arc::new(RouterAdapter::new(router_client.clone(), &config.router_model));

        let quality_client: Option<Arc<dyn LlmClient>> = self.quality_client.or_else(|| {
            config.finalizer_key.as_ref().map(|key| {
                Arc::new(HttpLlmClient::new(
                    &config.router_url,
                    &config.finalizer_model,
                    Some(key.clone()),
                )) as Arc<dyn LlmClient>
            })
        });

        let style = StyleOptions {
            strip_emoji: config.strip_emoji,
            max_sentences: config.max_sentences,
        };
        let finalizer = Arc::new(FinalizationPipeline::new(
            router_client,
            &config.router_model,
            quality_client,
            &config.finalizer_model,
            runtime.finalizer_pool.clone(),
            runtime.metrics.clone(),
            style,
        ));

        let timeouts = Arc::new(ToolTimeoutManager::new(
            crate::tools::timeout::DEFAULT_TOOL_TIMEOUT,
            config.circuit_failure_threshold,
            config.circuit_recovery_timeout,
            config.tool_timeouts.clone(),
        ));

        let fsm = self.fsm.unwrap_or_else(|| {
            Arc::new(ConversationFsm::new(
                crate::conversation::fsm::FsmState::Idle,
                config.executing_timeout,
            ))
        });

        Ok(OrchestratorLoop::new(
            config,
            runtime,
            router,
            finalizer,
            tools,
            timeouts,
            self.permissions.unwrap_or_default(),
            SafetyGuard::new(),
            Arc::new(ActionClassifier::default()),
            Arc::new(BargeInHandler::new(self.tts, 0.3)),
            fsm,
        ))
    }
}
