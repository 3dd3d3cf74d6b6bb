//! The per-turn orchestration loop.
//!
//! `process_turn` drives plan → permission gate → execute → verify →
//! finalize → state update, with cooperative cancellation checks at
//! every phase boundary. Tool failures are reified, never fatal; only a
//! cancelled turn or a fatal wiring problem cuts the flow short, and a
//! user-visible reply always exists.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::Engine;
use rand::RngCore;
use serde_json::{json, Value};

use crate::ai::finalize::FinalizationPipeline;
use crate::ai::plan::{Route, RouterPlan};
use crate::ai::router::{Exchange, RouterAdapter};
use crate::ai::tier::{decide_tier, FinalizerTier};
use crate::config::BrainConfig;
use crate::conversation::bargein::{BargeInHandler, TurnContext};
use crate::conversation::fsm::ConversationFsm;
use crate::error::BrainError;
use crate::policy::classifier::{ActionClassifier, ActionContext};
use crate::policy::dsl::Decision;
use crate::policy::engine::PermissionEngine;
use crate::policy::guardrails::SafetyGuard;
use crate::runtime::Runtime;
use crate::tools::registry::{ToolExecution, ToolRegistry};
use crate::tools::timeout::ToolTimeoutManager;
use crate::voice::style::{confirm_reprompt, pick_variant, CLARIFY_INTROS};

use super::fsm_bridge::FsmBridge;
use super::plan_verifier::verify_plan;
use super::state::{OrchestratorState, PendingConfirmation};
use super::verify::{verify_tool_results, RetryFn, VerifyConfig};

/// Confirmation request surfaced to the caller when a write is gated.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub tool: String,
    pub token: String,
    pub prompt: String,
}

/// Result of one orchestrated turn.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOutput {
    pub route: String,
    pub intent: String,
    pub tool_plan: Vec<String>,
    pub assistant_reply: String,
    pub turn_cancelled: bool,
    pub awaiting_confirmation: Option<ConfirmationRequest>,
    pub tier: Option<&'static str>,
    pub model: String,
}

pub struct OrchestratorLoop {
    config: BrainConfig,
    runtime: Arc<Runtime>,
    router: Arc<RouterAdapter>,
    finalizer: Arc<FinalizationPipeline>,
    tools: Arc<ToolRegistry>,
    timeouts: Arc<ToolTimeoutManager>,
    permissions: Arc<PermissionEngine>,
    guard: SafetyGuard,
    classifier: Arc<ActionClassifier>,
    bargein: Arc<BargeInHandler>,
    bridge: Arc<FsmBridge>,
    verify_config: VerifyConfig,
}

impl OrchestratorLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BrainConfig,
        runtime: Arc<Runtime>,
        router: Arc<RouterAdapter>,
        finalizer: Arc<FinalizationPipeline>,
        tools: Arc<ToolRegistry>,
        timeouts: Arc<ToolTimeoutManager>,
        permissions: Arc<PermissionEngine>,
        guard: SafetyGuard,
        classifier: Arc<ActionClassifier>,
        bargein: Arc<BargeInHandler>,
        fsm: Arc<ConversationFsm>,
    ) -> Self {
        let bridge = Arc::new(FsmBridge::new(Some(fsm), Some(runtime.events.clone())));
        Self {
            config,
            runtime,
            router,
            finalizer,
            tools,
            timeouts,
            permissions,
            guard,
            classifier,
            bargein,
            bridge,
            verify_config: VerifyConfig::default(),
        }
    }

    pub fn bargein(&self) -> &Arc<BargeInHandler> {
        &self.bargein
    }

    pub fn bridge(&self) -> &Arc<FsmBridge> {
        &self.bridge
    }

    /// Process one user utterance.
    pub async fn process_turn(
        &self,
        user_input: &str,
        state: &mut OrchestratorState,
    ) -> Result<OrchestratorOutput, BrainError> {
        self.run_full_cycle(user_input, None, state).await
    }

    /// Full cycle entry point; pass `confirmation_token` to approve a
    /// pending write and resume execution.
    pub async fn run_full_cycle(
        &self,
        user_input: &str,
        confirmation_token: Option<&str>,
        state: &mut OrchestratorState,
    ) -> Result<OrchestratorOutput, BrainError> {
        // ── Phase 0: turn start ────────────────────────────────────────
        let turn = self.bargein.start_turn();
        let turn_number = state.next_turn();
        state.update_trace("turn_number", json!(turn_number));

        if let Some(token) = confirmation_token {
            return self.resume_confirmed(token, user_input, turn, state).await;
        }

        self.bridge.on_turn_start(turn_number);

        // ── Phase 1: planning ──────────────────────────────────────────
        if turn.is_cancelled() {
            return Ok(self.cancelled_output(state));
        }

        let recent: Vec<Exchange> = state
            .recent_conversation(3)
            .into_iter()
            .map(|t| Exchange {
                user: t.user.clone(),
                assistant: t.assistant.clone(),
            })
            .collect();

        let mut plan = match self
            .router
            .plan(user_input, &recent, &state.session_context, "")
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                // Router down or unparseable: empty plan, apology path.
                tracing::warn!(error = %e, "planning failed, continuing with empty plan");
                state.update_trace("router_error", json!(e.to_string()));
                RouterPlan::default()
            }
        };

        state.update_trace("route", json!(plan.route.as_str()));
        state.update_trace("intent", json!(self.intent_of(&plan)));
        state.update_trace("confidence", json!(plan.confidence));

        let valid_tools: HashSet<String> = self.tools.names().into_iter().collect();
        let (plan_ok, errors) = verify_plan(&plan, user_input, &valid_tools);
        if !plan_ok {
            state.update_trace("plan_verifier", json!(errors));
            if errors.iter().any(|e| is_hard_plan_error(e)) {
                // Downgrade: strip the bad tools, let the finalizer ask
                // for clarification instead of running a wrong plan.
                plan.strip_tools();
                if plan.assistant_reply.is_empty() && plan.question.is_empty() {
                    plan.ask_user = true;
                    plan.question = format!(
                        "{} Ne yapmamı istersiniz?",
                        pick_variant(CLARIFY_INTROS, user_input)
                    );
                }
            }
        }

        // Low confidence + ask_user: skip straight to the clarification.
        if plan.confidence < self.config.confidence_threshold && plan.ask_user {
            let question = if plan.question.is_empty() {
                format!("{} Tekrar eder misiniz?", pick_variant(CLARIFY_INTROS, user_input))
            } else {
                plan.question.clone()
            };
            self.bridge.on_no_tools();
            return Ok(self.deliver(user_input, &plan, question, None, state));
        }

        if turn.is_cancelled() {
            return Ok(self.cancelled_output(state));
        }

        // ── Phase 2: permission & confirmation gate ────────────────────
        let mut approved: Vec<(String, Value)> = Vec::new();

        if plan.has_tools() {
            self.bridge.on_plan_ready();
        } else {
            self.bridge.on_no_tools();
        }

        for (index, step) in plan.tool_plan_with_args.iter().enumerate() {
            let action = derive_action(&step.name);
            let classification = self
                .classifier
                .classify(&classifier_action(&step.name), &action_context(&step.args));
            let mut decision = self.permissions.evaluate(&step.name, action);
            let risk = self.permissions.get_risk(&step.name);

            let command_repr = command_repr(&step.name, &step.args);
            let verdict = self.guard.check(&command_repr);

            if verdict.blocked || decision == Decision::Deny {
                let reason = verdict
                    .reason
                    .clone()
                    .unwrap_or_else(|| "izin reddedildi".to_string());
                let mut rejected = ToolExecution::safety_rejected(&step.name, reason.as_str());
                rejected.step_index = index;
                turn.add_tool_result(rejected);
                self.audit_decision(&step.name, &step.args, "deny", &command_repr, risk.as_str(), state);
                tracing::warn!(tool = %step.name, reason = %reason, "tool rejected by gate");
                continue;
            }

            let needs_confirmation = decision == Decision::Confirm
                || verdict.confirmation_required
                || self.tools.requires_confirmation(&step.name)
                || classification.requires_confirmation;

            if needs_confirmation {
                decision = Decision::Confirm;
            }

            if decision == Decision::Confirm {
                let request =
                    self.enqueue_confirmation(step.name.clone(), step.args.clone(), &plan, state);
                self.bridge.on_confirmation_required(&step.name);
                self.audit_decision(
                    &step.name,
                    &step.args,
                    "confirm",
                    &command_repr,
                    risk.as_str(),
                    state,
                );
                self.bargein.finish_turn();

                return Ok(OrchestratorOutput {
                    route: plan.route.as_str().to_string(),
                    intent: self.intent_of(&plan),
                    tool_plan: plan.tool_plan.clone(),
                    assistant_reply: request.prompt.clone(),
                    turn_cancelled: false,
                    awaiting_confirmation: Some(request),
                    tier: None,
                    model: String::new(),
                });
            }

            approved.push((step.name.clone(), step.args.clone()));
        }

        // ── Phase 3: execute ───────────────────────────────────────────
        self.execute_steps(&approved, &turn, state).await;

        // ── Phases 4–6 ─────────────────────────────────────────────────
        self.verify_finalize_deliver(user_input, plan, turn, state).await
    }

    /// Explicitly deny a pending confirmation: consumes the entry and
    /// acknowledges the cancellation.
    pub fn deny_confirmation(
        &self,
        token: &str,
        state: &mut OrchestratorState,
    ) -> OrchestratorOutput {
        let denied = state.take_pending_confirmation(token);
        if let Some(pending) = &denied {
            self.bridge.on_user_denied();
            self.audit_decision(
                &pending.tool,
                &pending.args,
                "user_denied",
                "",
                "",
                state,
            );
        }
        OrchestratorOutput {
            assistant_reply: crate::voice::style::cancel_reply(token).to_string(),
            ..Default::default()
        }
    }

    // ── Confirmation resume path ───────────────────────────────────────

    async fn resume_confirmed(
        &self,
        token: &str,
        user_input: &str,
        turn: Arc<TurnContext>,
        state: &mut OrchestratorState,
    ) -> Result<OrchestratorOutput, BrainError> {
        let Some(pending) = state.take_pending_confirmation(token) else {
            tracing::warn!("confirmation token unknown or expired");
            return Ok(OrchestratorOutput {
                assistant_reply:
                    "Onay süresi dolmuş görünüyor, isterseniz baştan alalım.".to_string(),
                ..Default::default()
            });
        };

        self.bridge.on_user_confirmed();
        self.audit_decision(&pending.tool, &pending.args, "user_confirmed", "", "", state);

        // Phase 3 resumes with exactly the approved step.
        let steps = vec![(pending.tool.clone(), pending.args.clone())];
        self.execute_steps(&steps, &turn, state).await;

        let mut plan = RouterPlan::default();
        plan.route = route_of_tool(&pending.tool);
        plan.tool_plan = vec![pending.tool.clone()];
        plan.tool_plan_with_args = vec![crate::ai::plan::ToolStep {
            name: pending.tool.clone(),
            args: pending.args.clone(),
        }];

        self.verify_finalize_deliver(user_input, plan, turn, state).await
    }

    // ── Phase 3 helper ─────────────────────────────────────────────────

    async fn execute_steps(
        &self,
        steps: &[(String, Value)],
        turn: &Arc<TurnContext>,
        state: &mut OrchestratorState,
    ) {
        for (index, (name, args)) in steps.iter().enumerate() {
            if turn.is_cancelled() {
                tracing::info!(
                    remaining = steps.len() - index,
                    "turn cancelled, skipping remaining tools"
                );
                break;
            }

            let mut exec = match self.tools.get(name) {
                Some(tool) => {
                    let task = (tool.function)(args.clone());
                    self.timeouts.execute(name, task, None).await
                }
                None => ToolExecution::error(name, format!("bilinmeyen araç: {name}"), 0.0),
            };
            exec.step_index = index;

            self.record_execution(&exec, args, state);
            self.remember_listings(&exec, state);
            turn.add_tool_result(exec);
        }
    }

    fn record_execution(&self, exec: &ToolExecution, args: &Value, state: &OrchestratorState) {
        self.runtime.events.publish(
            "tool.executed",
            json!({
                "tool": exec.tool,
                "success": exec.success(),
                "elapsed_ms": exec.elapsed_ms,
                "turn_number": state.turn_number(),
            }),
            "orchestrator",
        );

        let mut tags = HashMap::new();
        tags.insert("tool".to_string(), exec.tool.clone());
        self.runtime
            .metrics
            .record("tool_exec_ms", exec.elapsed_ms, "ms", tags);

        let result_value = exec.result().cloned();
        if let Err(e) = self.runtime.audit.log_tool_call(
            &exec.tool,
            Some(args),
            Some(if exec.success() { "allow" } else { "error" }),
            result_value.as_ref(),
            Some(exec.elapsed_ms),
            exec.success(),
            Some(&state.session_id),
            Some(state.turn_number()),
            Some(self.permissions.get_risk(&exec.tool).as_str()),
        ) {
            tracing::error!(error = %e, "audit write failed");
        }
    }

    /// Successful list results refresh the session's reference snapshots.
    fn remember_listings(&self, exec: &ToolExecution, state: &mut OrchestratorState) {
        if !exec.success() {
            return;
        }
        let items = exec
            .result()
            .and_then(|r| r.get("items"))
            .and_then(Value::as_array)
            .cloned();
        let Some(items) = items else { return };

        match exec.tool.as_str() {
            "calendar.list_events" => state.set_calendar_listed_events(items),
            "gmail.list_messages" | "gmail.smart_search" => state.set_gmail_listed_messages(items),
            _ => {}
        }
    }

    // ── Phases 4–6 ─────────────────────────────────────────────────────

    async fn verify_finalize_deliver(
        &self,
        user_input: &str,
        plan: RouterPlan,
        turn: Arc<TurnContext>,
        state: &mut OrchestratorState,
    ) -> Result<OrchestratorOutput, BrainError> {
        if turn.is_cancelled() {
            return Ok(self.cancelled_output(state));
        }

        // ── Phase 4: verify (with idempotent retry through Phase 3's
        // timeout path; the permission gate is safe to bypass because
        // only whitelisted reads are retried) ──────────────────────────
        let args_by_tool: HashMap<String, Value> = plan
            .tool_plan_with_args
            .iter()
            .map(|s| (s.name.clone(), s.args.clone()))
            .collect();

        let tools = self.tools.clone();
        let timeouts = self.timeouts.clone();
        let retry: RetryFn<'_> = Box::new(move |tool_name, _orig| {
            let tools = tools.clone();
            let timeouts = timeouts.clone();
            let tool_name = tool_name.to_string();
            let args = args_by_tool.get(&tool_name).cloned().unwrap_or(json!({}));
            Box::pin(async move {
                match tools.get(&tool_name) {
                    Some(tool) => {
                        let task = (tool.function)(args);
                        timeouts.execute(&tool_name, task, None).await
                    }
                    None => ToolExecution::error(&tool_name, "bilinmeyen araç", 0.0),
                }
            })
        });

        let verify = verify_tool_results(turn.tool_results(), &self.verify_config, Some(retry)).await;
        state.update_trace("verify", json!(verify.trace_line()));
        self.runtime.metrics.record_value("verify_ms", verify.elapsed_ms as f64, "ms");

        if turn.is_cancelled() {
            return Ok(self.cancelled_output(state));
        }

        // ── Phase 5: finalize ──────────────────────────────────────────
        let decision = decide_tier(&plan, self.finalizer.quality_available(), self.config.force_tier);
        state.update_trace("response_tier", json!(decision.tier.as_str()));
        state.update_trace("response_tier_reason", json!(decision.reason));

        let outcome = self
            .finalizer
            .finalize(user_input, &plan, &verify.verified_results, decision.tier, turn.token())
            .await;
        state.update_trace("finalizer_used", json!(outcome.meta.model));

        if outcome.cancelled || turn.is_cancelled() {
            return Ok(self.cancelled_output(state));
        }

        self.bridge.on_finalization_done();

        // ── Phase 6: state update & delivery ───────────────────────────
        let tier = Some(decision.tier.as_str());
        let model = outcome.meta.model.clone();
        Ok(self.deliver_with_meta(user_input, &plan, outcome.reply, tier, model, state))
    }

    // ── Delivery & terminal outputs ────────────────────────────────────

    fn deliver(
        &self,
        user_input: &str,
        plan: &RouterPlan,
        reply: String,
        tier: Option<FinalizerTier>,
        state: &mut OrchestratorState,
    ) -> OrchestratorOutput {
        self.deliver_with_meta(
            user_input,
            plan,
            reply,
            tier.map(|t| t.as_str()),
            String::new(),
            state,
        )
    }

    fn deliver_with_meta(
        &self,
        user_input: &str,
        plan: &RouterPlan,
        reply: String,
        tier: Option<&'static str>,
        model: String,
        state: &mut OrchestratorState,
    ) -> OrchestratorOutput {
        state.add_conversation_turn(user_input, &reply);
        if let Some(update) = &plan.memory_update {
            // Long-term memory writes happen through a side channel.
            self.runtime.events.publish(
                "memory.update",
                json!({"text": update, "turn_number": state.turn_number()}),
                "orchestrator",
            );
        }

        self.bargein.finish_turn();
        self.bridge.on_turn_end();

        OrchestratorOutput {
            route: plan.route.as_str().to_string(),
            intent: self.intent_of(plan),
            tool_plan: plan.tool_plan.clone(),
            assistant_reply: reply,
            turn_cancelled: false,
            awaiting_confirmation: None,
            tier,
            model,
        }
    }

    fn cancelled_output(&self, state: &mut OrchestratorState) -> OrchestratorOutput {
        state.update_trace("turn_cancelled", json!(true));
        self.bridge.on_cancel();
        self.bargein.finish_turn();
        OrchestratorOutput {
            turn_cancelled: true,
            ..Default::default()
        }
    }

    fn enqueue_confirmation(
        &self,
        tool: String,
        args: Value,
        plan: &RouterPlan,
        state: &mut OrchestratorState,
    ) -> ConfirmationRequest {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);

        let prompt = if plan.confirmation_prompt.is_empty() {
            format!("{tool} çalıştırılsın mı? {}", confirm_reprompt(&token))
        } else {
            plan.confirmation_prompt.clone()
        };

        state.add_pending_confirmation(PendingConfirmation {
            tool: tool.clone(),
            args,
            token: token.clone(),
            expires_at: std::time::Instant::now() + self.config.confirmation_ttl,
            prompt: prompt.clone(),
        });

        ConfirmationRequest { tool, token, prompt }
    }

    fn audit_decision(
        &self,
        tool: &str,
        args: &Value,
        decision: &str,
        command_repr: &str,
        risk: &str,
        state: &OrchestratorState,
    ) {
        let mut event = crate::audit::AuditEvent::new(crate::audit::AuditEventType::PermissionDecision);
        event.tool = Some(tool.to_string());
        event.args_hash = Some(crate::audit::hash_value(args));
        event.decision = Some(decision.to_string());
        event.session_id = Some(state.session_id.clone());
        event.turn_number = Some(state.turn_number());
        if !risk.is_empty() {
            event.risk_level = Some(risk.to_string());
        }
        if !command_repr.is_empty() {
            event.message = Some(command_repr.to_string());
        }
        if let Err(e) = self.runtime.audit.log(&event) {
            tracing::error!(error = %e, "audit write failed");
        }
    }

    fn intent_of(&self, plan: &RouterPlan) -> String {
        if plan.route == Route::Gmail && plan.gmail_intent != "none" {
            plan.gmail_intent.clone()
        } else {
            plan.calendar_intent.clone()
        }
    }
}

// ── Free helpers ───────────────────────────────────────────────────────

/// Hard errors strip the tool plan; soft warnings only trace.
fn is_hard_plan_error(error: &str) -> bool {
    !matches!(error, "tool_plan_no_indicators" | "calendar_write_no_temporal")
}

/// Action verb for the permission engine, derived from the tool suffix.
fn derive_action(tool: &str) -> &'static str {
    let suffix = tool.rsplit('.').next().unwrap_or(tool);
    if matches!(
        suffix,
        "execute_command" | "run_shell" | "run_script" | "open_app" | "shutdown"
    ) {
        "execute"
    } else if suffix.starts_with("create")
        || suffix.starts_with("update")
        || suffix.starts_with("delete")
        || suffix.starts_with("send")
        || suffix.starts_with("archive")
        || suffix.starts_with("draft")
    {
        "write"
    } else {
        "read"
    }
}

/// Map a tool suffix onto the classifier's action vocabulary.
fn classifier_action(tool: &str) -> String {
    let suffix = tool.rsplit('.').next().unwrap_or(tool);
    match suffix {
        "send" | "create_draft" => "send_email",
        "list_messages" | "unread_count" | "find_free_slots" => "list_events",
        "get_message" => "read_message",
        "smart_search" | "search" => "web_search",
        "now" => "get_time",
        "status" => "system_status",
        "open" | "open_app" => "browser_open",
        other => other,
    }
    .to_string()
}

/// Context facts the router extracted into args, for risk elevation.
fn action_context(args: &Value) -> ActionContext {
    ActionContext {
        domain: args.get("domain").and_then(Value::as_str).map(str::to_string),
        amount: args.get("amount").and_then(Value::as_f64).unwrap_or(0.0),
        target_count: args
            .get("target_count")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32,
        is_sensitive_file: args
            .get("is_sensitive_file")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Command representation fed to the guardrails. A literal `command` arg
/// is screened as-is; otherwise a flat `tool key=value` form.
fn command_repr(tool: &str, args: &Value) -> String {
    if let Some(cmd) = args.get("command").and_then(Value::as_str) {
        return cmd.to_string();
    }
    let mut repr = tool.to_string();
    if let Value::Object(map) = args {
        for (key, value) in map {
            repr.push_str(&format!(" {key}={value}"));
        }
    }
    repr
}

fn route_of_tool(tool: &str) -> Route {
    match tool.split('.').next().unwrap_or("") {
        "calendar" => Route::Calendar,
        "gmail" => Route::Gmail,
        "system" | "time" => Route::System,
        _ => Route::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::{ChatMessage, ChatResponse, LlmClient};
    use crate::ai::finalize::FinalizerPool;
    use crate::conversation::bargein::BargeInEvent;
    use crate::conversation::fsm::FsmState;
    use crate::metrics::MetricsCollector;
    use crate::tools::registry::Tool;
    use crate::voice::style::StyleOptions;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    // ── Fakes ──────────────────────────────────────────────────────────

    struct ScriptedLlm {
        /// Router responses, consumed front-to-back.
        plans: Mutex<Vec<String>>,
        /// Fixed finalizer reply.
        reply: String,
        finalize_delay: Duration,
    }

    impl ScriptedLlm {
        fn new(plans: Vec<&str>, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                plans: Mutex::new(plans.into_iter().map(str::to_string).collect()),
                reply: reply.to_string(),
                finalize_delay: Duration::ZERO,
            })
        }

        fn slow_finalizer(plans: Vec<&str>, reply: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                plans: Mutex::new(plans.into_iter().map(str::to_string).collect()),
                reply: reply.to_string(),
                finalize_delay: delay,
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete_text(&self, _prompt: &str, _t: f64, _m: u32) -> Result<String> {
            let mut plans = self.plans.lock().unwrap();
            if plans.is_empty() {
                Ok("{}".to_string())
            } else {
                Ok(plans.remove(0))
            }
        }

        async fn chat_detailed(
            &self,
            _messages: &[ChatMessage],
            _t: f64,
            _m: u32,
        ) -> Result<ChatResponse> {
            if !self.finalize_delay.is_zero() {
                tokio::time::sleep(self.finalize_delay).await;
            }
            Ok(ChatResponse {
                content: self.reply.clone(),
                model: "scripted-model".to_string(),
                tokens_used: 10,
                finish_reason: "stop".to_string(),
            })
        }
    }

    struct Harness {
        brain: Arc<OrchestratorLoop>,
        fsm: Arc<ConversationFsm>,
        runtime: Arc<Runtime>,
        list_calls: Arc<AtomicUsize>,
        create_calls: Arc<AtomicUsize>,
        exec_calls: Arc<AtomicUsize>,
        status_calls: Arc<AtomicUsize>,
        _dir: TempDir,
    }

    fn harness(llm: Arc<ScriptedLlm>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = BrainConfig {
            audit_path: Some(dir.path().join("audit.jsonl")),
            ..Default::default()
        };
        let runtime = Runtime::create(&config).unwrap();

        let list_calls = Arc::new(AtomicUsize::new(0));
        let create_calls = Arc::new(AtomicUsize::new(0));
        let exec_calls = Arc::new(AtomicUsize::new(0));
        let status_calls = Arc::new(AtomicUsize::new(0));

        let tools = Arc::new(ToolRegistry::new());
        let calls = list_calls.clone();
        tools.register(Tool::new(
            "calendar.list_events",
            "list events",
            json!({"type": "object"}),
            move |_args| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({
                        "ok": true,
                        "items": [
                            {"summary": "Ekip Sync", "start": "10:00"},
                            {"summary": "Code Review", "start": "15:00"}
                        ],
                        "count": 2
                    }))
                }
            },
        ));
        let calls = create_calls.clone();
        tools.register(
            Tool::new(
                "calendar.create_event",
                "create event",
                json!({"type": "object"}),
                move |args| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({"ok": true, "id": "evt_1", "echo": args}))
                    }
                },
            )
            .with_confirmation(),
        );
        let calls = exec_calls.clone();
        tools.register(Tool::new(
            "system.execute_command",
            "run a shell command",
            json!({"type": "object"}),
            move |_args| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"ok": true}))
                }
            },
        ));
        let calls = status_calls.clone();
        tools.register(Tool::new(
            "system.status",
            "system health",
            json!({"type": "object"}),
            move |_args| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("sensor offline"))
                }
            },
        ));
        tools.register(Tool::new("time.now", "time", json!({"type": "object"}), |_| async {
            Ok(json!({"ok": true, "time": "14:00"}))
        }));
        tools.register(Tool::new(
            "gmail.list_messages",
            "list mail",
            json!({"type": "object"}),
            |_| async { Ok(json!({"ok": true, "items": [{"id": "m1"}]})) },
        ));
        tools.register(Tool::new("gmail.send", "send mail", json!({"type": "object"}), |_| async {
            Ok(json!({"ok": true}))
        }));

        let fsm = Arc::new(ConversationFsm::default());
        let client: Arc<dyn LlmClient> = llm;
        let router = Arc::new(RouterAdapter::new(client.clone(), "router-3b"));
        let finalizer = Arc::new(FinalizationPipeline::new(
            client,
            "router-3b",
            None,
            "quality",
            Arc::new(FinalizerPool::new(2)),
            Arc::new(MetricsCollector::default()),
            StyleOptions {
                strip_emoji: true,
                max_sentences: 6,
            },
        ));

        let brain = OrchestratorLoop::new(
            config,
            runtime.clone(),
            router,
            finalizer,
            tools,
            Arc::new(ToolTimeoutManager::default()),
            Arc::new(PermissionEngine::default()),
            SafetyGuard::new(),
            Arc::new(ActionClassifier::default()),
            Arc::new(BargeInHandler::default()),
            fsm.clone(),
        );

        Harness {
            brain: Arc::new(brain),
            fsm,
            runtime,
            list_calls,
            create_calls,
            exec_calls,
            status_calls,
            _dir: dir,
        }
    }

    fn audit_body(h: &Harness) -> String {
        std::fs::read_to_string(h.runtime.audit.path()).unwrap_or_default()
    }

    // ── Scenario 1: happy calendar query ───────────────────────────────

    #[tokio::test]
    async fn happy_calendar_query() {
        let plan = json!({
            "route": "calendar",
            "calendar_intent": "query",
            "slots": {"day_hint": "today"},
            "confidence": 0.92,
            "tool_plan": ["calendar.list_events"],
            "assistant_reply": ""
        })
        .to_string();
        let h = harness(ScriptedLlm::new(
            vec![&plan],
            "Bugün 2 etkinlik var, ilki saat 10:00'da Ekip Sync.",
        ));
        let mut state = OrchestratorState::new("s1");

        let out = h.brain.process_turn("bugün neler yapacağız", &mut state).await.unwrap();

        assert!(!out.turn_cancelled);
        assert_eq!(out.route, "calendar");
        assert_eq!(out.intent, "query");
        assert_eq!(out.tool_plan, vec!["calendar.list_events"]);
        assert!(out.assistant_reply.contains('2'));
        assert!(out.assistant_reply.contains("10:00"));
        assert_eq!(out.tier, Some("fast"));

        assert_eq!(h.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.conversation_len(), 1);
        assert_eq!(state.calendar_listed_events().len(), 2);
        assert_eq!(h.fsm.state(), FsmState::Idle);

        let audit = audit_body(&h);
        assert!(audit.contains("\"event_type\":\"tool_call\""));
        assert!(audit.contains("calendar.list_events"));
    }

    // ── Scenario 2: write requires confirmation ────────────────────────

    #[tokio::test]
    async fn write_requires_confirmation_then_token_resumes() {
        let plan = json!({
            "route": "calendar",
            "calendar_intent": "create_event",
            "slots": {"title": "ekip sync", "time": "14:00"},
            "confidence": 0.9,
            "tool_plan": [{"name": "calendar.create_event", "args": {"title": "ekip sync", "time": "14:00"}}],
            "confirmation_prompt": "Saat 14:00 için 'ekip sync' ekleyeyim mi?"
        })
        .to_string();
        let h = harness(ScriptedLlm::new(vec![&plan], "Etkinlik eklendi efendim."));
        let mut state = OrchestratorState::new("s1");

        let out = h
            .brain
            .process_turn("saat 2 için toplantı ekle başlığı ekip sync", &mut state)
            .await
            .unwrap();

        let request = out.awaiting_confirmation.expect("confirmation expected");
        assert_eq!(request.tool, "calendar.create_event");
        assert!(out.assistant_reply.contains("ekleyeyim mi"));
        assert_eq!(h.create_calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.pending_len(), 1);
        assert_eq!(h.fsm.state(), FsmState::Confirming);

        let out = h
            .brain
            .run_full_cycle("evet", Some(&request.token), &mut state)
            .await
            .unwrap();

        assert!(!out.turn_cancelled);
        assert!(out.awaiting_confirmation.is_none());
        assert_eq!(h.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.pending_len(), 0);
        assert_eq!(h.fsm.state(), FsmState::Idle);
        assert!(!out.assistant_reply.is_empty());
    }

    #[tokio::test]
    async fn unknown_confirmation_token_is_graceful() {
        let h = harness(ScriptedLlm::new(vec![], "tamam"));
        let mut state = OrchestratorState::new("s1");

        let out = h
            .brain
            .run_full_cycle("evet", Some("no-such-token"), &mut state)
            .await
            .unwrap();
        assert!(out.awaiting_confirmation.is_none());
        assert!(out.assistant_reply.contains("Onay süresi"));
    }

    #[tokio::test]
    async fn deny_confirmation_consumes_and_acknowledges() {
        let plan = json!({
            "route": "calendar",
            "calendar_intent": "create_event",
            "slots": {"title": "x", "time": "09:00"},
            "confidence": 0.9,
            "tool_plan": [{"name": "calendar.create_event", "args": {"title": "x"}}]
        })
        .to_string();
        let h = harness(ScriptedLlm::new(vec![&plan], "tamam"));
        let mut state = OrchestratorState::new("s1");

        let out = h.brain.process_turn("toplantı ekle sabah 9", &mut state).await.unwrap();
        let request = out.awaiting_confirmation.unwrap();

        let denied = h.brain.deny_confirmation(&request.token, &mut state);
        assert!(!denied.assistant_reply.is_empty());
        assert_eq!(state.pending_len(), 0);
        assert_eq!(h.create_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.fsm.state(), FsmState::Cancelled);
    }

    // ── Scenario 3: barge-in mid-speaking ──────────────────────────────

    #[tokio::test]
    async fn barge_in_cancels_turn_a_and_turn_b_is_clean() {
        let plan = json!({
            "route": "calendar",
            "calendar_intent": "query",
            "confidence": 0.9,
            "tool_plan": ["calendar.list_events"]
        })
        .to_string();
        let plan_b = plan.clone();
        let h = harness(ScriptedLlm::slow_finalizer(
            vec![&plan, &plan_b],
            "Bugün 2 etkinlik var.",
            Duration::from_millis(300),
        ));

        let brain = h.brain.clone();
        let turn_a = tokio::spawn(async move {
            let mut state = OrchestratorState::new("s1");
            let out = brain.process_turn("takvime bak", &mut state).await.unwrap();
            (out, state)
        });

        // Let turn A reach finalization, then barge in.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let action = h
            .brain
            .bargein()
            .handle(BargeInEvent {
                speech_volume: 0.8,
                speech_duration_ms: 400,
            })
            .await;
        assert_eq!(action, crate::conversation::bargein::BargeInAction::CancelTurn);

        let (out_a, _state_a) = turn_a.await.unwrap();
        assert!(out_a.turn_cancelled);
        assert!(out_a.assistant_reply.is_empty());
        assert_eq!(h.brain.bargein().stats().cancelled_turns, 1);

        // Turn B runs with a fresh context and completes normally.
        let mut state_b = OrchestratorState::new("s2");
        let out_b = h.brain.process_turn("takvime tekrar bak", &mut state_b).await.unwrap();
        assert!(!out_b.turn_cancelled);
        assert!(out_b.assistant_reply.contains("etkinlik"));
        assert_eq!(state_b.conversation_len(), 1);
    }

    // ── Scenario 4: circuit breaker through the orchestrator ───────────

    #[tokio::test]
    async fn repeated_tool_failure_opens_circuit() {
        let plan = json!({
            "route": "system",
            "confidence": 0.9,
            "tool_plan": ["system.status"]
        })
        .to_string();
        // Same plan three turns in a row.
        let h = harness(ScriptedLlm::new(vec![&plan, &plan, &plan], "Sistem durumu alınamadı."));
        let mut state = OrchestratorState::new("s1");

        // Turn 1: execute fails + verify retry fails → 2 breaker failures.
        h.brain.process_turn("sistem durumuna bak", &mut state).await.unwrap();
        assert_eq!(h.status_calls.load(Ordering::SeqCst), 2);

        // Turn 2: first failure trips the threshold (3); the retry is
        // refused by the open circuit without running the tool.
        h.brain.process_turn("sistem durumuna bak", &mut state).await.unwrap();
        assert_eq!(h.status_calls.load(Ordering::SeqCst), 3);

        // Turn 3: circuit open, tool never invoked.
        h.brain.process_turn("sistem durumuna bak", &mut state).await.unwrap();
        assert_eq!(h.status_calls.load(Ordering::SeqCst), 3);
    }

    // ── Scenario 5: router mis-route downgraded ────────────────────────

    #[tokio::test]
    async fn smalltalk_with_tools_is_downgraded() {
        let plan = json!({
            "route": "smalltalk",
            "confidence": 0.9,
            "tool_plan": ["gmail.send"],
            "assistant_reply": ""
        })
        .to_string();
        let h = harness(ScriptedLlm::new(vec![&plan], "Sohbet edelim o zaman."));
        let mut state = OrchestratorState::new("s1");

        let out = h.brain.process_turn("mail gönder", &mut state).await.unwrap();

        assert!(out.tool_plan.is_empty());
        assert!(out.awaiting_confirmation.is_none());
        assert_eq!(h.create_calls.load(Ordering::SeqCst), 0);

        let verifier_trace = state.trace_get("plan_verifier").expect("trace entry");
        let entries: Vec<String> = verifier_trace
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(entries.contains(&"smalltalk_with_tools".to_string()));
        assert!(entries.iter().any(|e| e.starts_with("route_tool_mismatch:")));
    }

    // ── Scenario 6: permission deny + redaction ────────────────────────

    #[tokio::test]
    async fn denied_command_is_audited_and_redacted() {
        let plan = json!({
            "route": "system",
            "confidence": 0.9,
            "tool_plan": [{
                "name": "system.execute_command",
                "args": {"command": "rm -rf /home/alice/", "note": "secret=hunter2"}
            }]
        })
        .to_string();
        let h = harness(ScriptedLlm::new(vec![&plan], "Bu komutu çalıştıramam."));
        let mut state = OrchestratorState::new("s1");

        let out = h.brain.process_turn("şu komutu çalıştır", &mut state).await.unwrap();

        assert_eq!(h.exec_calls.load(Ordering::SeqCst), 0);
        assert!(!out.assistant_reply.is_empty());

        let audit = audit_body(&h);
        let deny_line = audit
            .lines()
            .find(|l| l.contains("permission_decision"))
            .expect("permission decision audited");
        assert!(deny_line.contains("\"tool\":\"system.execute_command\""));
        assert!(deny_line.contains("args_hash"));
        assert!(!deny_line.contains("alice"));
        assert!(!deny_line.contains("hunter2"));
    }

    // ── Boundary: zero tools, smalltalk ────────────────────────────────

    #[tokio::test]
    async fn zero_tools_smalltalk_still_finalizes() {
        let plan = json!({
            "route": "smalltalk",
            "confidence": 0.95,
            "tool_plan": [],
            "assistant_reply": "İyiyim, siz nasılsınız?"
        })
        .to_string();
        let h = harness(ScriptedLlm::new(vec![&plan], "İyiyim, siz nasılsınız?"));
        let mut state = OrchestratorState::new("s1");

        let out = h.brain.process_turn("nasılsın", &mut state).await.unwrap();
        assert!(!out.assistant_reply.is_empty());
        assert_eq!(h.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.fsm.state(), FsmState::Idle);
        assert_eq!(state.conversation_len(), 1);
    }

    // ── Low confidence asks for clarification ──────────────────────────

    #[tokio::test]
    async fn low_confidence_ask_user_short_circuits() {
        let plan = json!({
            "route": "unknown",
            "confidence": 0.4,
            "ask_user": true,
            "question": "Takvim mi, mail mi demek istediniz?",
            "tool_plan": []
        })
        .to_string();
        let h = harness(ScriptedLlm::new(vec![&plan], "ignored"));
        let mut state = OrchestratorState::new("s1");

        let out = h.brain.process_turn("şey yapsana", &mut state).await.unwrap();
        assert_eq!(out.assistant_reply, "Takvim mi, mail mi demek istediniz?");
        assert_eq!(h.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.conversation_len(), 1);
    }

    // ── Router failure still yields a reply ────────────────────────────

    #[tokio::test]
    async fn router_garbage_yields_reply_not_error() {
        let h = harness(ScriptedLlm::new(vec!["this is not json"], "Sizi anlayamadım."));
        let mut state = OrchestratorState::new("s1");

        let out = h.brain.process_turn("asdfgh", &mut state).await.unwrap();
        assert!(!out.assistant_reply.is_empty());
        assert!(state.trace_get("router_error").is_some());
    }
}
