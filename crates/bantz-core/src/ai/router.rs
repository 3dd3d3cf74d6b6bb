//! Router adapter: builds the plan prompt and parses the strict JSON
//! envelope out of the fast model's answer.

use std::sync::Arc;

use crate::error::BrainError;

use super::client::LlmClient;
use super::plan::{parse_plan, RouterPlan};

const ROUTER_TEMPERATURE: f64 = 0.0;
const ROUTER_MAX_TOKENS: u32 = 512;
/// Recent conversation carried into the plan prompt.
pub const RECENT_TURNS: usize = 3;

const SYSTEM_PREAMBLE: &str = "\
Sen Türkçe konuşan bir asistanın yönlendirme beynisin. Kullanıcının son \
sözünü analiz et ve SADECE tek bir JSON nesnesi üret. Şema:
{
  \"route\": \"calendar|gmail|system|smalltalk|unknown\",
  \"calendar_intent\": \"query|create_event|update_event|delete_event|none\",
  \"gmail_intent\": \"list|read|send|create_draft|generate_reply|none\",
  \"slots\": {},
  \"confidence\": 0.0,
  \"tool_plan\": [\"tool.name\" | {\"name\": \"tool.name\", \"args\": {}}],
  \"assistant_reply\": \"\",
  \"ask_user\": false,
  \"question\": \"\",
  \"requires_confirmation\": false,
  \"confirmation_prompt\": \"\",
  \"memory_update\": \"\"
}
JSON dışında hiçbir şey yazma.";

/// One past (user, assistant) exchange for prompt context.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

pub struct RouterAdapter {
    client: Arc<dyn LlmClient>,
    model_name: String,
}

impl RouterAdapter {
    pub fn new(client: Arc<dyn LlmClient>, model_name: &str) -> Self {
        Self {
            client,
            model_name: model_name.to_string(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Plan prompt: preamble, last ≤3 exchanges, session context,
    /// retrieved memory, then the current utterance.
    pub fn build_prompt(
        &self,
        user_input: &str,
        recent: &[Exchange],
        session_context: &str,
        retrieved_memory: &str,
    ) -> String {
        let mut prompt = String::with_capacity(1024);
        prompt.push_str(SYSTEM_PREAMBLE);
        prompt.push_str("\n\n");

        let tail = recent.len().saturating_sub(RECENT_TURNS);
        for exchange in &recent[tail..] {
            prompt.push_str(&format!("USER: {}\n", exchange.user));
            prompt.push_str(&format!("ASSISTANT: {}\n", exchange.assistant));
        }

        if !session_context.is_empty() {
            prompt.push_str(&format!("\n[OTURUM BAĞLAMI]\n{session_context}\n"));
        }
        if !retrieved_memory.is_empty() {
            prompt.push_str(&format!("\n[HATIRLANAN]\n{retrieved_memory}\n"));
        }

        prompt.push_str(&format!("\nUSER: {user_input}\n"));
        prompt
    }

    /// Produce a plan for the utterance. LLM transport failures and
    /// unparseable output surface as `InvalidInput`; the caller falls
    /// back to an empty plan plus apology.
    pub async fn plan(
        &self,
        user_input: &str,
        recent: &[Exchange],
        session_context: &str,
        retrieved_memory: &str,
    ) -> Result<RouterPlan, BrainError> {
        let prompt = self.build_prompt(user_input, recent, session_context, retrieved_memory);

        let raw = self
            .client
            .complete_text(&prompt, ROUTER_TEMPERATURE, ROUTER_MAX_TOKENS)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "router backend call failed");
                BrainError::InvalidInput(format!("router backend failed: {e}"))
            })?;

        let plan = parse_plan(&raw)?;
        tracing::debug!(
            route = plan.route.as_str(),
            confidence = plan.confidence,
            tools = plan.tool_plan.len(),
            model = %self.model_name,
            "router produced plan"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::{ChatMessage, ChatResponse};
    use crate::ai::plan::Route;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedClient {
        responses: Mutex<Vec<Result<String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete_text(&self, prompt: &str, _t: f64, _m: u32) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses.lock().unwrap().remove(0)
        }

        async fn chat_detailed(
            &self,
            _messages: &[ChatMessage],
            _t: f64,
            _m: u32,
        ) -> Result<ChatResponse> {
            Err(anyhow!("not used"))
        }
    }

    fn exchange(user: &str, assistant: &str) -> Exchange {
        Exchange {
            user: user.to_string(),
            assistant: assistant.to_string(),
        }
    }

    #[tokio::test]
    async fn plan_parses_router_json() {
        let client = ScriptedClient::new(vec![Ok(
            r#"{"route": "calendar", "calendar_intent": "query", "confidence": 0.9, "tool_plan": ["calendar.list_events"]}"#.to_string(),
        )]);
        let router = RouterAdapter::new(client, "test-model");

        let plan = router.plan("bugün neler yapacağız", &[], "", "").await.unwrap();
        assert_eq!(plan.route, Route::Calendar);
        assert_eq!(plan.tool_plan, vec!["calendar.list_events"]);
    }

    #[tokio::test]
    async fn backend_failure_is_invalid_input() {
        let client = ScriptedClient::new(vec![Err(anyhow!("connection refused"))]);
        let router = RouterAdapter::new(client, "test-model");

        let err = router.plan("selam", &[], "", "").await.unwrap_err();
        assert!(matches!(err, BrainError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn prompt_carries_last_three_exchanges_only() {
        let client = ScriptedClient::new(vec![Ok("{}".to_string())]);
        let router = RouterAdapter::new(client.clone(), "m");

        let recent: Vec<Exchange> = (1..=5)
            .map(|i| exchange(&format!("soru {i}"), &format!("cevap {i}")))
            .collect();
        router.plan("şimdi ne var", &recent, "ctx", "mem").await.unwrap();

        let prompt = client.prompts.lock().unwrap()[0].clone();
        assert!(!prompt.contains("soru 1"));
        assert!(!prompt.contains("soru 2"));
        assert!(prompt.contains("soru 3"));
        assert!(prompt.contains("soru 5"));
        assert!(prompt.contains("[OTURUM BAĞLAMI]"));
        assert!(prompt.contains("[HATIRLANAN]"));
        assert!(prompt.ends_with("USER: şimdi ne var\n"));
    }
}
