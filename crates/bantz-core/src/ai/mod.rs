//! LLM tier adapters: the router (fast planning) and the finalizer
//! (user-visible reply), behind a narrow client contract.

pub mod client;
pub mod finalize;
pub mod plan;
pub mod router;
pub mod tier;

pub use client::{ChatMessage, ChatResponse, HttpLlmClient, LlmClient};
pub use finalize::{FinalizationPipeline, FinalizeMeta, FinalizerPool};
pub use plan::{parse_plan, Route, RouterPlan, ToolStep};
pub use router::RouterAdapter;
pub use tier::{decide_tier, FinalizerTier, TierDecision};
