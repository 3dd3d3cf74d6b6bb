//! The orchestration core: per-turn state machine, verification, plan
//! checks, FSM bridging, and session state.

pub mod fsm_bridge;
pub mod orchestrator;
pub mod plan_verifier;
pub mod state;
pub mod verify;

pub use fsm_bridge::FsmBridge;
pub use orchestrator::{OrchestratorLoop, OrchestratorOutput};
pub use plan_verifier::verify_plan;
pub use state::{OrchestratorState, PendingConfirmation};
pub use verify::{verify_tool_results, VerifyConfig, VerifyResult};
