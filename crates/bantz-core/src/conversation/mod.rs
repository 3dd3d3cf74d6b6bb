//! Conversation lifecycle: the formal FSM and barge-in turn isolation.

pub mod bargein;
pub mod fsm;

pub use bargein::{BargeInAction, BargeInEvent, BargeInHandler, CancellationToken, TurnContext};
pub use fsm::{ConversationFsm, FsmEvent, FsmState, TransitionRecord};
