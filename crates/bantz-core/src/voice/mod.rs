//! Voice-side gating: attention modes, interrupt signals, and the
//! deterministic reply style layer.

pub mod attention;
pub mod interrupt;
pub mod style;

pub use attention::{AttentionGate, AttentionMode, AudioEvent};
pub use interrupt::{detect_keyword, InterruptController, InterruptSignal, InterruptType};
pub use style::{apology_reply, format_voice_reply, pick_variant, StyleOptions};
