pub mod bridge;
pub mod engine;
pub mod marker;
pub mod retry;

pub use bridge::{serve_assistant_calls, AssistantBridge, Bridge, BridgeEndpoint};
pub use engine::InjectionEngine;
pub use retry::{run_retry, spawn_retry, RetryOutcome, RetryPolicy, RetryTask};
