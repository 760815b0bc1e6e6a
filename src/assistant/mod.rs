pub mod client;
pub mod conversation;
pub mod elements;
pub mod orchestrator;
pub mod prompt;
pub mod protocol;
pub mod settings;

pub use client::{ChatMessage, ChatModel, ChatRole, ProviderClient};
pub use conversation::{ConversationEntry, ConversationLog};
pub use elements::{normalize_url, Element, ElementCode, ElementStore};
pub use orchestrator::{ElementAction, Orchestrator, TurnOutcome};
pub use protocol::{ElementPayload, ModelResponse};
pub use settings::SettingsStore;
