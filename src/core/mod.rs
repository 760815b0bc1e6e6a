pub mod channel;
pub mod config;
pub mod page;
pub mod store;

pub use channel::{PageChannel, PageMessage, PageReply};
pub use config::{Config, Provider, RetryConfig, Settings};
pub use page::{AssistantCall, PageTrait, ScriptOutcome, ELEMENT_ID_BINDING, MARKER_ATTRIBUTE};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
