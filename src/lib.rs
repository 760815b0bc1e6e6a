pub mod assistant;
pub mod browser;
pub mod core;
pub mod dom;
pub mod errors;
pub mod inject;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod utils;

pub use assistant::{Element, ElementCode, ElementStore, Orchestrator, ProviderClient, TurnOutcome};
pub use browser::{ChromeBrowser, ChromePage, ContentAgent};
pub use crate::core::{Config, JsonFileStore, KeyValueStore, MemoryStore, PageTrait, Settings};
pub use dom::{PageContext, PageContextBuilder, SelectorSynthesizer};
pub use errors::{RemixError, Result};
pub use inject::InjectionEngine;
