use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Reserved attribute carried by every node the engine (or generated code) owns.
pub const MARKER_ATTRIBUTE: &str = "data-remix-id";

/// Identifier generated code can use for the element it belongs to.
pub const ELEMENT_ID_BINDING: &str = "ELEMENT_ID";

/// Result of running one piece of generated code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutcome {
    pub error: Option<String>,
}

impl ScriptOutcome {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn threw(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
        }
    }
}

/// A `callAssistant(prompt, options)` request raised by code running in the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantCall {
    pub id: u64,
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Low-level access to one live page.
///
/// Everything here is a single DOM query or mutation on the page side; retry
/// policy and bookkeeping live in the injection engine.
#[async_trait]
pub trait PageTrait: Send + Sync {
    /// Current location, including the fragment.
    async fn url(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;

    /// Serialised `document.documentElement`.
    async fn document_html(&self) -> Result<String>;

    /// Append a `<style>` tagged with `owner` to the document head.
    async fn insert_style(&self, owner: &str, css: &str) -> Result<()>;

    /// Install `find`, `findAll`, `findByText`, `closest` and `callAssistant`.
    async fn install_helpers(&self, bridge_timeout_ms: u64) -> Result<()>;

    /// Run generated code in a function scope with `ELEMENT_ID` bound to `owner`.
    async fn run_script(&self, owner: &str, js: &str) -> Result<ScriptOutcome>;

    /// Number of nodes whose marker attribute equals `marker`, not counting the
    /// engine's own `<style>` tags.
    async fn count_marked(&self, marker: &str) -> Result<usize>;

    /// Remove every node whose marker attribute equals `marker`.
    async fn remove_marked(&self, marker: &str) -> Result<usize>;

    /// Like [`remove_marked`](Self::remove_marked) but leaves the engine's
    /// `<style>` tags in place.
    async fn remove_created(&self, marker: &str) -> Result<usize>;

    /// Remove every node carrying the marker attribute at all.
    async fn remove_all_marked(&self) -> Result<usize>;

    async fn reload(&self) -> Result<()>;

    /// Fires (coalescing is the subscriber's job) whenever the DOM changes.
    fn mutations(&self) -> broadcast::Receiver<()>;

    /// Fires on history API calls, `popstate` and `hashchange`.
    fn history_events(&self) -> broadcast::Receiver<()>;

    /// Fires when a load replaces the document, including reloads of the
    /// same URL.
    fn document_replaced(&self) -> broadcast::Receiver<()>;

    /// Drain pending `callAssistant` requests raised by page code.
    async fn take_assistant_calls(&self) -> Result<Vec<AssistantCall>> {
        Ok(Vec::new())
    }

    /// Resolve or reject a pending `callAssistant` promise.
    async fn settle_assistant_call(
        &self,
        _id: u64,
        _result: std::result::Result<String, String>,
    ) -> Result<()> {
        Ok(())
    }
}
