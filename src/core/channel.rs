use crate::assistant::elements::ElementCode;
use crate::dom::{FragmentResult, PageContext};
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tab-scoped requests sent to the page side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageMessage {
    GetPageContext,
    #[serde(rename_all = "camelCase")]
    GetDomFragment {
        selector: String,
        max_length: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    InjectElement {
        element_id: String,
        code: ElementCode,
    },
    #[serde(rename_all = "camelCase")]
    RemoveElement {
        element_id: String,
    },
    ExecuteReload,
    ExecuteAutoload,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageReply {
    PageContext(PageContext),
    DomFragment(FragmentResult),
    Done,
    Pong,
    Error { message: String },
}

/// Request/response messaging with the content side of one tab.
#[async_trait]
pub trait PageChannel: Send + Sync {
    /// Fails with `PageUnreachable` when nothing answers on the page side.
    async fn send(&self, message: PageMessage) -> Result<PageReply>;

    /// Re-inject the content side after `send` found it unreachable.
    async fn reconnect(&self) -> Result<()>;
}
