use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemixError {
    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cannot access this page: {0}")]
    PageAccess(String),

    #[error("Page is not reachable: {0}")]
    PageUnreachable(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("JavaScript execution failed: {0}")]
    JavaScriptFailed(String),

    #[error("Assistant bridge request {0} timed out")]
    BridgeTimeout(u64),

    #[error("Assistant bridge closed")]
    BridgeClosed,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Chrome error: {0}")]
    ChromeError(String),

    #[error("Anyhow error: {0}")]
    AnyhowError(String),
}

pub type Result<T> = std::result::Result<T, RemixError>;

// Convert anyhow::Error to RemixError
impl From<anyhow::Error> for RemixError {
    fn from(err: anyhow::Error) -> Self {
        RemixError::AnyhowError(err.to_string())
    }
}

impl RemixError {
    /// Whether the error should be shown to the user as-is and end the turn.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            RemixError::Configuration(_) | RemixError::PageAccess(_) | RemixError::Provider(_)
        )
    }
}
