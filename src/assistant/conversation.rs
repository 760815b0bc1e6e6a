use crate::assistant::client::{ChatMessage, ChatRole};
use crate::assistant::elements::normalize_url;
use crate::core::store::CONVERSATIONS_PREFIX;
use crate::core::KeyValueStore;
use crate::errors::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_element: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_element_update: bool,
}

impl ConversationEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            has_element: false,
            is_element_update: false,
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        has_element: bool,
        is_element_update: bool,
    ) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            has_element,
            is_element_update,
        }
    }

    pub fn to_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Per-URL chat log, oldest entries evicted past the cap.
pub struct ConversationLog<S: ?Sized> {
    store: Arc<S>,
    cap: usize,
}

impl<S: ?Sized> Clone for ConversationLog<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cap: self.cap,
        }
    }
}

fn key_for(url: &str) -> String {
    format!("{CONVERSATIONS_PREFIX}{}", normalize_url(url))
}

impl<S: KeyValueStore + ?Sized> ConversationLog<S> {
    pub fn new(store: Arc<S>, cap: usize) -> Self {
        Self {
            store,
            cap: cap.max(1),
        }
    }

    pub async fn entries(&self, url: &str) -> Result<Vec<ConversationEntry>> {
        match self.store.get(&key_for(url)).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// The most recent `turns` entries, oldest first.
    pub async fn history(&self, url: &str, turns: usize) -> Result<Vec<ConversationEntry>> {
        let entries = self.entries(url).await?;
        let skip = entries.len().saturating_sub(turns);
        Ok(entries.into_iter().skip(skip).collect())
    }

    pub async fn append(&self, url: &str, entry: ConversationEntry) -> Result<()> {
        let _guard = self.store.write_lock().lock().await;
        let mut entries = self.entries(url).await?;
        entries.push(entry);
        if entries.len() > self.cap {
            let excess = entries.len() - self.cap;
            entries.drain(..excess);
        }
        self.store
            .set(&key_for(url), serde_json::to_value(&entries)?)
            .await
    }

    pub async fn clear(&self, url: &str) -> Result<()> {
        let _guard = self.store.write_lock().lock().await;
        self.store
            .set(&key_for(url), serde_json::Value::Array(Vec::new()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MemoryStore;

    #[tokio::test]
    async fn the_51st_entry_evicts_the_oldest() {
        let log = ConversationLog::new(Arc::new(MemoryStore::new()), 50);
        for i in 0..51 {
            log.append("https://example.com/", ConversationEntry::user(format!("m{i}")))
                .await
                .unwrap();
        }

        let entries = log.entries("https://example.com/").await.unwrap();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0].content, "m1");
        assert_eq!(entries[49].content, "m50");
    }

    #[tokio::test]
    async fn logs_are_keyed_by_normalized_url() {
        let store = Arc::new(MemoryStore::new());
        let log = ConversationLog::new(store.clone(), 50);
        log.append("https://example.com/a#one", ConversationEntry::user("hi"))
            .await
            .unwrap();
        log.append(
            "https://example.com/a#two",
            ConversationEntry::assistant("done", true, false),
        )
        .await
        .unwrap();

        assert_eq!(log.entries("https://example.com/a").await.unwrap().len(), 2);
        assert!(log.entries("https://example.com/b").await.unwrap().is_empty());

        let raw = store
            .get("conversations:https://example.com/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw[1]["hasElement"], true);
        assert!(raw[0].get("hasElement").is_none());
    }

    #[tokio::test]
    async fn history_returns_the_latest_turns_in_order() {
        let log = ConversationLog::new(Arc::new(MemoryStore::new()), 50);
        for i in 0..5 {
            log.append("https://example.com/", ConversationEntry::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let history = log.history("https://example.com/", 2).await.unwrap();
        let contents: Vec<_> = history.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["m3", "m4"]);

        log.clear("https://example.com/").await.unwrap();
        assert!(log.history("https://example.com/", 2).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_from_separate_logs_are_all_kept() {
        let store = Arc::new(MemoryStore::new());
        let mut appends = Vec::new();
        for i in 0..100 {
            let log = ConversationLog::new(store.clone(), 500);
            appends.push(tokio::spawn(async move {
                log.append("https://example.com/", ConversationEntry::user(format!("m{i}")))
                    .await
            }));
        }
        for append in appends {
            append.await.unwrap().unwrap();
        }

        let log = ConversationLog::new(store, 500);
        assert_eq!(log.entries("https://example.com/").await.unwrap().len(), 100);
    }
}
