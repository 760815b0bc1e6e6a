use crate::core::store::ELEMENTS_KEY;
use crate::core::KeyValueStore;
use crate::errors::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

pub const MAX_NAME_CHARS: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementCode {
    #[serde(default)]
    pub js: String,
    #[serde(default)]
    pub css: String,
}

impl ElementCode {
    pub fn is_empty(&self) -> bool {
        self.js.trim().is_empty() && self.css.trim().is_empty()
    }

    /// Equal after trimming each half. Reformatted code is not caught.
    pub fn same_as(&self, other: &ElementCode) -> bool {
        self.js.trim() == other.js.trim() && self.css.trim() == other.css.trim()
    }
}

/// One persisted page customization. Updates replace the code wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: String,
    pub url: String,
    pub hostname: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub code: ElementCode,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Element {
    pub fn new(url: &str, name: &str, description: &str, code: ElementCode) -> Self {
        let now = Utc::now();
        Self {
            id: generate_element_id(),
            url: normalize_url(url),
            hostname: hostname_of(url),
            name: clamp_name(name),
            description: description.trim().to_string(),
            code,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn replace_code(&mut self, code: ElementCode) {
        self.code = code;
        self.updated_at = Utc::now();
    }
}

pub fn generate_element_id() -> String {
    format!("el_{}", Uuid::new_v4().simple())
}

fn clamp_name(name: &str) -> String {
    let name = name.trim();
    let name = if name.is_empty() { "Untitled element" } else { name };
    name.chars().take(MAX_NAME_CHARS).collect()
}

/// Scheme, host, path and query; the fragment is dropped.
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.trim().split('#').next().unwrap_or_default().to_string(),
    }
}

pub fn hostname_of(raw: &str) -> String {
    Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// The persisted element list. Writes hold the underlying store's write lock,
/// so every handle onto one store sees the others' updates.
pub struct ElementStore<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for ElementStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: KeyValueStore + ?Sized> ElementStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> Result<Vec<Element>> {
        match self.store.get(ELEMENTS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Elements to re-establish on `url`: same normalized URL and enabled.
    pub async fn for_url(&self, url: &str) -> Result<Vec<Element>> {
        let key = normalize_url(url);
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.enabled && e.url == key)
            .collect())
    }

    /// Every element saved for `url`, enabled or not.
    pub async fn all_for_url(&self, url: &str) -> Result<Vec<Element>> {
        let key = normalize_url(url);
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.url == key)
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Element>> {
        Ok(self.list().await?.into_iter().find(|e| e.id == id))
    }

    pub async fn upsert(&self, element: Element) -> Result<()> {
        let _guard = self.store.write_lock().lock().await;
        let mut elements = self.list().await?;
        match elements.iter_mut().find(|e| e.id == element.id) {
            Some(existing) => *existing = element,
            None => elements.push(element),
        }
        self.write(&elements).await
    }

    pub async fn delete(&self, id: &str) -> Result<Option<Element>> {
        let _guard = self.store.write_lock().lock().await;
        let mut elements = self.list().await?;
        let Some(index) = elements.iter().position(|e| e.id == id) else {
            return Ok(None);
        };
        let removed = elements.remove(index);
        self.write(&elements).await?;
        Ok(Some(removed))
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Option<Element>> {
        self.modify(id, |element| {
            element.enabled = enabled;
            element.updated_at = Utc::now();
        })
        .await
    }

    pub async fn replace_code(&self, id: &str, code: ElementCode) -> Result<Option<Element>> {
        self.modify(id, move |element| element.replace_code(code)).await
    }

    async fn modify<F>(&self, id: &str, change: F) -> Result<Option<Element>>
    where
        F: FnOnce(&mut Element),
    {
        let _guard = self.store.write_lock().lock().await;
        let mut elements = self.list().await?;
        let Some(element) = elements.iter_mut().find(|e| e.id == id) else {
            return Ok(None);
        };
        change(element);
        let updated = element.clone();
        self.write(&elements).await?;
        Ok(Some(updated))
    }

    async fn write(&self, elements: &[Element]) -> Result<()> {
        self.store
            .set(ELEMENTS_KEY, serde_json::to_value(elements)?)
            .await
    }
}
