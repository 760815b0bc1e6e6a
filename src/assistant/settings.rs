use crate::core::store::SETTINGS_KEY;
use crate::core::{KeyValueStore, Settings};
use crate::errors::Result;
use std::sync::Arc;

/// Typed access to the persisted [`Settings`]. No API key is ever defaulted.
pub struct SettingsStore<S: ?Sized> {
    store: Arc<S>,
    env_overrides: bool,
}

impl<S: ?Sized> Clone for SettingsStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            env_overrides: self.env_overrides,
        }
    }
}

impl<S: KeyValueStore + ?Sized> SettingsStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            env_overrides: false,
        }
    }

    /// Let `REMIX_*` environment variables override what is stored. The
    /// overrides are never written back.
    pub fn with_env_overrides(mut self) -> Self {
        self.env_overrides = true;
        self
    }

    pub async fn load(&self) -> Result<Settings> {
        let mut settings = match self.store.get(SETTINGS_KEY).await? {
            Some(value) => serde_json::from_value(value)?,
            None => Settings::default(),
        };
        if self.env_overrides {
            settings.apply_env();
        }
        Ok(settings)
    }

    pub async fn save(&self, settings: &Settings) -> Result<()> {
        self.store
            .set(SETTINGS_KEY, serde_json::to_value(settings)?)
            .await
    }
}
