//! Mutable generation settings, persisted as JSON next to the vector store.
//!
//! Only the four generation keys (backend, model, api_url, api_key) are
//! mutable at runtime; archive paths, chunking, and embedding stay in the
//! config file. Read accessors resolve saved values first, then
//! environment variables, then config defaults, so the clients pick up
//! changes at call time rather than caching them for the life of a job.
//!
//! The in-memory cache is invalidated explicitly by [`SettingsStore::save`];
//! there is no timestamp-based revalidation.

use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;

/// Saved overrides. Absent fields fall through to env/config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_api_key: Option<String>,
}

impl SavedSettings {
    fn merge(&mut self, other: SavedSettings) {
        if other.generation_backend.is_some() {
            self.generation_backend = other.generation_backend;
        }
        if other.generation_model.is_some() {
            self.generation_model = other.generation_model;
        }
        if other.generation_api_url.is_some() {
            self.generation_api_url = other.generation_api_url;
        }
        if other.generation_api_key.is_some() {
            self.generation_api_key = other.generation_api_key;
        }
    }
}

/// The effective generation settings after layering.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveSettings {
    pub backend: String,
    pub model: String,
    pub api_url: String,
    pub api_key: String,
    pub ollama_url: String,
}

pub struct SettingsStore {
    path: PathBuf,
    defaults: GenerationConfig,
    cache: RwLock<Option<SavedSettings>>,
}

impl SettingsStore {
    pub fn new(path: PathBuf, defaults: GenerationConfig) -> Self {
        Self {
            path,
            defaults,
            cache: RwLock::new(None),
        }
    }

    fn load(&self) -> SavedSettings {
        if let Some(cached) = self.cache.read().expect("settings lock").clone() {
            return cached;
        }

        let loaded = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        *self.cache.write().expect("settings lock") = Some(loaded);
        self.cache
            .read()
            .expect("settings lock")
            .clone()
            .unwrap_or_default()
    }

    /// Merge `update` into the saved settings, write them to disk, and
    /// replace the cache with the merged result.
    pub fn save(&self, update: SavedSettings) -> Result<()> {
        let mut merged = self.load();
        merged.merge(update);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&merged)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write settings: {}", self.path.display()))?;

        *self.cache.write().expect("settings lock") = Some(merged);
        Ok(())
    }

    pub fn backend(&self) -> String {
        self.resolve(
            |s| s.generation_backend.clone(),
            "GENERATION_BACKEND",
            &self.defaults.backend,
        )
    }

    pub fn model(&self) -> String {
        self.resolve(
            |s| s.generation_model.clone(),
            "GENERATION_MODEL",
            &self.defaults.model,
        )
    }

    pub fn api_url(&self) -> String {
        self.resolve(
            |s| s.generation_api_url.clone(),
            "GENERATION_API_URL",
            &self.defaults.api_url,
        )
    }

    pub fn api_key(&self) -> String {
        self.resolve(
            |s| s.generation_api_key.clone(),
            "GENERATION_API_KEY",
            &self.defaults.api_key,
        )
    }

    pub fn ollama_url(&self) -> String {
        self.defaults.ollama_url.clone()
    }

    pub fn effective(&self) -> EffectiveSettings {
        EffectiveSettings {
            backend: self.backend(),
            model: self.model(),
            api_url: self.api_url(),
            api_key: self.api_key(),
            ollama_url: self.ollama_url(),
        }
    }

    fn resolve(
        &self,
        saved: impl Fn(&SavedSettings) -> Option<String>,
        env_var: &str,
        default: &str,
    ) -> String {
        if let Some(value) = saved(&self.load()).filter(|v| !v.is_empty()) {
            return value;
        }
        if let Ok(value) = std::env::var(env_var) {
            if !value.is_empty() {
                return value;
            }
        }
        default.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SettingsStore {
        SettingsStore::new(
            dir.path().join("settings.json"),
            GenerationConfig::default(),
        )
    }

    #[test]
    fn defaults_when_no_file() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert_eq!(s.backend(), "ollama");
        assert_eq!(s.model(), "gemma3:4b");
    }

    #[test]
    fn save_invalidates_cache() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);

        // Prime the cache with the default view.
        assert_eq!(s.backend(), "ollama");

        s.save(SavedSettings {
            generation_backend: Some("openai".to_string()),
            generation_model: Some("gpt-4o-mini".to_string()),
            ..Default::default()
        })
        .unwrap();

        // The write path busted the cache: reads see the new values
        // without any file-timestamp comparison.
        assert_eq!(s.backend(), "openai");
        assert_eq!(s.model(), "gpt-4o-mini");
    }

    #[test]
    fn save_merges_with_existing() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);

        s.save(SavedSettings {
            generation_model: Some("llama3.2".to_string()),
            ..Default::default()
        })
        .unwrap();
        s.save(SavedSettings {
            generation_api_url: Some("http://localhost:8080/v1".to_string()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(s.model(), "llama3.2");
        assert_eq!(s.api_url(), "http://localhost:8080/v1");
    }
}
