use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub archives: ArchivesConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    expand_home("~/.recall/vectors.db")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchivesConfig {
    /// Path to the chat message store (a SQLite database).
    #[serde(default = "default_chat_db")]
    pub chat_db: PathBuf,
    /// Root of the mail archive (per-folder `.mbox` containers).
    #[serde(default = "default_mail_dir")]
    pub mail_dir: PathBuf,
}

impl Default for ArchivesConfig {
    fn default() -> Self {
        Self {
            chat_db: default_chat_db(),
            mail_dir: default_mail_dir(),
        }
    }
}

fn default_chat_db() -> PathBuf {
    expand_home("~/Library/Messages/chat.db")
}

fn default_mail_dir() -> PathBuf {
    expand_home("~/Library/Mail/V10")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// A gap longer than this between two messages from the same contact
    /// starts a new conversation chunk.
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
        }
    }
}

fn default_window_hours() -> i64 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of the local inference service.
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_embed_model")]
    pub model: String,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_embed_model(),
            max_retries: default_embed_retries(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_embed_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_embed_retries() -> u32 {
    2
}

/// Config-file defaults for generation. The effective values are resolved
/// per call through [`crate::settings::SettingsStore`], which layers saved
/// settings and environment variables on top of these.
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `"ollama"` or `"openai"`.
    #[serde(default = "default_gen_backend")]
    pub backend: String,
    #[serde(default = "default_gen_model")]
    pub model: String,
    /// Base URL for the OpenAI-compatible backend. Unused for `"ollama"`.
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Base URL of the local inference service used when backend = "ollama".
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            backend: default_gen_backend(),
            model: default_gen_model(),
            api_url: String::new(),
            api_key: String::new(),
            ollama_url: default_ollama_url(),
        }
    }
}

fn default_gen_backend() -> String {
    "ollama".to_string()
}
fn default_gen_model() -> String {
    "gemma3:4b".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5391
}

impl Config {
    /// Path of the mutable settings file, kept next to the vector store.
    pub fn settings_path(&self) -> PathBuf {
        self.db
            .path
            .parent()
            .map(|p| p.join("settings.json"))
            .unwrap_or_else(|| PathBuf::from("settings.json"))
    }
}

/// Default location of the config file.
pub fn default_config_path() -> PathBuf {
    expand_home("~/.recall/config.toml")
}

/// Load configuration from a TOML file. A missing file is not an error —
/// the defaults make the tool usable without any configuration.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.window_hours <= 0 {
        anyhow::bail!("chunking.window_hours must be > 0");
    }

    match config.generation.backend.as_str() {
        "ollama" | "openai" => {}
        other => anyhow::bail!(
            "Unknown generation backend: '{}'. Must be ollama or openai.",
            other
        ),
    }

    Ok(config)
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/recall.toml")).unwrap();
        assert_eq!(config.chunking.window_hours, 4);
        assert_eq!(config.generation.backend, "ollama");
        assert_eq!(config.server.port, 5391);
    }

    #[test]
    fn rejects_unknown_backend() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[generation]\nbackend = \"bedrock\"\n").unwrap();
        assert!(load_config(tmp.path()).is_err());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[chunking]\nwindow_hours = 8\n").unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.chunking.window_hours, 8);
        assert_eq!(config.embedding.model, "nomic-embed-text");
    }
}
