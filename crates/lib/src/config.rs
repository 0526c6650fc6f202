//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.kijang/config.json`) and environment.
//! Every section has defaults, so an empty `{}` file is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::fragment::{DEFAULT_TERMINAL_TYPE, DEFAULT_THINKING_TYPE};
use crate::prompts::StarterPrompt;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Agent server location and endpoints.
    #[serde(default)]
    pub server: ServerConfig,

    /// How event-stream payload types are classified.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Identity used when the CLI is not given one.
    #[serde(default)]
    pub user: UserConfig,

    /// Suggested first messages. Empty means the built-in set.
    #[serde(default)]
    pub prompts: Vec<StarterPrompt>,
}

/// Agent server base URL and endpoint paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Base URL (default "http://localhost:8000"). Overridden by KIJANG_SERVER_URL env.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path that accepts a user message (POST).
    #[serde(default = "default_message_path")]
    pub message_path: String,

    /// Path prefix of the event stream; `/{user_id}/{session_id}` is appended.
    #[serde(default = "default_events_path")]
    pub events_path: String,

    /// Timeout for the message POST in seconds. Does not apply to the event stream.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_message_path() -> String {
    "/api/chat/message".to_string()
}

fn default_events_path() -> String {
    "/api/chat/events".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            message_path: default_message_path(),
            events_path: default_events_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Payload `type` values with special meaning on the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Intermediate steps: never merged into reply text.
    #[serde(default = "default_thinking_types")]
    pub thinking_types: Vec<String>,

    /// Reply-complete markers.
    #[serde(default = "default_terminal_types")]
    pub terminal_types: Vec<String>,

    /// Types dropped entirely (e.g. tool call events the UI has no use for).
    #[serde(default)]
    pub ignored_types: Vec<String>,
}

fn default_thinking_types() -> Vec<String> {
    vec![DEFAULT_THINKING_TYPE.to_string()]
}

fn default_terminal_types() -> Vec<String> {
    vec![DEFAULT_TERMINAL_TYPE.to_string()]
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            thinking_types: default_thinking_types(),
            terminal_types: default_terminal_types(),
            ignored_types: Vec::new(),
        }
    }
}

/// Default identity. Overridden by KIJANG_USER_ID env.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    pub id: Option<String>,
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the server base URL: env KIJANG_SERVER_URL overrides config. Trailing slashes are removed.
pub fn resolve_server_url(config: &Config) -> String {
    non_empty_env("KIJANG_SERVER_URL")
        .unwrap_or_else(|| config.server.base_url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve the user id: env KIJANG_USER_ID overrides config.
pub fn resolve_user_id(config: &Config) -> Option<String> {
    non_empty_env("KIJANG_USER_ID").or_else(|| {
        config
            .user
            .id
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("KIJANG_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".kijang").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
