use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tuning for the persistent-thread backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadBackendConfig {
    /// Pause before the final prompt is appended so it sorts after the
    /// bulk-appended history on the provider side.
    #[serde(default = "default_pre_prompt_delay_ms")]
    pub pre_prompt_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

fn default_pre_prompt_delay_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_run_timeout_secs() -> u64 {
    120
}

impl Default for ThreadBackendConfig {
    fn default() -> Self {
        Self {
            pre_prompt_delay_ms: default_pre_prompt_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            run_timeout_secs: default_run_timeout_secs(),
        }
    }
}

impl ThreadBackendConfig {
    pub fn pre_prompt_delay(&self) -> Duration {
        Duration::from_millis(self.pre_prompt_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // Storage
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // LLM provider (OpenAI-compatible)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // Conversation lifecycle
    #[serde(default = "default_chat_ttl_hours")]
    pub chat_ttl_hours: i64,
    #[serde(default = "default_focus_max_results")]
    pub default_focus_max_results: i64,

    // Backends
    #[serde(default = "default_true")]
    pub enable_completion_backend: bool,
    #[serde(default = "default_true")]
    pub enable_thread_backend: bool,
    #[serde(default)]
    pub thread: ThreadBackendConfig,

    // Turn persistence
    #[serde(default)]
    pub atomic_turn_writes: bool,
}

fn default_database_path() -> String {
    "mindkeep.db".to_string()
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_output_tokens() -> u32 {
    1024
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_chat_ttl_hours() -> i64 {
    24
}

fn default_focus_max_results() -> i64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            llm_api_url: default_llm_url(),
            llm_api_key: None,
            default_model: default_model(),
            max_output_tokens: default_max_output_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            chat_ttl_hours: default_chat_ttl_hours(),
            default_focus_max_results: default_focus_max_results(),
            enable_completion_backend: true,
            enable_thread_backend: true,
            thread: ThreadBackendConfig::default(),
            atomic_turn_writes: false,
        }
    }
}

impl EngineConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("mindkeep_config.toml")
    }

    /// Load config from mindkeep_config.toml (next to executable), falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from_path(&path) {
            Ok(Some(config)) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Ok(None) => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::from_env()
            }
            Err(e) => {
                tracing::error!("Failed to load {:?}: {:#}", path, e);
                Self::from_env()
            }
        }
    }

    /// Parse a TOML config file. Returns `Ok(None)` when the file does not exist.
    pub fn load_from_path(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        let config = toml::from_str::<EngineConfig>(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(Some(config))
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides(|key| env::var(key).ok());
        config
    }

    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("MINDKEEP_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Some(url) = lookup("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Some(key) = lookup("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key);
            }
        }

        if let Some(model) = lookup("LLM_MODEL") {
            self.default_model = model;
        }

        if let Some(tokens) = lookup("LLM_MAX_OUTPUT_TOKENS") {
            if let Ok(tokens) = tokens.parse() {
                self.max_output_tokens = tokens;
            }
        }

        if let Some(hours) = lookup("MINDKEEP_CHAT_TTL_HOURS") {
            if let Ok(hours) = hours.parse() {
                self.chat_ttl_hours = hours;
            }
        }

        if let Some(delay) = lookup("MINDKEEP_THREAD_PROMPT_DELAY_MS") {
            if let Ok(ms) = delay.parse() {
                self.thread.pre_prompt_delay_ms = ms;
            }
        }

        if let Some(timeout) = lookup("MINDKEEP_THREAD_RUN_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse() {
                self.thread.run_timeout_secs = secs;
            }
        }

        if let Some(enabled) = lookup("MINDKEEP_ATOMIC_TURN_WRITES") {
            self.atomic_turn_writes = parse_env_bool(&enabled);
        }
    }
}

fn parse_env_bool(raw: &str) -> bool {
    let raw = raw.trim();
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}
