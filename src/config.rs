//! Configuration management for grove
//!
//! Stores settings in ~/.config/grove/config.json. Every component receives
//! the values it needs at construction; nothing reads configuration globally.

use crate::cost::PriceTable;
use crate::models::ModelTable;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_BIND: &str = "127.0.0.1:8787";
pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP server listens on
    pub bind: String,
    /// Where analyses, the cost ledger and diagnostics live. Defaults to the
    /// platform data dir.
    pub data_dir: Option<PathBuf>,
    pub anthropic: AnthropicConfig,
    pub models: ModelTable,
    pub pricing: PriceTable,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    pub base_url: String,
    /// Mark stable prompt segments with cache_control breakpoints
    pub prompt_caching: bool,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of a running `grove serve`
    pub server_url: String,
    pub light_timeout_secs: u64,
    pub analyze_timeout_secs: u64,
    pub max_auto_retries: u32,
    /// Delays for connectivity/upstream retries; the last one repeats
    pub backoff_schedule_secs: Vec<u64>,
    /// Used for rate limits when the server gives no retry-after
    pub rate_limit_default_secs: u64,
    pub session_idle_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            data_dir: None,
            anthropic: AnthropicConfig::default(),
            models: ModelTable::default(),
            pricing: PriceTable::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ANTHROPIC_URL.to_string(),
            prompt_caching: true,
            request_timeout_secs: 60,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("http://{}", DEFAULT_BIND),
            light_timeout_secs: 10,
            analyze_timeout_secs: 90,
            max_auto_retries: 3,
            backoff_schedule_secs: vec![2, 5, 10],
            rate_limit_default_secs: 30,
            session_idle_minutes: 60,
        }
    }
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("grove"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return defaults. Environment overrides are
    /// applied either way.
    pub fn load() -> Self {
        let mut config = Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default();
        config.apply_env();
        config
    }

    /// Load from an explicit path. A corrupt file is moved aside to
    /// `config.json.corrupt` and defaults are used.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Overrides from GROVE_DATA_DIR, GROVE_BIND and ANTHROPIC_BASE_URL.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(dir) = non_empty("GROVE_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(bind) = non_empty("GROVE_BIND") {
            self.client.server_url = format!("http://{}", bind);
            self.bind = bind;
        }
        if let Some(url) = non_empty("ANTHROPIC_BASE_URL") {
            self.anthropic.base_url = url;
        }
    }

    /// Reject configurations that would fail mid-request.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.pricing.validate().context("invalid pricing table")?;
        for model in self.models.model_ids() {
            self.pricing
                .get(model)
                .with_context(|| format!("model '{}' has no pricing entry", model))?;
        }
        if self.client.backoff_schedule_secs.is_empty() {
            anyhow::bail!("client.backoff_schedule_secs must not be empty");
        }
        Ok(())
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|p| p.join("grove"))
                .unwrap_or_else(|| PathBuf::from(".grove"))
        })
    }

    /// Save config to disk
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir().context("Could not determine config directory")?;
        self.save_to(&dir.join("config.json"))
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    tracing::warn!(error = %e, "failed to set config directory permissions");
                }
            }
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        write_config_atomic(path, &content).context("Failed to write config")
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/grove/config.json".to_string())
    }
}

/// Resolve the Anthropic API key: environment first, then the keychain.
pub fn resolve_api_key() -> Option<String> {
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        if !key.trim().is_empty() {
            return Some(key);
        }
    }
    match crate::keyring::get_api_key() {
        Ok(key) => key,
        Err(err) => {
            crate::keyring::warn_keychain_error_once("the Anthropic API key", &err);
            None
        }
    }
}

/// Anthropic keys start with `sk-ant-`.
pub fn validate_api_key_format(key: &str) -> bool {
    key.starts_with("sk-ant-")
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            tracing::warn!(error = %e, "failed to set temp config file permissions");
        }
    }

    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
