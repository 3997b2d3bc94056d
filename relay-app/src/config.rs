//! chatrelay configuration loader.
//!
//! TOML file first, then `.env`, then process environment overrides.

use relay_assistant::{DEFAULT_BASE_URL, ReasoningEffort};
use relay_core::policy::{LogLevel, parse_log_level};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            instructions: None,
            reasoning_effort: None,
            base_url: default_base_url(),
        }
    }
}

fn default_model() -> String {
    "gpt-5-codex".to_string()
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub webchat: WebChatConfig,
    /// Identifier the platform uses for this bot in mention lists. Without it
    /// group messages are never answered.
    #[serde(default)]
    pub bot_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebChatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for WebChatConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_max_message_age_seconds")]
    pub max_message_age_seconds: u64,
    #[serde(default = "default_run_timeout_seconds")]
    pub run_timeout_seconds: u64,
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: default_dedup_capacity(),
            max_message_age_seconds: default_max_message_age_seconds(),
            run_timeout_seconds: default_run_timeout_seconds(),
            inbound_buffer: default_inbound_buffer(),
        }
    }
}

fn default_dedup_capacity() -> usize {
    relay_core::DEFAULT_DEDUP_CAPACITY
}

fn default_max_message_age_seconds() -> u64 {
    60
}

fn default_run_timeout_seconds() -> u64 {
    600
}

fn default_inbound_buffer() -> usize {
    1024
}

impl GatewayConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    pub fn max_message_age(&self) -> chrono::Duration {
        let secs = i64::try_from(self.max_message_age_seconds).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_dashboard_host")]
    pub host: String,
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
    /// Bearer token for `/api/*`. When unset only loopback peers are allowed.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_max_logs")]
    pub max_logs: usize,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: default_dashboard_host(),
            port: default_dashboard_port(),
            api_token: None,
            max_logs: default_max_logs(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_dashboard_host() -> String {
    "127.0.0.1".to_string()
}

fn default_dashboard_port() -> u16 {
    3000
}

fn default_max_logs() -> usize {
    500
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

impl DashboardConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("dashboard.host {:?} is not an ip address: {e}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
}

impl RuntimeConfig {
    pub fn log_level(&self) -> LogLevel {
        parse_log_level(self.log_level.as_deref())
    }

    pub fn data_dir_path(&self) -> anyhow::Result<PathBuf> {
        match self.data_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => expand_home(dir),
            _ => Ok(default_data_dir()),
        }
    }
}

impl RelayConfig {
    /// Load from `path`, or from the default location when none is given.
    /// A missing default file yields built-in defaults; a missing explicit
    /// file is an error.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(config_path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to load .env file");
            }
        }
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = var("RELAY_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = var("RELAY_BASE_URL") {
            self.general.base_url = v;
        }
        if let Some(v) = var("RELAY_REASONING_EFFORT") {
            match serde_json::from_value::<ReasoningEffort>(serde_json::Value::String(
                v.trim().to_ascii_lowercase(),
            )) {
                Ok(effort) => self.general.reasoning_effort = Some(effort),
                Err(_) => tracing::warn!(value = %v, "ignoring unknown RELAY_REASONING_EFFORT"),
            }
        }
        if let Some(v) = var("RELAY_BOT_ID") {
            self.channels.bot_id = Some(v);
        }
        if let Some(v) = var("WEB_HOST") {
            self.dashboard.host = v;
        }
        if let Some(v) = var("WEB_PORT") {
            match v.trim().parse::<u16>() {
                Ok(port) => self.dashboard.port = port,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid WEB_PORT"),
            }
        }
        if let Some(v) = var("WEB_API_TOKEN") {
            self.dashboard.api_token = Some(v);
        }
        if let Some(v) = var("RELAY_LOG_LEVEL") {
            self.runtime.log_level = Some(v);
        }
        if let Some(v) = var("RELAY_DATA_DIR") {
            self.runtime.data_dir = Some(v);
        }
        if let Some(v) = var("RELAY_RUN_TIMEOUT_SECONDS") {
            match v.trim().parse::<u64>() {
                Ok(secs) => self.gateway.run_timeout_seconds = secs,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid RELAY_RUN_TIMEOUT_SECONDS"),
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.dashboard.port == 0 {
            return Err(anyhow::anyhow!("dashboard.port must be > 0"));
        }
        if self.gateway.dedup_capacity == 0 {
            return Err(anyhow::anyhow!("gateway.dedup_capacity must be > 0"));
        }
        if self.gateway.run_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("gateway.run_timeout_seconds must be > 0"));
        }
        if self.gateway.inbound_buffer == 0 {
            return Err(anyhow::anyhow!("gateway.inbound_buffer must be > 0"));
        }
        if self.dashboard.max_logs == 0 {
            return Err(anyhow::anyhow!("dashboard.max_logs must be > 0"));
        }
        self.dashboard.bind_addr()?;
        Ok(())
    }

    pub fn api_key(&self) -> Option<String> {
        self.keys
            .openai_api_key
            .clone()
            .filter(|s| !s.trim().is_empty())
    }

    pub fn bot_id(&self) -> Option<&str> {
        self.channels.bot_id.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn dashboard_api_token(&self) -> Option<&str> {
        self.dashboard
            .api_token
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".chatrelay").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".chatrelay").join("data")
}

fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    if !path.starts_with("~/") {
        return Ok(PathBuf::from(path));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(path.replacen('~', &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = RelayConfig::parse("").expect("empty config parses");
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.gateway.dedup_capacity, 1000);
        assert_eq!(cfg.gateway.max_message_age_seconds, 60);
        assert_eq!(cfg.gateway.run_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.dashboard.max_logs, 500);
        assert_eq!(
            cfg.dashboard.bind_addr().expect("bind addr").to_string(),
            "127.0.0.1:3000"
        );
        assert!(cfg.channels.webchat.enabled);
        assert_eq!(cfg.runtime.log_level(), LogLevel::Info);
        assert!(cfg.bot_id().is_none());
    }

    #[test]
    fn parses_full_file() {
        let cfg = RelayConfig::parse(
            r#"
[general]
model = "gpt-5"
instructions = "Answer in the chat's language."
reasoning_effort = "high"

[channels]
bot_id = "ou_bot_123"

[channels.webchat]
enabled = false

[gateway]
dedup_capacity = 50
run_timeout_seconds = 120

[dashboard]
host = "0.0.0.0"
port = 8080
api_token = "secret"

[runtime]
log_level = "DEBUG"
"#,
        )
        .expect("config parses");
        cfg.validate().expect("config validates");
        assert_eq!(cfg.general.model, "gpt-5");
        assert_eq!(cfg.general.reasoning_effort, Some(ReasoningEffort::High));
        assert_eq!(cfg.bot_id(), Some("ou_bot_123"));
        assert!(!cfg.channels.webchat.enabled);
        assert_eq!(cfg.gateway.dedup_capacity, 50);
        assert_eq!(cfg.gateway.max_message_age_seconds, 60);
        assert_eq!(cfg.dashboard_api_token(), Some("secret"));
        assert_eq!(cfg.runtime.log_level(), LogLevel::Debug);
    }

    #[test]
    fn env_overrides_apply_and_ignore_blank_or_invalid_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OPENAI_API_KEY", "sk-env"),
            ("RELAY_MODEL", "gpt-env"),
            ("RELAY_BOT_ID", "ou_env"),
            ("WEB_PORT", "not-a-port"),
            ("WEB_API_TOKEN", "   "),
            ("RELAY_REASONING_EFFORT", "Low"),
            ("RELAY_RUN_TIMEOUT_SECONDS", "45"),
        ]);
        let mut cfg = RelayConfig::default();
        cfg.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(cfg.api_key().as_deref(), Some("sk-env"));
        assert_eq!(cfg.general.model, "gpt-env");
        assert_eq!(cfg.bot_id(), Some("ou_env"));
        assert_eq!(cfg.dashboard.port, 3000);
        assert!(cfg.dashboard_api_token().is_none());
        assert_eq!(cfg.general.reasoning_effort, Some(ReasoningEffort::Low));
        assert_eq!(cfg.gateway.run_timeout_seconds, 45);
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut cfg = RelayConfig::default();
        cfg.gateway.run_timeout_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.gateway.dedup_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.dashboard.host = "localhost:3000".to_string();
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("chatrelay-missing-{}.toml", uuid::Uuid::new_v4()));
        let err = RelayConfig::load_with_path(Some(path))
            .await
            .expect_err("missing file");
        assert!(err.to_string().contains("read config"));
    }
}
