use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::model::status::StatusEntry;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub linear: LinearConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub notify: Option<NotifyConfig>,
    #[serde(default)]
    pub statuses: Vec<StatusEntry>,
}

#[derive(Debug, Deserialize)]
pub struct LinearConfig {
    pub api_key: String,
    /// Team whose issues are mirrored; also the scope of the webhook.
    pub team_id: String,
    #[serde(default = "default_webhook_label")]
    pub webhook_label: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

#[derive(Debug, Deserialize)]
pub struct SyncConfig {
    pub root: PathBuf,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_comment_grace_ms")]
    pub comment_grace_ms: u64,
    /// Fixed offset every timestamp is rendered in, e.g. "+09:00".
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

#[derive(Debug, Deserialize)]
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Ngrok,
    Static,
}

#[derive(Debug, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_tunnel_kind")]
    pub provider: TunnelKind,
    #[serde(default = "default_ngrok_binary")]
    pub binary: String,
    /// Required when `provider = "static"`.
    pub public_url: Option<String>,
    #[serde(default = "default_session_lifetime_secs")]
    pub session_lifetime_secs: u64,
    #[serde(default = "default_rotation_margin_secs")]
    pub rotation_margin_secs: u64,
    #[serde(default = "default_failure_cooldown_secs")]
    pub failure_cooldown_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            provider: default_tunnel_kind(),
            binary: default_ngrok_binary(),
            public_url: None,
            session_lifetime_secs: default_session_lifetime_secs(),
            rotation_margin_secs: default_rotation_margin_secs(),
            failure_cooldown_secs: default_failure_cooldown_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delays_secs")]
    pub delays_secs: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delays_secs: default_delays_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NotifyConfig {
    /// Incoming-webhook URL of a chat integration.
    pub webhook_url: String,
}

fn default_webhook_label() -> String {
    "ticketsync".into()
}

fn default_api_url() -> String {
    "https://api.linear.app/graphql".into()
}

fn default_debounce_ms() -> u64 {
    3000
}

fn default_comment_grace_ms() -> u64 {
    2000
}

fn default_utc_offset() -> String {
    "+00:00".into()
}

fn default_bind() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    3847
}

fn default_tunnel_kind() -> TunnelKind {
    TunnelKind::Ngrok
}

fn default_ngrok_binary() -> String {
    "ngrok".into()
}

fn default_session_lifetime_secs() -> u64 {
    2 * 60 * 60
}

fn default_rotation_margin_secs() -> u64 {
    10 * 60
}

fn default_failure_cooldown_secs() -> u64 {
    5 * 60
}

fn default_max_attempts() -> u32 {
    crate::retry::DEFAULT_MAX_ATTEMPTS
}

fn default_delays_secs() -> Vec<u64> {
    vec![30, 180]
}

pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ticketsync")
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

pub fn pid_path() -> PathBuf {
    data_dir().join("daemon.pid")
}

pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    if !path.exists() {
        bail!(
            "No config found at {}. Create it with [linear], [sync] and [[statuses]] sections",
            path.display()
        );
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("Invalid config {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(contents).context("Failed to parse config.toml")?;
    if config.statuses.is_empty() {
        bail!("At least one [[statuses]] entry is required");
    }
    if config.tunnel.provider == TunnelKind::Static && config.tunnel.public_url.is_none() {
        bail!("tunnel.public_url is required when tunnel.provider = \"static\"");
    }
    if config.tunnel.rotation_margin_secs >= config.tunnel.session_lifetime_secs {
        bail!("tunnel.rotation_margin_secs must be shorter than tunnel.session_lifetime_secs");
    }
    Ok(config)
}
