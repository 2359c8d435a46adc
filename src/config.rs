//! Configuration management

use crate::usage::RateLimitConfig;
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Where durable objects live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Redis,
    Fs,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Ok(StorageBackend::Redis),
            "fs" | "file" | "filesystem" => Ok(StorageBackend::Fs),
            "memory" | "mem" => Ok(StorageBackend::Memory),
            other => bail!("Unknown STORAGE_BACKEND '{}' (expected redis, fs or memory)", other),
        }
    }
}

/// Bot configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token
    pub telegram_token: String,

    /// Telegram API base override (local Bot API server, tests)
    pub telegram_api_url: Option<String>,

    /// Bot username without `@`, used for group mentions and `/cmd@bot`
    pub bot_username: String,

    pub openai_key: String,
    pub openai_endpoint: String,
    pub openai_model: String,
    pub openai_timeout: Duration,

    /// Public base URL for response and file links
    pub base_url: String,

    /// Socket address to listen on
    pub listen_addr: String,

    /// Users exempt from rate limiting
    pub no_limit_users: HashSet<i64>,

    pub storage_backend: StorageBackend,
    pub redis_url: String,
    pub storage_dir: String,

    /// Lifetime of published responses and uploaded files
    pub retention: Duration,

    /// Conversation inactivity window
    pub conversation_ttl: Duration,
    pub conversation_max_messages: usize,

    pub rate_limit: RateLimitConfig,

    /// Interval between background sweeps
    pub sweep_interval: Duration,

    /// Trace every HTTP request
    pub log_requests: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram_token: String::new(),
            telegram_api_url: None,
            bot_username: String::new(),
            openai_key: String::new(),
            openai_endpoint: crate::llm::DEFAULT_ENDPOINT.to_string(),
            openai_model: crate::llm::DEFAULT_MODEL.to_string(),
            openai_timeout: Duration::from_secs(180),
            base_url: "http://localhost:8080".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            no_limit_users: HashSet::new(),
            storage_backend: StorageBackend::Fs,
            redis_url: "redis://127.0.0.1/".to_string(),
            storage_dir: "./data".to_string(),
            retention: Duration::from_secs(4 * 3600),
            conversation_ttl: Duration::from_secs(30 * 60),
            conversation_max_messages: crate::conversation::MAX_MESSAGES_PER_CONVERSATION,
            rate_limit: RateLimitConfig::default(),
            sweep_interval: Duration::from_secs(10 * 60),
            log_requests: true,
        }
    }
}

/// Parse a numeric variable, falling back to `default` (with a warning) when invalid
fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Invalid value for {}: '{}', using default", name, raw);
                default
            }
        },
        _ => default,
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(default)
}

/// Accepts `8080`, `:8080` or `host:8080`
pub fn parse_listen_addr(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "0.0.0.0:8080".to_string();
    }
    if let Some(port) = raw.strip_prefix(':') {
        return format!("0.0.0.0:{}", port);
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        return format!("0.0.0.0:{}", raw);
    }
    raw.to_string()
}

/// Comma-separated user ids; malformed entries are skipped
pub fn parse_user_ids(raw: &str) -> HashSet<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Ignoring invalid user id in NO_LIMIT_USERS: '{}'", s);
                None
            }
        })
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let storage_backend = match env_string("STORAGE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => defaults.storage_backend,
        };

        let bot_username = env_string("BOT_USERNAME")
            .map(|u| u.trim_start_matches('@').to_string())
            .unwrap_or_default();
        if bot_username.is_empty() {
            warn!("BOT_USERNAME is not set; group mentions and /cmd@bot will not match");
        }

        Ok(Self {
            telegram_token: env_string("TELEGRAM_TOKEN").unwrap_or_default(),
            telegram_api_url: env_string("TELEGRAM_API_URL"),
            bot_username,
            openai_key: env_string("OPENAI_KEY").unwrap_or_default(),
            openai_endpoint: env_string("OPENAI_ENDPOINT").unwrap_or(defaults.openai_endpoint),
            openai_model: env_string("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            openai_timeout: Duration::from_secs(env_parse("OPENAI_TIMEOUT_SECS", 180)),
            base_url: env_string("BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            listen_addr: parse_listen_addr(&std::env::var("PORT").unwrap_or_default()),
            no_limit_users: parse_user_ids(&std::env::var("NO_LIMIT_USERS").unwrap_or_default()),
            storage_backend,
            redis_url: env_string("REDIS_URL").unwrap_or(defaults.redis_url),
            storage_dir: env_string("STORAGE_DIR").unwrap_or(defaults.storage_dir),
            retention: Duration::from_secs(env_parse("RETENTION_SECS", 4 * 3600)),
            conversation_ttl: Duration::from_secs(env_parse("CONVERSATION_TTL_SECS", 30 * 60)),
            conversation_max_messages: env_parse(
                "CONVERSATION_MAX_MESSAGES",
                defaults.conversation_max_messages,
            ),
            rate_limit: RateLimitConfig {
                max_actions: env_parse("RATE_LIMIT_MAX", defaults.rate_limit.max_actions),
                window: Duration::from_secs(env_parse("RATE_LIMIT_WINDOW_SECS", 600)),
            },
            sweep_interval: Duration::from_secs(env_parse("SWEEP_INTERVAL_SECS", 600)),
            log_requests: env_bool("LOG_REQUESTS", true),
        })
    }

    /// Fail on settings the running bot cannot do without
    pub fn validate(&self) -> Result<()> {
        if self.telegram_token.is_empty() {
            bail!("TELEGRAM_TOKEN must be set");
        }
        if self.openai_key.is_empty() {
            bail!("OPENAI_KEY must be set");
        }
        if self.retention.is_zero() {
            bail!("RETENTION_SECS must be positive");
        }
        Ok(())
    }

    pub fn retention_hours(&self) -> u64 {
        self.retention.as_secs() / 3600
    }
}
