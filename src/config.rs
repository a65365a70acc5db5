//! Configuration for the upstream LLM service and the proxy listener.
//!
//! Values come from command-line flags with environment fallbacks; only
//! `main.rs` parses them; everything else receives the resulting structs.

use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Default base URL of the LLM session service.
pub const DEFAULT_SERVICE_URL: &str = "http://localhost:3212";

/// Default per-attempt timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default number of attempts for a buffered call.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between attempts in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: f64 = 2.0;

/// Connection settings for the LLM session service.
#[derive(Args, Debug, Clone, PartialEq, Serialize)]
pub struct ServiceConfig {
    /// Base URL of the LLM session service
    #[arg(
        long = "llm-url",
        env = "LLM_SERVICE_URL",
        value_name = "URL",
        default_value = DEFAULT_SERVICE_URL,
        global = true
    )]
    pub base_url: String,

    /// Timeout for each attempt, in seconds
    #[arg(
        long = "llm-timeout",
        env = "LLM_SERVICE_TIMEOUT",
        value_name = "SECS",
        default_value_t = DEFAULT_TIMEOUT_SECS,
        global = true
    )]
    pub timeout_secs: u64,

    /// Maximum number of attempts for a buffered call (at least 1)
    #[arg(
        long = "llm-retries",
        env = "LLM_SERVICE_RETRIES",
        value_name = "N",
        default_value_t = DEFAULT_MAX_RETRIES,
        value_parser = clap::value_parser!(u32).range(1..),
        global = true
    )]
    pub max_retries: u32,

    /// Fixed delay between attempts, in seconds
    #[arg(
        long = "llm-retry-delay",
        env = "LLM_SERVICE_RETRY_DELAY",
        value_name = "SECS",
        default_value_t = DEFAULT_RETRY_DELAY_SECS,
        value_parser = parse_delay,
        global = true
    )]
    pub retry_delay_secs: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SERVICE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

impl ServiceConfig {
    /// Creates a configuration pointing at `base_url` with default retry settings.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs)
    }
}

fn parse_delay(s: &str) -> Result<f64, String> {
    let secs: f64 = s.parse().map_err(|e| format!("invalid delay '{}': {}", s, e))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("delay must be a non-negative number, got '{}'", s));
    }
    Ok(secs)
}

/// Listener settings for the proxy.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "PROXY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PROXY_PORT", default_value_t = 5815)]
    pub port: u16,

    /// Accepted API keys as KEY=USER (repeatable; comma-separated in the env var)
    #[arg(
        long = "api-key",
        env = "PROXY_API_KEYS",
        value_name = "KEY=USER",
        value_delimiter = ','
    )]
    pub api_keys: Vec<ApiKeyEntry>,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

/// One `KEY=USER` pair from the API key table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyEntry {
    pub key: String,
    pub user: String,
}

impl FromStr for ApiKeyEntry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((key, user)) = s.split_once('=') else {
            bail!("Invalid API key entry '{}'. Expected 'KEY=USER'.", s);
        };
        let (key, user) = (key.trim(), user.trim());
        if key.is_empty() || user.is_empty() {
            bail!("Invalid API key entry '{}'. Expected 'KEY=USER'.", s);
        }
        Ok(Self {
            key: key.to_string(),
            user: user.to_string(),
        })
    }
}

/// Static lookup table from API key to user id.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    keys: HashMap<String, String>,
}

impl ApiKeys {
    /// Returns the user id bound to `key`.
    pub fn user(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Sorted user ids, for diagnostics that must not leak the keys themselves.
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.keys.values().cloned().collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<ApiKeyEntry> for ApiKeys {
    fn from_iter<I: IntoIterator<Item = ApiKeyEntry>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().map(|e| (e.key, e.user)).collect(),
        }
    }
}
