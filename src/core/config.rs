//! Configuration management for the relay server.
//!
//! Configuration is read from an optional YAML file (with `${VAR}` /
//! `${VAR:-default}` expansion) and then overridden by environment variables.
//! Every field has a default, so the server can start from the environment
//! alone.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::OnceLock;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// OpenAI-compatible backend the relay forwards to
    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub request_log: RequestLogConfig,

    #[serde(default)]
    pub stream: StreamConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL; `/chat/completions` is appended
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Platform id recorded in request logs and rank queries
    #[serde(default = "default_platform_name")]
    pub platform_name: String,

    /// Request timeout in seconds for the upstream
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            api_key: None,
            platform_name: default_platform_name(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Tokens accepted by the auth gate. Stored in plain form here and hashed
/// once when the gate is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Business tokens; empty means business endpoints are open
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Admin token; unset means admin endpoints are disabled
    #[serde(default)]
    pub admin_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Fraction of the lowest latency samples dropped from the trimmed mean
    #[serde(default = "default_trim")]
    pub trim_low: f64,

    /// Fraction of the highest latency samples dropped from the trimmed mean
    #[serde(default = "default_trim")]
    pub trim_high: f64,

    /// Horizon of the realtime request-rate window
    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            trim_low: default_trim(),
            trim_high: default_trim(),
            rate_window_secs: default_rate_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogConfig {
    /// Entries kept by the in-memory store before the oldest are evicted
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,

    /// Bounded queue between request handlers and the writer task
    #[serde(default = "default_log_channel")]
    pub channel_capacity: usize,

    #[serde(default = "default_log_batch")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

impl Default for RequestLogConfig {
    fn default() -> Self {
        Self {
            capacity: default_log_capacity(),
            channel_capacity: default_log_channel(),
            batch_size: default_log_batch(),
            flush_interval_ms: default_flush_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Frames buffered between the relay task and the response body
    #[serde(default = "default_stream_buffer")]
    pub buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer: default_stream_buffer(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18000
}

fn default_upstream_base_url() -> String {
    "http://127.0.0.1:8000/v1".to_string()
}

fn default_platform_name() -> String {
    "default".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

fn default_trim() -> f64 {
    0.1
}

fn default_rate_window() -> u64 {
    60
}

fn default_log_capacity() -> usize {
    100_000
}

fn default_log_channel() -> usize {
    10_000
}

fn default_log_batch() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    200
}

fn default_stream_buffer() -> usize {
    64
}

impl AppConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    ///
    /// ```no_run
    /// use llm_relay::core::config::AppConfig;
    ///
    /// let config = AppConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let expanded = expand_env_vars(&content);

        // An empty document parses as null; treat it as all defaults
        let mut config: AppConfig = if expanded.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(&expanded)
                .with_context(|| format!("Failed to parse config file: {}", path))?
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from `CONFIG_PATH` (if set) and the environment.
    pub fn from_env() -> Result<Self> {
        match std::env::var("CONFIG_PATH") {
            Ok(path) if !path.trim().is_empty() => Self::load(&path),
            _ => {
                let mut config = AppConfig::default();
                config.apply_env_overrides()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Environment variables take precedence over file values.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse::<u16>("PORT")? {
            self.server.port = port;
        }

        if let Ok(url) = std::env::var("UPSTREAM_BASE_URL") {
            self.upstream.base_url = url;
        }
        if let Ok(key) = std::env::var("UPSTREAM_API_KEY") {
            self.upstream.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Ok(name) = std::env::var("PLATFORM_NAME") {
            self.upstream.platform_name = name;
        }
        if let Some(timeout) = env_parse::<u64>("REQUEST_TIMEOUT_SECS")? {
            self.upstream.request_timeout_secs = timeout;
        }

        if let Ok(keys) = std::env::var("API_KEYS") {
            self.auth.api_keys = split_list(&keys);
        }
        if let Ok(key) = std::env::var("ADMIN_KEY") {
            self.auth.admin_key = Some(key).filter(|k| !k.is_empty());
        }

        if let Some(window) = env_parse::<u64>("RATE_WINDOW_SECS")? {
            self.stats.rate_window_secs = window;
        }
        if let Some(low) = env_parse::<f64>("STATS_TRIM_LOW")? {
            self.stats.trim_low = low;
        }
        if let Some(high) = env_parse::<f64>("STATS_TRIM_HIGH")? {
            self.stats.trim_high = high;
        }

        if let Some(capacity) = env_parse::<usize>("REQUEST_LOG_CAPACITY")? {
            self.request_log.capacity = capacity;
        }
        if let Some(buffer) = env_parse::<usize>("STREAM_BUFFER")? {
            self.stream.buffer = buffer;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("stats.trim_low", self.stats.trim_low),
            ("stats.trim_high", self.stats.trim_high),
        ] {
            if !(0.0..0.5).contains(&value) {
                bail!("{} must be in [0, 0.5), got {}", name, value);
            }
        }
        if self.stats.rate_window_secs == 0 {
            bail!("stats.rate_window_secs must be positive");
        }
        if self.request_log.capacity == 0 || self.request_log.channel_capacity == 0 {
            bail!("request_log capacities must be positive");
        }
        if self.request_log.batch_size == 0 {
            bail!("request_log.batch_size must be positive");
        }
        if self.stream.buffer == 0 {
            bail!("stream.buffer must be positive");
        }
        if !(self.upstream.base_url.starts_with("http://")
            || self.upstream.base_url.starts_with("https://"))
        {
            bail!(
                "upstream.base_url must be an http(s) URL, got '{}'",
                self.upstream.base_url
            );
        }
        Ok(())
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", name, raw, e)),
        _ => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-?([^}]*))?\}").expect("static pattern")
    })
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
pub fn expand_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(&caps[1]).unwrap_or_else(|_| default_value.to_string())
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const OVERRIDE_VARS: &[&str] = &[
        "CONFIG_PATH",
        "HOST",
        "PORT",
        "UPSTREAM_BASE_URL",
        "UPSTREAM_API_KEY",
        "PLATFORM_NAME",
        "API_KEYS",
        "ADMIN_KEY",
        "REQUEST_TIMEOUT_SECS",
        "RATE_WINDOW_SECS",
        "STATS_TRIM_LOW",
        "STATS_TRIM_HIGH",
        "REQUEST_LOG_CAPACITY",
        "STREAM_BUFFER",
    ];

    fn clear_env() {
        for var in OVERRIDE_VARS {
            std::env::remove_var(var);
        }
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    #[serial]
    fn test_expand_env_vars() {
        std::env::set_var("RELAY_TEST_VAR", "test_value");
        assert_eq!(expand_env_vars("api_key: ${RELAY_TEST_VAR}"), "api_key: test_value");
        std::env::remove_var("RELAY_TEST_VAR");
    }

    #[test]
    #[serial]
    fn test_expand_env_vars_with_defaults() {
        std::env::remove_var("RELAY_MISSING_VAR");
        assert_eq!(
            expand_env_vars("api_key: ${RELAY_MISSING_VAR:-fallback}"),
            "api_key: fallback"
        );
        assert_eq!(
            expand_env_vars("api_key: ${RELAY_MISSING_VAR:fallback}"),
            "api_key: fallback"
        );
        assert_eq!(expand_env_vars("api_key: ${RELAY_MISSING_VAR:-}"), "api_key: ");
        assert_eq!(expand_env_vars("api_key: ${RELAY_MISSING_VAR}"), "api_key: ");
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 18000);
        assert_eq!(config.stats.trim_low, 0.1);
        assert_eq!(config.stats.trim_high, 0.1);
        assert_eq!(config.stats.rate_window_secs, 60);
        assert!(config.auth.api_keys.is_empty());
        assert!(config.auth.admin_key.is_none());
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn test_load_config_from_file() {
        clear_env();
        let file = write_config(
            r#"
server:
  host: 127.0.0.1
  port: 8080
upstream:
  base_url: https://llm.internal/v1
  platform_name: primary
auth:
  api_keys: [sk-a, sk-b]
  admin_key: admin-secret
stats:
  trim_low: 0.05
  trim_high: 0.2
"#,
        );

        let config = AppConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.upstream.base_url, "https://llm.internal/v1");
        assert_eq!(config.upstream.platform_name, "primary");
        assert_eq!(config.auth.api_keys, vec!["sk-a", "sk-b"]);
        assert_eq!(config.auth.admin_key.as_deref(), Some("admin-secret"));
        assert_eq!(config.stats.trim_low, 0.05);
        assert_eq!(config.stats.trim_high, 0.2);
        assert_eq!(config.stream.buffer, 64);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let file = write_config("server:\n  port: 8080\n");
        std::env::set_var("PORT", "9100");
        std::env::set_var("API_KEYS", "k1, k2,,k3");
        std::env::set_var("STATS_TRIM_HIGH", "0.25");

        let config = AppConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.auth.api_keys, vec!["k1", "k2", "k3"]);
        assert_eq!(config.stats.trim_high, 0.25);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_file_values_expand_env() {
        clear_env();
        std::env::set_var("RELAY_TEST_ADMIN", "from-env");
        let file = write_config("auth:\n  admin_key: ${RELAY_TEST_ADMIN}\n");
        let config = AppConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.auth.admin_key.as_deref(), Some("from-env"));
        std::env::remove_var("RELAY_TEST_ADMIN");
    }

    #[test]
    #[serial]
    fn test_empty_file_uses_defaults() {
        clear_env();
        let file = write_config("");
        let config = AppConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 18000);
    }

    #[test]
    #[serial]
    fn test_from_env_without_file() {
        clear_env();
        std::env::set_var("ADMIN_KEY", "adm");
        std::env::set_var("UPSTREAM_BASE_URL", "https://example.com/v1");
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.auth.admin_key.as_deref(), Some("adm"));
        assert_eq!(config.upstream.base_url, "https://example.com/v1");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_an_error() {
        clear_env();
        std::env::set_var("PORT", "not-a-port");
        assert!(AppConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_validate_rejects_bad_trim() {
        let mut config = AppConfig::default();
        config.stats.trim_low = 0.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.stats.trim_high = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_http_upstream() {
        let mut config = AppConfig::default();
        config.upstream.base_url = "ftp://nope".into();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_missing_file() {
        clear_env();
        assert!(AppConfig::load("/nonexistent/relay.yaml").is_err());
    }
}
