use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::{RelayError, Result};

/// Main configuration structure for chatrelay
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// WebSocket server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Completion provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Admission, retry and apology policy
    #[serde(default)]
    pub relay: RelayConfig,
}

/// How outbound events reach clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Every event goes to every connected client
    Broadcast,
    /// Events go only to the connection that submitted the request
    #[default]
    Origin,
}

/// WebSocket server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind; all interfaces when unset
    #[serde(default)]
    pub listen_host: Option<String>,
    /// Port to bind
    #[serde(default = "default_port")]
    pub port: u16,
    /// Outbound event targeting
    #[serde(default)]
    pub delivery: DeliveryMode,
    /// Evict a client's conversations when its socket closes
    #[serde(default = "default_stop_on_disconnect")]
    pub stop_on_disconnect: bool,
    /// Per-client outbound queue length
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
    /// Interval between WebSocket pings in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl ServerConfig {
    /// Socket address string to bind, e.g. "0.0.0.0:10000"
    pub fn listen_addr(&self) -> String {
        let host = self.listen_host.as_deref().unwrap_or("0.0.0.0");
        format!("{host}:{}", self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: None,
            port: default_port(),
            delivery: DeliveryMode::default(),
            stop_on_disconnect: default_stop_on_disconnect(),
            send_queue: default_send_queue(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

fn default_port() -> u16 {
    10000
}

fn default_stop_on_disconnect() -> bool {
    true
}

fn default_send_queue() -> usize {
    256
}

fn default_heartbeat_secs() -> u64 {
    30
}

/// OpenAI-compatible completion provider configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// API base URL; `/chat/completions` is appended
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// API key; normally filled from `api_key_env`
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Model identifier sent with every request
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature (0 for deterministic output)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Optional request timeout in seconds; no timeout when unset
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            timeout_secs: None,
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_temperature() -> f32 {
    1.0
}

/// Admission cap, retry and apology policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Outstanding requests a conversation may accumulate before eviction
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap: u32,
    /// Delay before a failed request is re-attempted (0 = immediately)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Tell the client when a conversation is evicted by the cap
    #[serde(default = "default_apology_enabled")]
    pub apology_enabled: bool,
    /// Text of the cap-exceeded message
    #[serde(default = "default_apology_message")]
    pub apology_message: String,
    /// Whether the first admission of a conversation counts toward the cap
    #[serde(default = "default_first_admission_counts")]
    pub first_admission_counts: bool,
}

impl RelayConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: default_concurrency_cap(),
            retry_delay_ms: default_retry_delay_ms(),
            apology_enabled: default_apology_enabled(),
            apology_message: default_apology_message(),
            first_admission_counts: default_first_admission_counts(),
        }
    }
}

fn default_concurrency_cap() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    3000
}

fn default_apology_enabled() -> bool {
    true
}

fn default_apology_message() -> String {
    "Sorry, the completion service seems to be having trouble. Please try again.".to_string()
}

fn default_first_admission_counts() -> bool {
    true
}

impl Config {
    /// Parse a TOML config file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides using the given variable lookup
    ///
    /// Recognised variables: the provider's `api_key_env` (default
    /// `OPENAI_API_KEY`), `OPENAI_BASE_URL`, `HOST`, `PORT`,
    /// `RELAY_CONCURRENCY_CAP`, `RELAY_RETRY_DELAY_MS`, `RELAY_TEMPERATURE`
    /// and `RELAY_APOLOGY`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(&self.provider.api_key_env).filter(|k| !k.is_empty()) {
            self.provider.api_key = Some(key);
        }
        if let Some(base) = lookup("OPENAI_BASE_URL").filter(|b| !b.is_empty()) {
            self.provider.base_url = base;
        }
        if let Some(host) = lookup("HOST").filter(|h| !h.is_empty()) {
            self.server.listen_host = Some(host);
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(cap) = lookup("RELAY_CONCURRENCY_CAP") {
            self.relay.concurrency_cap = parse_env("RELAY_CONCURRENCY_CAP", &cap)?;
        }
        if let Some(delay) = lookup("RELAY_RETRY_DELAY_MS") {
            self.relay.retry_delay_ms = parse_env("RELAY_RETRY_DELAY_MS", &delay)?;
        }
        if let Some(temperature) = lookup("RELAY_TEMPERATURE") {
            self.provider.temperature = parse_env("RELAY_TEMPERATURE", &temperature)?;
        }
        if let Some(apology) = lookup("RELAY_APOLOGY") {
            self.relay.apology_enabled = parse_flag("RELAY_APOLOGY", &apology)?;
        }
        Ok(())
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.relay.concurrency_cap == 0 {
            return Err(RelayError::Config(
                "relay.concurrency_cap must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(RelayError::Config(format!(
                "provider.temperature must be between 0 and 2, got {}",
                self.provider.temperature
            )));
        }
        let url = Url::parse(&self.provider.base_url).map_err(|e| {
            RelayError::Config(format!(
                "Invalid provider.base_url '{}': {e}",
                self.provider.base_url
            ))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(RelayError::Config(format!(
                "Unsupported provider.base_url scheme '{}': only http and https are allowed",
                url.scheme()
            )));
        }
        if self.server.send_queue == 0 {
            return Err(RelayError::Config(
                "server.send_queue must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RelayError::Config(format!("Invalid value for {name} '{value}': {e}")))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(RelayError::Config(format!(
            "Invalid value for {name} '{other}': expected on/off"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.server.listen_host.is_none());
        assert_eq!(config.server.port, 10000);
        assert_eq!(config.server.listen_addr(), "0.0.0.0:10000");
        assert_eq!(config.server.delivery, DeliveryMode::Origin);
        assert!(config.server.stop_on_disconnect);
        assert_eq!(config.provider.base_url, "https://api.openai.com/v1");
        assert_eq!(config.provider.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.provider.model, "gpt-3.5-turbo");
        assert_eq!(config.provider.temperature, 1.0);
        assert!(config.provider.timeout_secs.is_none());
        assert_eq!(config.relay.concurrency_cap, 10);
        assert_eq!(config.relay.retry_delay(), Duration::from_millis(3000));
        assert!(config.relay.apology_enabled);
        assert!(config.relay.first_admission_counts);
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[server]
listen_host = "127.0.0.1"
port = 8080
delivery = "broadcast"
stop_on_disconnect = false

[provider]
base_url = "https://proxy.example.com/openai/v1"
model = "gpt-4o-mini"
temperature = 0.0
timeout_secs = 60

[relay]
concurrency_cap = 20
retry_delay_ms = 0
apology_enabled = false
first_admission_counts = false
"#;

        let config: Config = toml::from_str(toml_str).expect("Failed to parse TOML");

        assert_eq!(config.server.listen_addr(), "127.0.0.1:8080");
        assert_eq!(config.server.delivery, DeliveryMode::Broadcast);
        assert!(!config.server.stop_on_disconnect);
        assert_eq!(config.provider.base_url, "https://proxy.example.com/openai/v1");
        assert_eq!(config.provider.model, "gpt-4o-mini");
        assert_eq!(config.provider.temperature, 0.0);
        assert_eq!(config.provider.timeout_secs, Some(60));
        assert_eq!(config.relay.concurrency_cap, 20);
        assert_eq!(config.relay.retry_delay(), Duration::ZERO);
        assert!(!config.relay.apology_enabled);
        assert!(!config.relay.first_admission_counts);
    }

    #[test]
    fn test_toml_partial_deserialization() {
        let toml_str = r#"
[relay]
concurrency_cap = 20
"#;

        let config: Config = toml::from_str(toml_str).expect("Failed to parse partial TOML");

        assert_eq!(config.relay.concurrency_cap, 20);
        assert_eq!(config.relay.retry_delay_ms, 3000);
        assert_eq!(config.server.port, 10000);
        assert_eq!(config.provider.model, "gpt-3.5-turbo");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_from(lookup_from(&[
                ("OPENAI_API_KEY", "sk-test"),
                ("OPENAI_BASE_URL", "http://localhost:1234/v1"),
                ("HOST", "127.0.0.1"),
                ("RELAY_CONCURRENCY_CAP", "20"),
                ("RELAY_RETRY_DELAY_MS", "0"),
                ("RELAY_TEMPERATURE", "0"),
                ("RELAY_APOLOGY", "off"),
            ]))
            .unwrap();

        assert_eq!(config.provider.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.provider.base_url, "http://localhost:1234/v1");
        assert_eq!(config.server.listen_addr(), "127.0.0.1:10000");
        assert_eq!(config.relay.concurrency_cap, 20);
        assert_eq!(config.relay.retry_delay_ms, 0);
        assert_eq!(config.provider.temperature, 0.0);
        assert!(!config.relay.apology_enabled);
    }

    #[test]
    fn test_env_api_key_uses_configured_variable() {
        let mut config = Config::default();
        config.provider.api_key_env = "PROXY_KEY".to_string();
        config
            .apply_env_from(lookup_from(&[("OPENAI_API_KEY", "wrong"), ("PROXY_KEY", "right")]))
            .unwrap();

        assert_eq!(config.provider.api_key.as_deref(), Some("right"));
    }

    #[test]
    fn test_env_invalid_number_is_config_error() {
        let mut config = Config::default();
        let result = config.apply_env_from(lookup_from(&[("RELAY_CONCURRENCY_CAP", "ten")]));

        assert!(matches!(result, Err(RelayError::Config(_))));
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("RELAY_CONCURRENCY_CAP"));
    }

    #[test]
    fn test_env_invalid_flag_is_config_error() {
        let mut config = Config::default();
        let result = config.apply_env_from(lookup_from(&[("RELAY_APOLOGY", "maybe")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_defaults() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let mut config = Config::default();
        config.relay.concurrency_cap = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        let mut config = Config::default();
        config.provider.base_url = "not a url".to_string();
        assert!(config.validate().is_err());

        config.provider.base_url = "ftp://example.com".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("only http and https"));
    }

    #[test]
    fn test_validate_rejects_out_of_range_temperature() {
        let mut config = Config::default();
        config.provider.temperature = 3.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 4242\n").unwrap();

        let config = Config::from_toml_file(&path).unwrap();
        assert_eq!(config.server.port, 4242);
    }

    #[test]
    fn test_from_toml_file_missing() {
        let result = Config::from_toml_file(Path::new("/definitely/not/here.toml"));
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
