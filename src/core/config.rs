//! Layered configuration: built-in defaults, then `helpdesk.toml`, then
//! `HELPDESK_*` environment variables (`__` separates sections, e.g.
//! `HELPDESK_DATABASE__POOL_SIZE=32`). `DATABASE_URL` is honoured as well.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "helpdesk.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub policy: PolicyConfig,
    pub firewall: FirewallConfig,
    pub webhook: WebhookConfig,
    pub llm: LlmConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(
                Env::raw()
                    .only(&["DATABASE_URL"])
                    .map(|_| "database.url".into()),
            )
            .merge(Env::prefixed("HELPDESK_").split("__"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    pub url: String,
    pub pool_size: u32,
    pub checkout_timeout_ms: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            url: "postgres://helpdesk_app@localhost:5432/helpdesk".to_string(),
            pool_size: 16,
            checkout_timeout_ms: 5_000,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub cache_ttl_secs: u64,
    /// Targets that deny when no rule matches.
    pub deny_by_default: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 5,
            deny_by_default: vec![
                "ticket.export".to_string(),
                "webhook.create".to_string(),
                "copilot.tool".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub enabled: bool,
    pub block_threshold: f64,
    pub review_threshold: f64,
    /// Shortest base64 run flagged as an encoded payload.
    pub base64_min_len: usize,
    pub max_input_length: usize,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_threshold: 0.7,
            review_threshold: 0.3,
            base64_min_len: 120,
            max_input_length: 32_768,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub jitter: f64,
    pub max_backoff_ms: u64,
    pub timeout_ms: u64,
    /// Webhooks whose failure count exceeds this are disabled.
    pub auto_disable_threshold: i32,
    pub require_https: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            backoff_factor: 2.0,
            jitter: 0.2,
            max_backoff_ms: 60_000,
            timeout_ms: 10_000,
            auto_disable_threshold: 20,
            require_https: true,
        }
    }
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub timeout_ms: u64,
    pub model_id: String,
    /// OpenAI-compatible base URL. AI routes are off when unset.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            model_id: "helpdesk-assist-v1".to_string(),
            endpoint: None,
            api_key: None,
            max_tokens: 1_000,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.webhook.max_attempts, 5);
        assert_eq!(config.webhook.auto_disable_threshold, 20);
        assert_eq!(config.policy.cache_ttl_secs, 5);
        assert_eq!(config.firewall.block_threshold, 0.7);
        assert_eq!(config.database.checkout_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        writeln!(
            file,
            r#"
[database]
backend = "memory"
pool_size = 4

[webhook]
max_attempts = 3
require_https = false
"#
        )
        .expect("write");

        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file.path()))
            .extract()
            .expect("extract");
        assert_eq!(config.database.backend, StoreBackend::Memory);
        assert_eq!(config.database.pool_size, 4);
        assert_eq!(config.webhook.max_attempts, 3);
        assert!(!config.webhook.require_https);
        assert_eq!(config.webhook.initial_backoff_ms, 1_000);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(dir.path().join("absent.toml")))
            .extract()
            .expect("extract");
        assert_eq!(config, AppConfig::default());
    }
}
