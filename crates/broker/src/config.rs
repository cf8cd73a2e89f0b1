use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use tokenbroker_engine::WorkerConfig;

/// Top-level broker configuration, loaded from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Middleware settings; absent blocks leave the middleware uninstalled.
    #[serde(default)]
    pub middleware: MiddlewareConfig,
    /// The upstream workers to dispatch across.
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

/// Optional middleware blocks.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareConfig {
    /// Bearer-token verification.
    pub auth: Option<AuthConfig>,
    /// One-in-flight-per-request-id guard.
    pub once: Option<OnceConfig>,
}

/// Bearer-token middleware settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// Inline HS256 signing secret.
    #[serde(default)]
    pub jwt_secret_key: String,
    /// Environment variable consulted when `jwtSecretKey` is empty.
    #[serde(default)]
    pub jwt_secret_key_env: String,
    /// JSON path into the claims that must hold a boolean `true`.
    #[serde(default)]
    pub role_path: Vec<String>,
}

impl AuthConfig {
    /// The signing secret, with the env-var fallback applied.
    pub fn secret(&self) -> String {
        if !self.jwt_secret_key.is_empty() {
            return self.jwt_secret_key.clone();
        }
        std::env::var(&self.jwt_secret_key_env).unwrap_or_default()
    }
}

/// Idempotency middleware settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnceConfig {
    /// Inline store URL (e.g. `redis://127.0.0.1/`).
    #[serde(default)]
    pub redis_url: String,
    /// Environment variable consulted when `redisUrl` is empty.
    #[serde(default)]
    pub redis_url_env: String,
    /// Key prefix for claims. Empty selects the default.
    #[serde(default)]
    pub key_prefix: String,
    /// Claim expiry in seconds. `0` selects the default (10 s).
    #[serde(default)]
    pub timeout: u64,
}

impl OnceConfig {
    const DEFAULT_KEY_PREFIX: &str = "broker-once:";
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// The store URL, with the env-var fallback applied.
    pub fn redis_url(&self) -> String {
        if !self.redis_url.is_empty() {
            return self.redis_url.clone();
        }
        std::env::var(&self.redis_url_env).unwrap_or_default()
    }

    /// The claim key prefix, defaulted when unset.
    pub fn key_prefix(&self) -> String {
        if self.key_prefix.is_empty() {
            return Self::DEFAULT_KEY_PREFIX.to_string();
        }
        self.key_prefix.clone()
    }

    /// The claim expiry, defaulted when unset.
    pub fn timeout(&self) -> Duration {
        match self.timeout {
            0 => Self::DEFAULT_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }
}

/// Read and parse the configuration file.
pub fn load(path: &Path) -> anyhow::Result<BrokerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: BrokerConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let raw = r#"{
            "middleware": {
                "auth": { "jwtSecretKey": "hunter2", "rolePath": ["role", "llm"] },
                "once": { "redisUrl": "redis://127.0.0.1/", "keyPrefix": "x:", "timeout": 5 }
            },
            "workers": [
                {
                    "host": "http://10.0.0.1:5000",
                    "capacity": 4,
                    "heartbeat": 2,
                    "timeout": 20,
                    "checkAlive": true,
                    "maxRetries": 3,
                    "restart": true,
                    "headers": { "Authorization": "Bearer upstream" },
                    "generateEndpoint": "/v1/generate",
                    "openai": true
                }
            ]
        }"#;

        let config: BrokerConfig = serde_json::from_str(raw).unwrap();
        let auth = config.middleware.auth.unwrap();
        assert_eq!(auth.secret(), "hunter2");
        assert_eq!(auth.role_path, vec!["role", "llm"]);

        let once = config.middleware.once.unwrap();
        assert_eq!(once.key_prefix(), "x:");
        assert_eq!(once.timeout(), Duration::from_secs(5));

        assert_eq!(config.workers.len(), 1);
        let worker = &config.workers[0];
        assert_eq!(worker.host, "http://10.0.0.1:5000");
        assert_eq!(worker.capacity, 4);
        assert_eq!(worker.max_retries, 3);
        assert!(worker.restart);
        assert!(worker.openai);
        assert_eq!(worker.generate_endpoint, "/v1/generate");
    }

    #[test]
    fn applies_worker_defaults() {
        let raw = r#"{ "workers": [ { "host": "http://10.0.0.1:5000", "capacity": 1 } ] }"#;
        let config: BrokerConfig = serde_json::from_str(raw).unwrap();
        let worker = &config.workers[0];

        assert_eq!(worker.heartbeat, 0);
        assert_eq!(worker.timeout, 0);
        assert!(worker.check_alive);
        assert_eq!(worker.max_retries, 0);
        assert!(!worker.restart);
        assert!(worker.headers.is_empty());
        assert_eq!(worker.generate_endpoint, "/generate");
        assert!(!worker.openai);
        assert!(config.middleware.auth.is_none());
        assert!(config.middleware.once.is_none());
    }

    #[test]
    fn once_defaults_kick_in_when_unset() {
        let once = OnceConfig::default();
        assert_eq!(once.key_prefix(), "broker-once:");
        assert_eq!(once.timeout(), Duration::from_secs(10));
    }
}
