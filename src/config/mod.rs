//! Configuration module for the Parley gateway
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use parley_gateway::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

mod env;
mod merge;
mod validation;
mod yaml;

use crate::core::processor::LoopbackConfig;
use crate::core::session::Session;
use crate::core::turn::SchedulerSettings;

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// API secret authentication entry with a client identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthApiSecret {
    pub id: String,
    pub secret: String,
}

/// Server configuration
///
/// Contains all configuration needed to run the gateway:
/// - Server settings (host, port, TLS)
/// - Authentication settings
/// - Security settings (CORS, rate limiting, connection limits)
/// - Turn scheduling tunables
/// - Loopback processor settings
/// - Sessions seeded into the in-memory directory
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // Authentication configuration
    pub auth_api_secrets: Vec<AuthApiSecret>,
    pub auth_required: bool,

    // Security configuration
    /// CORS allowed origins (comma-separated list or "*" for all)
    /// Default: None (CORS disabled, same-origin only)
    pub cors_allowed_origins: Option<String>,

    // Rate limiting configuration
    /// Maximum requests per second per IP address
    /// Default: 60
    pub rate_limit_requests_per_second: u32,
    /// Maximum burst size for rate limiting
    /// Default: 10
    pub rate_limit_burst_size: u32,

    // Connection limits
    /// Maximum concurrent WebSocket connections
    /// Default: None (unlimited)
    pub max_websocket_connections: Option<usize>,
    /// Maximum connections per IP address
    /// Default: 100
    pub max_connections_per_ip: u32,

    // Conversation settings
    /// Maximum characters of an interrupted reply kept as carryover
    /// Default: 400
    pub carryover_max_chars: usize,
    /// Seconds without client activity (and no running turn) before closing
    /// Default: 300, 0 disables
    pub idle_timeout_seconds: u64,
    /// Capacity of the per-connection turn event channel
    /// Default: 1024
    pub event_buffer_size: usize,

    // Processor settings
    pub processor_model: String,
    pub processor_chunk_delay_ms: u64,

    /// Sessions registered at startup (YAML only)
    pub seeded_sessions: Vec<Session>,
}

/// Implement Drop to zeroize all secret fields when ServerConfig is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        for secret in &mut self.auth_api_secrets {
            secret.secret.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// After loading and merging, performs validation on the final configuration.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        // .env is loaded into the process environment by main.rs before this runs
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables and defaults only
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge::merge_config(None)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        validation::validate_auth_api_secrets(&self.auth_api_secrets)?;
        validation::validate_auth_required(self.auth_required, &self.auth_api_secrets)?;
        validation::validate_conversation(self.carryover_max_chars, self.event_buffer_size)?;
        validation::validate_seeded_sessions(&self.seeded_sessions)?;
        Ok(())
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Check if API secret authentication is configured
    pub fn has_api_secret_auth(&self) -> bool {
        !self.auth_api_secrets.is_empty()
    }

    /// Find the API secret identifier that matches a bearer token
    ///
    /// Returns the configured id when the token matches a known secret.
    pub fn find_api_secret_id(&self, token: &str) -> Option<&str> {
        crate::auth::match_api_secret_id(token, &self.auth_api_secrets)
    }

    /// Idle timeout, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_seconds > 0).then(|| Duration::from_secs(self.idle_timeout_seconds))
    }

    /// Scheduler tunables for each accepted connection
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            carryover_max_chars: self.carryover_max_chars,
            event_buffer_size: self.event_buffer_size,
            idle_timeout: self.idle_timeout(),
        }
    }

    pub fn loopback_config(&self) -> LoopbackConfig {
        LoopbackConfig {
            model: self.processor_model.clone(),
            chunk_delay: Duration::from_millis(self.processor_chunk_delay_ms),
        }
    }
}

pub(crate) fn parse_auth_api_secrets_json(
    json_str: &str,
) -> Result<Vec<AuthApiSecret>, Box<dyn std::error::Error>> {
    #[derive(serde::Deserialize)]
    struct AuthApiSecretJson {
        id: String,
        secret: String,
    }

    let secrets: Vec<AuthApiSecretJson> = serde_json::from_str(json_str)
        .map_err(|e| format!("Invalid AUTH_API_SECRETS_JSON format: {e}"))?;

    Ok(secrets
        .into_iter()
        .map(|entry| AuthApiSecret {
            id: entry.id,
            secret: entry.secret,
        })
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    /// Helper function to create a test ServerConfig with defaults
    pub(crate) fn test_config() -> ServerConfig {
        ServerConfig {
            host: "localhost".to_string(),
            port: 3001,
            tls: None,
            auth_api_secrets: Vec::new(),
            auth_required: false,
            cors_allowed_origins: None,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            max_websocket_connections: None,
            max_connections_per_ip: 100,
            carryover_max_chars: 400,
            idle_timeout_seconds: 300,
            event_buffer_size: 1024,
            processor_model: "loopback-1".to_string(),
            processor_chunk_delay_ms: 40,
            seeded_sessions: Vec::new(),
        }
    }

    #[test]
    fn test_has_api_secret_auth() {
        let mut config = test_config();
        assert!(!config.has_api_secret_auth());

        config.auth_api_secrets = vec![AuthApiSecret {
            id: "client-a".to_string(),
            secret: "secret-a".to_string(),
        }];
        assert!(config.has_api_secret_auth());
    }

    #[test]
    fn test_find_api_secret_id() {
        let mut config = test_config();
        config.auth_api_secrets = vec![
            AuthApiSecret {
                id: "client-a".to_string(),
                secret: "secret-a".to_string(),
            },
            AuthApiSecret {
                id: "client-b".to_string(),
                secret: "secret-b".to_string(),
            },
        ];

        assert_eq!(config.find_api_secret_id("secret-b"), Some("client-b"));
        assert_eq!(config.find_api_secret_id("secret-a"), Some("client-a"));
        assert_eq!(config.find_api_secret_id("secret"), None);
        assert_eq!(config.find_api_secret_id(""), None);
    }

    #[test]
    fn test_idle_timeout_zero_disables() {
        let mut config = test_config();
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(300)));

        config.idle_timeout_seconds = 0;
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.scheduler_settings().idle_timeout, None);
    }

    #[test]
    fn test_scheduler_settings_and_loopback_config() {
        let mut config = test_config();
        config.carryover_max_chars = 120;
        config.event_buffer_size = 32;
        config.processor_chunk_delay_ms = 5;

        let settings = config.scheduler_settings();
        assert_eq!(settings.carryover_max_chars, 120);
        assert_eq!(settings.event_buffer_size, 32);

        let loopback = config.loopback_config();
        assert_eq!(loopback.model, "loopback-1");
        assert_eq!(loopback.chunk_delay, Duration::from_millis(5));
    }

    #[test]
    fn test_address() {
        assert_eq!(test_config().address(), "localhost:3001");
    }

    #[test]
    fn test_parse_auth_api_secrets_json() {
        let secrets =
            parse_auth_api_secrets_json(r#"[{"id":"a","secret":"s1"},{"id":"b","secret":"s2"}]"#)
                .unwrap();
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets[1].id, "b");

        let err = parse_auth_api_secrets_json("not json").unwrap_err();
        assert!(err.to_string().contains("Invalid AUTH_API_SECRETS_JSON"));
    }

    // Helper to clean up environment variables
    pub(crate) fn cleanup_env_vars() {
        unsafe {
            env::remove_var("HOST");
            env::remove_var("PORT");
            env::remove_var("TLS_CERT_PATH");
            env::remove_var("TLS_KEY_PATH");
            env::remove_var("AUTH_REQUIRED");
            env::remove_var("AUTH_API_SECRETS_JSON");
            env::remove_var("AUTH_API_SECRET");
            env::remove_var("AUTH_API_SECRET_ID");
            env::remove_var("CORS_ALLOWED_ORIGINS");
            env::remove_var("RATE_LIMIT_REQUESTS_PER_SECOND");
            env::remove_var("RATE_LIMIT_BURST_SIZE");
            env::remove_var("MAX_WEBSOCKET_CONNECTIONS");
            env::remove_var("MAX_CONNECTIONS_PER_IP");
            env::remove_var("CARRYOVER_MAX_CHARS");
            env::remove_var("IDLE_TIMEOUT_SECONDS");
            env::remove_var("EVENT_BUFFER_SIZE");
            env::remove_var("PROCESSOR_MODEL");
            env::remove_var("PROCESSOR_CHUNK_DELAY_MS");
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();

        let config = ServerConfig::from_env().unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3001);
        assert!(config.tls.is_none());
        assert!(!config.auth_required);
        assert_eq!(config.rate_limit_requests_per_second, 60);
        assert_eq!(config.rate_limit_burst_size, 10);
        assert_eq!(config.max_websocket_connections, None);
        assert_eq!(config.max_connections_per_ip, 100);
        assert_eq!(config.carryover_max_chars, 400);
        assert_eq!(config.idle_timeout_seconds, 300);
        assert_eq!(config.event_buffer_size, 1024);
        assert_eq!(config.processor_model, "loopback-1");
        assert!(config.seeded_sessions.is_empty());
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_only() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let yaml_content = r#"
server:
  host: "127.0.0.1"
  port: 8080

conversation:
  carryover_max_chars: 250
  idle_timeout_seconds: 60

sessions:
  seed:
    - session_id: "sess-1"
      user_id: "user-1"
      chat_session_id: "chat-1"
"#;

        fs::write(&config_path, yaml_content).unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.carryover_max_chars, 250);
        assert_eq!(config.idle_timeout_seconds, 60);
        assert_eq!(config.seeded_sessions.len(), 1);
        assert_eq!(config.seeded_sessions[0].session_id, "sess-1");

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let yaml_content = r#"
server:
  host: "127.0.0.1"

processor:
  model: "yaml-model"
"#;

        fs::write(&config_path, yaml_content).unwrap();

        unsafe {
            env::set_var("HOST", "0.0.0.0");
            env::set_var("PORT", "9999");
            env::set_var("PROCESSOR_MODEL", "env-model");
        }

        let config = ServerConfig::from_file(&config_path).unwrap();

        // YAML overrides ENV
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.processor_model, "yaml-model");
        // ENV value where YAML is silent
        assert_eq!(config.port, 9999);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let config_path = PathBuf::from("/nonexistent/config.yaml");
        let result = ServerConfig::from_file(&config_path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_with_auth() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let yaml_content = r#"
auth:
  required: true
  api_secrets:
    - id: "client-a"
      secret: "secret-a"
"#;

        fs::write(&config_path, yaml_content).unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();

        assert!(config.auth_required);
        assert_eq!(config.find_api_secret_id("secret-a"), Some("client-a"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_auth_required_without_secrets_fails() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "auth:\n  required: true\n").unwrap();

        let result = ServerConfig::from_file(&config_path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("AUTH_REQUIRED"));

        cleanup_env_vars();
    }
}
