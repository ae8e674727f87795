use serde::Deserialize;
use std::path::PathBuf;

use crate::core::session::Session;

/// Complete YAML configuration structure
///
/// This structure represents the full configuration that can be loaded from a YAML file.
/// All fields are optional to allow partial configuration. YAML values override
/// environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 3001
///   tls:
///     cert_path: "/etc/parley/cert.pem"
///     key_path: "/etc/parley/key.pem"
///
/// auth:
///   required: true
///   api_secrets:
///     - id: "mobile-app"
///       secret: "your-api-secret"
///
/// security:
///   cors_allowed_origins: "https://app.example.com"
///   max_websocket_connections: 1000
///
/// conversation:
///   carryover_max_chars: 400
///   idle_timeout_seconds: 300
///   event_buffer_size: 1024
///
/// processor:
///   model: "loopback-1"
///   chunk_delay_ms: 40
///
/// sessions:
///   seed:
///     - session_id: "sess-demo"
///       user_id: "user-demo"
///       chat_session_id: "chat-demo"
///       pending_intro: true
///       is_onboarding_intro: true
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub auth: Option<AuthYaml>,
    pub security: Option<SecurityYaml>,
    pub conversation: Option<ConversationYaml>,
    pub processor: Option<ProcessorYaml>,
    pub sessions: Option<SessionsYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Authentication configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthYaml {
    pub required: Option<bool>,
    /// Preferred multi-secret form. If non-empty, it takes precedence over api_secret.
    #[serde(default)]
    pub api_secrets: Vec<AuthApiSecretYaml>,
    /// Single-secret alias. Ignored when api_secrets is non-empty.
    pub api_secret: Option<String>,
}

/// API secret authentication entry in YAML
#[derive(Debug, Clone, Deserialize)]
pub struct AuthApiSecretYaml {
    pub id: String,
    pub secret: String,
}

/// Security configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    /// CORS allowed origins (comma-separated list or "*" for all)
    pub cors_allowed_origins: Option<String>,
    pub rate_limit_requests_per_second: Option<u32>,
    pub rate_limit_burst_size: Option<u32>,
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: Option<u32>,
}

/// Turn scheduling configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ConversationYaml {
    /// Maximum characters of interrupted reply carried into the next turn
    pub carryover_max_chars: Option<usize>,
    /// Seconds without client activity before the socket is closed (0 disables)
    pub idle_timeout_seconds: Option<u64>,
    pub event_buffer_size: Option<usize>,
}

/// Loopback processor configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProcessorYaml {
    pub model: Option<String>,
    pub chunk_delay_ms: Option<u64>,
}

/// Sessions registered in the in-memory directory at startup
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionsYaml {
    pub seed: Vec<Session>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Required fields have invalid types
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
