use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use super::{AuthApiSecret, ServerConfig, TlsConfig, parse_auth_api_secrets_json};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3001;
const DEFAULT_RATE_LIMIT_RPS: u32 = 60;
const DEFAULT_RATE_LIMIT_BURST: u32 = 10;
const DEFAULT_MAX_CONNECTIONS_PER_IP: u32 = 100;
const DEFAULT_CARRYOVER_MAX_CHARS: usize = 400;
const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;
const DEFAULT_PROCESSOR_MODEL: &str = "loopback-1";
const DEFAULT_PROCESSOR_CHUNK_DELAY_MS: u64 = 40;
const DEFAULT_API_SECRET_ID: &str = "default";

/// Build a configuration from environment variables, falling back to defaults.
pub(super) fn config_from_env() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let tls = match (env_string("TLS_CERT_PATH"), env_string("TLS_KEY_PATH")) {
        (Some(cert), Some(key)) => Some(TlsConfig {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
        }),
        (None, None) => None,
        _ => return Err("TLS_CERT_PATH and TLS_KEY_PATH must be set together".into()),
    };

    Ok(ServerConfig {
        host: env_string("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: env_parse("PORT")?.unwrap_or(DEFAULT_PORT),
        tls,
        auth_api_secrets: api_secrets_from_env()?,
        auth_required: env_bool("AUTH_REQUIRED")?.unwrap_or(false),
        cors_allowed_origins: env_string("CORS_ALLOWED_ORIGINS"),
        rate_limit_requests_per_second: env_parse("RATE_LIMIT_REQUESTS_PER_SECOND")?
            .unwrap_or(DEFAULT_RATE_LIMIT_RPS),
        rate_limit_burst_size: env_parse("RATE_LIMIT_BURST_SIZE")?
            .unwrap_or(DEFAULT_RATE_LIMIT_BURST),
        max_websocket_connections: env_parse("MAX_WEBSOCKET_CONNECTIONS")?,
        max_connections_per_ip: env_parse("MAX_CONNECTIONS_PER_IP")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_IP),
        carryover_max_chars: env_parse("CARRYOVER_MAX_CHARS")?
            .unwrap_or(DEFAULT_CARRYOVER_MAX_CHARS),
        idle_timeout_seconds: env_parse("IDLE_TIMEOUT_SECONDS")?
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECONDS),
        event_buffer_size: env_parse("EVENT_BUFFER_SIZE")?.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        processor_model: env_string("PROCESSOR_MODEL")
            .unwrap_or_else(|| DEFAULT_PROCESSOR_MODEL.to_string()),
        processor_chunk_delay_ms: env_parse("PROCESSOR_CHUNK_DELAY_MS")?
            .unwrap_or(DEFAULT_PROCESSOR_CHUNK_DELAY_MS),
        seeded_sessions: Vec::new(),
    })
}

/// `AUTH_API_SECRETS_JSON` wins over the single `AUTH_API_SECRET` form.
fn api_secrets_from_env() -> Result<Vec<AuthApiSecret>, Box<dyn std::error::Error>> {
    if let Some(json) = env_string("AUTH_API_SECRETS_JSON") {
        return parse_auth_api_secrets_json(&json);
    }

    Ok(env_string("AUTH_API_SECRET")
        .map(|secret| {
            vec![AuthApiSecret {
                id: env_string("AUTH_API_SECRET_ID")
                    .unwrap_or_else(|| DEFAULT_API_SECRET_ID.to_string()),
                secret,
            }]
        })
        .unwrap_or_default())
}

/// Non-empty, trimmed value of an environment variable
fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = env_string(name) else {
        return Ok(None);
    };
    match raw.parse::<T>() {
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(format!("Invalid value for {name} ('{raw}'): {e}").into()),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>, Box<dyn std::error::Error>> {
    let Some(raw) = env_string(name) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(format!("Invalid boolean for {name}: '{raw}'").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::cleanup_env_vars;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_overrides_defaults() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "4000");
            env::set_var("AUTH_REQUIRED", "yes");
            env::set_var("AUTH_API_SECRET", "s3cret");
            env::set_var("MAX_WEBSOCKET_CONNECTIONS", "50");
            env::set_var("IDLE_TIMEOUT_SECONDS", "0");
        }

        let config = config_from_env().unwrap();
        assert_eq!(config.port, 4000);
        assert!(config.auth_required);
        assert_eq!(config.auth_api_secrets[0].id, "default");
        assert_eq!(config.max_websocket_connections, Some(50));
        assert_eq!(config.idle_timeout_seconds, 0);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_secrets_json_takes_precedence() {
        cleanup_env_vars();
        unsafe {
            env::set_var("AUTH_API_SECRET", "single");
            env::set_var(
                "AUTH_API_SECRETS_JSON",
                r#"[{"id":"web","secret":"w"},{"id":"ios","secret":"i"}]"#,
            );
        }

        let config = config_from_env().unwrap();
        let ids: Vec<&str> = config
            .auth_api_secrets
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ids, vec!["web", "ios"]);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_invalid_number_is_reported() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "not-a-port");
        }

        let err = config_from_env().unwrap_err();
        assert!(err.to_string().contains("Invalid value for PORT"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_tls_requires_both_paths() {
        cleanup_env_vars();
        unsafe {
            env::set_var("TLS_CERT_PATH", "/tmp/cert.pem");
        }

        assert!(config_from_env().is_err());

        unsafe {
            env::set_var("TLS_KEY_PATH", "/tmp/key.pem");
        }
        let config = config_from_env().unwrap();
        assert!(config.is_tls_enabled());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_invalid_bool_is_reported() {
        cleanup_env_vars();
        unsafe {
            env::set_var("AUTH_REQUIRED", "maybe");
        }

        assert!(config_from_env().is_err());

        cleanup_env_vars();
    }
}
