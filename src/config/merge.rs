use std::path::PathBuf;

use super::env::config_from_env;
use super::yaml::YamlConfig;
use super::{AuthApiSecret, ServerConfig, TlsConfig};

/// Build the final configuration: environment (with defaults) as the base,
/// then every value present in YAML overrides it.
pub(super) fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = config_from_env()?;

    let Some(yaml) = yaml else {
        return Ok(config);
    };

    if let Some(server) = yaml.server {
        if let Some(host) = server.host {
            config.host = host;
        }
        if let Some(port) = server.port {
            config.port = port;
        }
        if let Some(tls) = server.tls {
            if tls.enabled == Some(false) {
                config.tls = None;
            } else {
                match (tls.cert_path, tls.key_path) {
                    (Some(cert), Some(key)) => {
                        config.tls = Some(TlsConfig {
                            cert_path: PathBuf::from(cert),
                            key_path: PathBuf::from(key),
                        });
                    }
                    (None, None) => {}
                    _ => {
                        return Err("server.tls requires both cert_path and key_path".into());
                    }
                }
            }
        }
    }

    if let Some(auth) = yaml.auth {
        if let Some(required) = auth.required {
            config.auth_required = required;
        }
        if !auth.api_secrets.is_empty() {
            config.auth_api_secrets = auth
                .api_secrets
                .into_iter()
                .map(|entry| AuthApiSecret {
                    id: entry.id,
                    secret: entry.secret,
                })
                .collect();
        } else if let Some(secret) = auth.api_secret {
            config.auth_api_secrets = vec![AuthApiSecret {
                id: "default".to_string(),
                secret,
            }];
        }
    }

    if let Some(security) = yaml.security {
        if security.cors_allowed_origins.is_some() {
            config.cors_allowed_origins = security.cors_allowed_origins;
        }
        if let Some(rps) = security.rate_limit_requests_per_second {
            config.rate_limit_requests_per_second = rps;
        }
        if let Some(burst) = security.rate_limit_burst_size {
            config.rate_limit_burst_size = burst;
        }
        if security.max_websocket_connections.is_some() {
            config.max_websocket_connections = security.max_websocket_connections;
        }
        if let Some(per_ip) = security.max_connections_per_ip {
            config.max_connections_per_ip = per_ip;
        }
    }

    if let Some(conversation) = yaml.conversation {
        if let Some(chars) = conversation.carryover_max_chars {
            config.carryover_max_chars = chars;
        }
        if let Some(seconds) = conversation.idle_timeout_seconds {
            config.idle_timeout_seconds = seconds;
        }
        if let Some(size) = conversation.event_buffer_size {
            config.event_buffer_size = size;
        }
    }

    if let Some(processor) = yaml.processor {
        if let Some(model) = processor.model {
            config.processor_model = model;
        }
        if let Some(delay) = processor.chunk_delay_ms {
            config.processor_chunk_delay_ms = delay;
        }
    }

    if let Some(sessions) = yaml.sessions {
        config.seeded_sessions = sessions.seed;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::cleanup_env_vars;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_merge_without_yaml_is_env_only() {
        cleanup_env_vars();
        let config = merge_config(None).unwrap();
        assert_eq!(config.port, 3001);
    }

    #[test]
    #[serial]
    fn test_yaml_single_secret_gets_default_id() {
        cleanup_env_vars();
        let yaml: YamlConfig = serde_yaml::from_str("auth:\n  api_secret: \"abc\"\n").unwrap();
        let config = merge_config(Some(yaml)).unwrap();
        assert_eq!(config.find_api_secret_id("abc"), Some("default"));
    }

    #[test]
    #[serial]
    fn test_yaml_tls_can_disable_env_tls() {
        cleanup_env_vars();
        unsafe {
            std::env::set_var("TLS_CERT_PATH", "/tmp/cert.pem");
            std::env::set_var("TLS_KEY_PATH", "/tmp/key.pem");
        }
        let yaml: YamlConfig =
            serde_yaml::from_str("server:\n  tls:\n    enabled: false\n").unwrap();
        let config = merge_config(Some(yaml)).unwrap();
        assert!(!config.is_tls_enabled());
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_yaml_partial_tls_is_rejected() {
        cleanup_env_vars();
        let yaml: YamlConfig =
            serde_yaml::from_str("server:\n  tls:\n    cert_path: \"/tmp/cert.pem\"\n").unwrap();
        assert!(merge_config(Some(yaml)).is_err());
    }
}
