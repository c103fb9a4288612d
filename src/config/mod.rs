//! Configuration management
//!
//! One TOML file describes every role this process runs: an optional
//! gateway section plus any number of proxy-client and proxy-server
//! instances.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Gateway configuration
    pub gateway: Option<GatewayConfig>,
    /// Proxy-client instances
    #[serde(default)]
    pub proxy_client: Vec<ProxyClientConfig>,
    /// Proxy-server instances
    #[serde(default)]
    pub proxy_server: Vec<ProxyServerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check internal consistency before any role starts
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(gateway) = &self.gateway {
            if gateway.listeners.is_empty() {
                return Err(crate::Error::Config(
                    "gateway requires at least one listener".into(),
                ));
            }
            if gateway.sessions.is_empty() {
                return Err(crate::Error::Config(
                    "gateway requires at least one session".into(),
                ));
            }
            let mut seen = std::collections::HashSet::new();
            for session in &gateway.sessions {
                if !seen.insert(session.id) {
                    return Err(crate::Error::Config(format!(
                        "duplicate session id {}",
                        session.id
                    )));
                }
            }
            for listener in &gateway.listeners {
                if listener.tls_cert.is_some() != listener.tls_key.is_some() {
                    return Err(crate::Error::Config(format!(
                        "listener on port {} needs both tls_cert and tls_key",
                        listener.port
                    )));
                }
            }
        }
        for server in &self.proxy_server {
            if server.bindings.is_empty() {
                return Err(crate::Error::Config(format!(
                    "proxy-server for session {} has no bindings",
                    server.session_id
                )));
            }
        }
        if self.gateway.is_none() && self.proxy_client.is_empty() && self.proxy_server.is_empty() {
            return Err(crate::Error::Config(
                "config defines no gateway, proxy_client or proxy_server".into(),
            ));
        }
        Ok(())
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listening sockets
    pub listeners: Vec<GatewayListener>,
    /// Statically provisioned sessions
    pub sessions: Vec<SessionConfig>,
}

/// One gateway listening socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayListener {
    /// Bind address, defaults to all interfaces
    #[serde(default)]
    pub ip: Option<String>,
    pub port: u16,
    /// TLS certificate path (PEM); enables TLS together with `tls_key`
    pub tls_cert: Option<String>,
    /// TLS key path (PEM)
    pub tls_key: Option<String>,
}

impl GatewayListener {
    pub fn bind_addr(&self) -> (String, u16) {
        (
            self.ip.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
            self.port,
        )
    }
}

/// A statically provisioned session slot pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub id: i32,
    pub client_password: String,
    pub server_password: String,
}

/// Proxy-client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyClientConfig {
    pub gateway_host: String,
    pub gateway_port: u16,
    #[serde(default)]
    pub use_tls: bool,
    pub session_id: i32,
    pub password: String,
    /// When present, only these exact targets may be dialled
    pub allowlist: Option<Vec<Endpoint>>,
}

/// A literal (host, port) pair on a proxy-client allowlist
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Proxy-server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyServerConfig {
    pub gateway_host: String,
    pub gateway_port: u16,
    #[serde(default)]
    pub use_tls: bool,
    pub session_id: i32,
    pub password: String,
    /// Local listeners and the targets they forward to
    pub bindings: Vec<Binding>,
}

/// One proxy-server listener binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    /// Listen address, defaults to loopback
    #[serde(default)]
    pub listen_ip: Option<String>,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl Binding {
    pub fn bind_addr(&self) -> (String, u16) {
        (
            self.listen_ip
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            self.listen_port,
        )
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Generate example configuration covering all three roles
pub fn generate_example_config() -> Config {
    Config {
        gateway: Some(GatewayConfig {
            listeners: vec![GatewayListener {
                ip: Some("0.0.0.0".to_string()),
                port: crate::DEFAULT_PORT,
                tls_cert: None,
                tls_key: None,
            }],
            sessions: vec![SessionConfig {
                id: 1,
                client_password: "client-secret".to_string(),
                server_password: "server-secret".to_string(),
            }],
        }),
        proxy_client: vec![ProxyClientConfig {
            gateway_host: "gateway.example.com".to_string(),
            gateway_port: crate::DEFAULT_PORT,
            use_tls: false,
            session_id: 1,
            password: "client-secret".to_string(),
            allowlist: Some(vec![Endpoint {
                host: "127.0.0.1".to_string(),
                port: 22,
            }]),
        }],
        proxy_server: vec![ProxyServerConfig {
            gateway_host: "gateway.example.com".to_string(),
            gateway_port: crate::DEFAULT_PORT,
            use_tls: false,
            session_id: 1,
            password: "server-secret".to_string(),
            bindings: vec![Binding {
                listen_ip: Some("127.0.0.1".to_string()),
                listen_port: 2222,
                target_host: "127.0.0.1".to_string(),
                target_port: 22,
            }],
        }],
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_roundtrip() {
        let config = generate_example_config();
        config.validate().unwrap();

        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        parsed.validate().unwrap();

        assert_eq!(parsed.proxy_server[0].bindings[0].listen_port, 2222);
        assert_eq!(parsed.gateway.unwrap().sessions[0].id, 1);
    }

    #[test]
    fn test_minimal_proxy_client_config() {
        let config: Config = toml::from_str(
            r#"
            [[proxy_client]]
            gateway_host = "127.0.0.1"
            gateway_port = 8000
            session_id = 1
            password = "c"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert!(config.proxy_client[0].allowlist.is_none());
        assert!(!config.proxy_client[0].use_tls);
    }

    #[test]
    fn test_empty_config_rejected() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_without_bindings_rejected() {
        let config: Config = toml::from_str(
            r#"
            [[proxy_server]]
            gateway_host = "127.0.0.1"
            gateway_port = 8000
            session_id = 1
            password = "s"
            bindings = []
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_session_ids_rejected() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            listeners = [{ port = 8000 }]
            sessions = [
                { id = 1, client_password = "a", server_password = "b" },
                { id = 1, client_password = "c", server_password = "d" },
            ]
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
