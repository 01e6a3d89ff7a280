/// Daemon configuration
use crate::errors::{DaemonError, DaemonResult};
use inspector_bridge_core::{BridgeOptions, DebuggeeAddress, DEFAULT_DEBUG_PORT};
use serde::{Deserialize, Serialize};

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub debuggee: DebuggeeConfig,
    pub bridge: BridgeOptions,
    pub logging: LoggingConfig,
}

/// Websocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Listen port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Debuggee used when a client does not name one in its URL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggeeConfig {
    pub host: String,
    pub port: u16,
}

impl Default for DebuggeeConfig {
    fn default() -> Self {
        DebuggeeConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_DEBUG_PORT,
        }
    }
}

impl DebuggeeConfig {
    pub fn address(&self) -> DebuggeeAddress {
        DebuggeeAddress::new(self.host.clone(), self.port)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &str) -> DaemonResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::ConfigError(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| DaemonError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load from TOML file or use defaults
    pub fn load_or_default(path: Option<&str>) -> DaemonResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> DaemonResult<()> {
        if self.debuggee.port == 0 {
            return Err(DaemonError::ConfigError(
                "debuggee.port must be non-zero".to_string(),
            ));
        }

        if self.debuggee.host.is_empty() || self.server.host.is_empty() {
            return Err(DaemonError::ConfigError(
                "server.host and debuggee.host must not be empty".to_string(),
            ));
        }

        if self.bridge.stack_trace_limit == 0 {
            return Err(DaemonError::ConfigError(
                "bridge.stack_trace_limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
