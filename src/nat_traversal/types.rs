/**
 * nat_traversal/types.rs
 *
 * Core types for NAT traversal
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Kind of service a punched socket is handed to (e.g. "openvpn")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceType(pub String);

impl ServiceType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceType {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Everything the provider side needs to punch towards one consumer
#[derive(Debug, Clone)]
pub struct Params {
    /// Raw consumer config from session signaling
    pub request_config: Value,
    /// Local port the punched socket binds to
    pub port: u16,
    /// Cancels this attempt only
    pub cancel: CancellationToken,
}

/// Public address of a peer plus the service it wants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingConfig {
    pub ip: String,
    pub port: u16,
    pub service_type: ServiceType,
}

/// Extracts the remote endpoint from an opaque signaling config
pub trait ConfigParser: Send + Sync {
    fn parse(&self, config: &Value) -> anyhow::Result<PingConfig>;
}

/// Reads `{ip, port, service_type}` directly
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConfigParser;

impl ConfigParser for JsonConfigParser {
    fn parse(&self, config: &Value) -> anyhow::Result<PingConfig> {
        let parsed: PingConfig = serde_json::from_value(config.clone())?;
        if parsed.ip.is_empty() {
            anyhow::bail!("ping config has no ip");
        }
        Ok(parsed)
    }
}
