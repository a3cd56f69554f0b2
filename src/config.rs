/**
 * config.rs
 *
 * Node configuration read from environment variables
 */

use crate::identity::{KeySigner, Signer};
use crate::nat_traversal::ServiceType;
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";
pub const DEFAULT_SERVICE_TYPE: &str = "openvpn";
pub const DEFAULT_SERVICE_PORT: u16 = 1194;
pub const DEFAULT_PROVIDER_PORT: u16 = 40_000;
pub const DEFAULT_CONSUMER_PORT: u16 = 40_001;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// ws:// or wss:// url of the NATS broker
    pub broker_url: String,
    /// Hex encoded Ed25519 secret key
    pub identity_key: Option<String>,
    pub stun_server: String,
    pub service_type: ServiceType,
    /// Local port the provided service listens on
    pub service_port: u16,
    /// Local UDP port the provider punches from
    pub provider_port: u16,
    /// Local UDP port the consumer punches from
    pub consumer_port: u16,
    pub request_timeout: Duration,
    /// Accept self-signed broker certificates
    pub allow_invalid_certs: bool,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let broker_url = lookup("BROKER_URL")
            .context("BROKER_URL environment variable not set. Example: wss://broker.example.com:443")?;

        Ok(Self {
            broker_url,
            identity_key: lookup("IDENTITY_KEY").filter(|key| !key.is_empty()),
            stun_server: lookup("STUN_SERVER").unwrap_or_else(|| DEFAULT_STUN_SERVER.to_string()),
            service_type: ServiceType::new(
                lookup("SERVICE_TYPE").unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string()),
            ),
            service_port: parse_or(&lookup, "SERVICE_PORT", DEFAULT_SERVICE_PORT)?,
            provider_port: parse_or(&lookup, "PROVIDER_PORT", DEFAULT_PROVIDER_PORT)?,
            consumer_port: parse_or(&lookup, "CONSUMER_PORT", DEFAULT_CONSUMER_PORT)?,
            request_timeout: Duration::from_millis(parse_or(
                &lookup,
                "REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            )?),
            allow_invalid_certs: parse_or(&lookup, "ALLOW_INVALID_CERTS", false)?,
        })
    }

    /// Signer for the configured key, or a throwaway one
    pub fn signer(&self) -> Result<KeySigner> {
        match &self.identity_key {
            Some(key) => KeySigner::from_hex(key).context("Invalid IDENTITY_KEY"),
            None => {
                let signer = KeySigner::random();
                warn!(identity = %signer.identity(), "IDENTITY_KEY not set, using a random identity");
                Ok(signer)
            }
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {} value '{}'", key, value)),
        None => Ok(default),
    }
}
