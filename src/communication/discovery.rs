/**
 * communication/discovery.rs
 *
 * Topic addresses: a base topic plus the broker connection it lives on,
 * and the contact a peer advertises so others can reach that topic.
 */

use super::nats::NatsConnection;
use super::transport::{Connection, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const CONTACT_TYPE_NATS_V1: &str = "nats/v1";

/// Transport level locator a peer publishes for its dialog topic
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "type")]
    pub contact_type: String,
    pub definition: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactNatsV1 {
    pub topic: String,
    #[serde(default)]
    pub broker_addresses: Vec<String>,
}

pub struct TopicAddress {
    servers: Vec<String>,
    topic: String,
    allow_invalid_certs: bool,
    connection: Option<Arc<dyn Connection>>,
    owns_connection: bool,
    disconnected: AtomicBool,
}

impl TopicAddress {
    /// Address that dials one of `servers` on `connect()`
    pub fn new(topic: &str, servers: Vec<String>) -> Self {
        Self {
            servers,
            topic: topic.to_string(),
            allow_invalid_certs: false,
            connection: None,
            owns_connection: false,
            disconnected: AtomicBool::new(false),
        }
    }

    /// Address over an existing connection. The caller keeps ownership of it.
    pub fn with_connection(connection: Arc<dyn Connection>, topic: &str) -> Self {
        Self {
            servers: Vec::new(),
            topic: topic.to_string(),
            allow_invalid_certs: false,
            connection: Some(connection),
            owns_connection: false,
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn allow_invalid_certs(mut self, allow: bool) -> Self {
        self.allow_invalid_certs = allow;
        self
    }

    /// Resolve an advertised contact
    pub fn for_contact(contact: &Contact) -> Result<Self, TransportError> {
        if contact.contact_type != CONTACT_TYPE_NATS_V1 {
            return Err(TransportError::InvalidContact(format!(
                "unsupported contact type '{}'",
                contact.contact_type
            )));
        }
        let definition: ContactNatsV1 = serde_json::from_value(contact.definition.clone())
            .map_err(|e| TransportError::InvalidContact(e.to_string()))?;
        Ok(Self::new(&definition.topic, definition.broker_addresses))
    }

    pub fn contact(&self) -> Contact {
        let definition = ContactNatsV1 {
            topic: self.topic.clone(),
            broker_addresses: self.servers.clone(),
        };
        Contact {
            contact_type: CONTACT_TYPE_NATS_V1.to_string(),
            definition: serde_json::to_value(definition).unwrap_or_default(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Dial the first reachable broker unless a connection is already present
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connection.is_some() {
            return Ok(());
        }

        let mut last_error = TransportError::NotConnected(self.topic.clone());
        for server in &self.servers {
            match NatsConnection::connect(server, self.allow_invalid_certs).await {
                Ok(connection) => {
                    self.connection = Some(Arc::new(connection));
                    self.owns_connection = true;
                    return Ok(());
                }
                Err(e) => {
                    warn!(server = %server, "broker unreachable: {}", e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    pub fn connection(&self) -> Result<Arc<dyn Connection>, TransportError> {
        self.connection
            .clone()
            .ok_or_else(|| TransportError::NotConnected(self.topic.clone()))
    }

    /// `<topic>.<suffix>` on the same connection, without taking ownership of it
    pub fn nested(&self, suffix: &str) -> Self {
        Self {
            servers: self.servers.clone(),
            topic: format!("{}.{}", self.topic, suffix),
            allow_invalid_certs: self.allow_invalid_certs,
            connection: self.connection.clone(),
            owns_connection: false,
            disconnected: AtomicBool::new(false),
        }
    }

    /// `<topic>.<suffix>`, handing connection ownership to the new address
    pub fn into_nested(self, suffix: &str) -> Self {
        let mut nested = self.nested(suffix);
        nested.owns_connection = self.owns_connection;
        nested
    }

    /// Tear down once; only connections this address dialed get closed
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        if let (true, Some(connection)) = (self.owns_connection, &self.connection) {
            debug!(topic = %self.topic, "disconnecting topic address");
            connection.close();
        }
    }
}
