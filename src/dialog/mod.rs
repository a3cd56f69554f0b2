/**
 * dialog/mod.rs
 *
 * Authenticated dialogs between two identified peers:
 * - secured (signing) codec
 * - dialog waiter (provider side)
 * - dialog establisher (consumer side)
 */

mod establisher;
mod secured_codec;
mod waiter;

pub use establisher::{AddressFactory, DialogEstablisher};
pub use secured_codec::SecuredCodec;
pub use waiter::DialogWaiter;

use crate::communication::{
    Codec, CodecError, CommunicationError, Receiver, Sender, TopicAddress, TransportError,
};
use crate::identity::Identity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const ENDPOINT_DIALOG_CREATE: &str = "dialog-create";

pub const REASON_OK: u16 = 200;
pub const REASON_BAD_REQUEST: u16 = 400;
pub const REASON_INTERNAL_ERROR: u16 = 500;

/// Request version that asks the waiter for a private random topic
pub const DIALOG_VERSION_V1: &str = "v1";

#[derive(Debug, Error)]
pub enum DialogError {
    #[error("dialog creation error. {0}")]
    Transport(#[source] TransportError),

    #[error("dialog creation error. {0}")]
    Authentication(String),

    #[error("dialog rejected: {message} ({reason})")]
    Rejected { reason: u16, message: String },

    #[error("dialog protocol error: {0}")]
    Protocol(String),
}

impl DialogError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DialogError::Transport(TransportError::Timeout(_)))
    }
}

impl From<TransportError> for DialogError {
    fn from(err: TransportError) -> Self {
        DialogError::Transport(err)
    }
}

impl From<CommunicationError> for DialogError {
    fn from(err: CommunicationError) -> Self {
        match err {
            CommunicationError::Transport(e) => DialogError::Transport(e),
            CommunicationError::Unpack {
                source: CodecError::InvalidSignature(_),
                ..
            } => DialogError::Authentication(err.to_string()),
            other => DialogError::Protocol(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogCreateRequest {
    pub peer_id: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogCreateResponse {
    pub reason: u16,
    #[serde(rename = "reasonMessage")]
    pub reason_message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
}

impl DialogCreateResponse {
    pub fn ok(topic: String) -> Self {
        Self {
            reason: REASON_OK,
            reason_message: "OK".to_string(),
            topic,
        }
    }

    pub fn invalid_identity() -> Self {
        Self {
            reason: REASON_BAD_REQUEST,
            reason_message: "Invalid Identity".to_string(),
            topic: String::new(),
        }
    }

    pub fn handler_failed() -> Self {
        Self {
            reason: REASON_INTERNAL_ERROR,
            reason_message: "Failed to handle dialog".to_string(),
            topic: String::new(),
        }
    }
}

/// Extra admission check run by the waiter, e.g. reputation or ACLs
pub type IdentityValidator = Arc<dyn Fn(&Identity) -> anyhow::Result<()> + Send + Sync>;

/// Receives every dialog the waiter accepts
#[async_trait]
pub trait DialogHandler: Send + Sync {
    async fn handle(&self, dialog: Dialog) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> DialogHandler for F
where
    F: Fn(Dialog) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, dialog: Dialog) -> anyhow::Result<()> {
        (self)(dialog).await
    }
}

/// Authenticated bidirectional channel with one peer.
///
/// Sender and receiver share the dialog topic and a codec scoped to the peer,
/// so everything sent is signed locally and everything received must be
/// signed by `peer_id`.
pub struct Dialog {
    peer_id: Identity,
    sender: Sender,
    receiver: Receiver,
    address: TopicAddress,
    closed: AtomicBool,
}

impl std::fmt::Debug for Dialog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialog")
            .field("peer_id", &self.peer_id)
            .field("topic", &self.topic())
            .finish()
    }
}

impl Dialog {
    pub(crate) fn new(
        peer_id: Identity,
        address: TopicAddress,
        codec: Arc<dyn Codec>,
    ) -> Result<Self, TransportError> {
        let connection = address.connection()?;
        let sender = Sender::new(connection.clone(), codec.clone(), address.topic());
        let receiver = Receiver::new(connection, codec, address.topic());
        Ok(Self {
            peer_id,
            sender,
            receiver,
            address,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_id(&self) -> &Identity {
        &self.peer_id
    }

    pub fn topic(&self) -> &str {
        self.address.topic()
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    /// Unsubscribe and release the topic address; later calls are no-ops
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(peer = %self.peer_id, topic = %self.topic(), "closing dialog");
        self.receiver.unsubscribe().await;
        self.address.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_serializes_without_topic() {
        let json = serde_json::to_string(&DialogCreateResponse::invalid_identity()).unwrap();
        assert_eq!(json, r#"{"reason":400,"reasonMessage":"Invalid Identity"}"#);
    }

    #[test]
    fn response_without_topic_parses() {
        let response: DialogCreateResponse =
            serde_json::from_str(r#"{"reason":200,"reasonMessage":"OK"}"#).unwrap();
        assert_eq!(response, DialogCreateResponse::ok(String::new()));
    }

    #[test]
    fn request_version_is_optional() {
        let request = DialogCreateRequest {
            peer_id: Identity::from_address("0xaaa"),
            version: None,
        };
        assert_eq!(serde_json::to_string(&request).unwrap(), r#"{"peer_id":"0xaaa"}"#);

        let parsed: DialogCreateRequest =
            serde_json::from_str(r#"{"peer_id":"0xAAA","version":"v1"}"#).unwrap();
        assert_eq!(parsed.version.as_deref(), Some(DIALOG_VERSION_V1));
    }

    #[test]
    fn signature_failures_map_to_authentication_errors() {
        let err: DialogError = CommunicationError::Unpack {
            subject: "peer-topic.dialog-create".to_string(),
            source: CodecError::InvalidSignature("expected signer 0xaaa".to_string()),
        }
        .into();
        assert!(matches!(err, DialogError::Authentication(_)));
        assert!(err
            .to_string()
            .starts_with("dialog creation error. failed to unpack response 'peer-topic.dialog-create'. invalid message signature"));

        let err: DialogError = CommunicationError::Transport(TransportError::Timeout("x".into())).into();
        assert!(err.is_timeout());
    }
}
