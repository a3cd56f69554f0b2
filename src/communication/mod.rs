/**
 * communication/mod.rs
 *
 * Topic addressed pub/sub plumbing:
 * - message codecs
 * - transport connections (NATS over WebSocket, in-memory broker)
 * - topic addresses and contacts
 * - sender / receiver primitives
 */

mod codec;
mod discovery;
mod memory;
mod nats;
mod receiver;
mod sender;
mod transport;

pub use codec::{Codec, CodecError, JsonCodec};
pub use discovery::{Contact, ContactNatsV1, TopicAddress, CONTACT_TYPE_NATS_V1};
pub use memory::MemoryConnection;
pub use nats::NatsConnection;
pub use receiver::Receiver;
pub use sender::{Sender, DEFAULT_REQUEST_TIMEOUT};
pub use transport::{Connection, Message, Subscription, TransportError};

use thiserror::Error;

/// Errors raised while exchanging typed messages over a topic
#[derive(Debug, Error)]
pub enum CommunicationError {
    #[error("failed to pack message '{subject}'. {source}")]
    Pack {
        subject: String,
        #[source]
        source: CodecError,
    },

    #[error("failed to unpack response '{subject}'. {source}")]
    Unpack {
        subject: String,
        #[source]
        source: CodecError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Join a base topic and an endpoint name
pub fn subject_for(topic: &str, endpoint: &str) -> String {
    format!("{}.{}", topic, endpoint)
}
