/**
 * communication/sender.rs
 *
 * Publish and request primitives bound to one topic and codec
 */

use super::{subject_for, Codec, CodecError, CommunicationError, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Sender {
    connection: Arc<dyn Connection>,
    codec: Arc<dyn Codec>,
    topic: String,
    timeout: Duration,
}

impl Sender {
    pub fn new(connection: Arc<dyn Connection>, codec: Arc<dyn Codec>, topic: &str) -> Self {
        Self {
            connection,
            codec,
            topic: topic.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Fire and forget
    pub async fn send<T: Serialize>(&self, endpoint: &str, message: &T) -> Result<(), CommunicationError> {
        let subject = subject_for(&self.topic, endpoint);
        let data = self.pack(&subject, message)?;
        debug!(subject = %subject, "sending message");
        self.connection.publish(&subject, &data).await?;
        Ok(())
    }

    /// Send and wait for the typed response
    pub async fn request<Req, Resp>(&self, endpoint: &str, request: &Req) -> Result<Resp, CommunicationError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let subject = subject_for(&self.topic, endpoint);
        let data = self.pack(&subject, request)?;
        debug!(subject = %subject, "sending request");

        let response = self.connection.request(&subject, &data, self.timeout).await?;

        let unpack_error = |source| CommunicationError::Unpack {
            subject: subject.clone(),
            source,
        };
        let value = self.codec.unpack(&response).map_err(unpack_error)?;
        serde_json::from_value(value).map_err(|e| unpack_error(CodecError::Decode(e.to_string())))
    }

    fn pack<T: Serialize>(&self, subject: &str, message: &T) -> Result<Vec<u8>, CommunicationError> {
        let pack_error = |source| CommunicationError::Pack {
            subject: subject.to_string(),
            source,
        };
        let value = serde_json::to_value(message).map_err(|e| pack_error(CodecError::Encode(e.to_string())))?;
        self.codec.pack(&value).map_err(pack_error)
    }
}
