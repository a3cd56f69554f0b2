/**
 * communication/receiver.rs
 *
 * Subscribe and respond primitives bound to one topic and codec.
 * Every inbound message is handled on its own task.
 */

use super::{subject_for, Codec, CodecError, CommunicationError, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub struct Receiver {
    connection: Arc<dyn Connection>,
    codec: Arc<dyn Codec>,
    topic: String,
    subscriptions: Mutex<Vec<u64>>,
}

impl Receiver {
    pub fn new(connection: Arc<dyn Connection>, codec: Arc<dyn Codec>, topic: &str) -> Self {
        Self {
            connection,
            codec,
            topic: topic.to_string(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consume one-way messages sent to `endpoint`
    pub async fn receive<T, F>(&self, endpoint: &str, handler: F) -> Result<(), CommunicationError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.serve(endpoint, move |codec, _connection, message| {
            let handler = handler.clone();
            async move {
                match decode::<T>(codec.as_ref(), &message.payload) {
                    Ok(payload) => handler(payload),
                    Err(e) => warn!(subject = %message.subject, "dropping message: {}", e),
                }
            }
        })
        .await
    }

    /// Answer requests sent to `endpoint`. A handler error leaves the request unanswered.
    pub async fn respond<Req, Resp, F, Fut>(&self, endpoint: &str, handler: F) -> Result<(), CommunicationError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.serve(endpoint, move |codec, connection, message| {
            let handler = handler.clone();
            async move {
                let Some(reply) = message.reply.clone() else {
                    warn!(subject = %message.subject, "request without reply subject");
                    return;
                };
                let request = match decode::<Req>(codec.as_ref(), &message.payload) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(subject = %message.subject, "dropping request: {}", e);
                        return;
                    }
                };
                let response = match handler(request).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(subject = %message.subject, "request handler failed: {:#}", e);
                        return;
                    }
                };
                let packed = serde_json::to_value(&response)
                    .map_err(|e| CodecError::Encode(e.to_string()))
                    .and_then(|value| codec.pack(&value));
                match packed {
                    Ok(data) => {
                        if let Err(e) = connection.publish(&reply, &data).await {
                            warn!(subject = %message.subject, "failed to send response: {}", e);
                        }
                    }
                    Err(e) => warn!(subject = %message.subject, "failed to pack response: {}", e),
                }
            }
        })
        .await
    }

    /// Drop every subscription this receiver made
    pub async fn unsubscribe(&self) {
        let sids: Vec<u64> = std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()));
        for sid in sids {
            if let Err(e) = self.connection.unsubscribe(sid).await {
                debug!(sid, "unsubscribe failed: {}", e);
            }
        }
    }

    async fn serve<H, Fut>(&self, endpoint: &str, handle: H) -> Result<(), CommunicationError>
    where
        H: Fn(Arc<dyn Codec>, Arc<dyn Connection>, super::Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let subject = subject_for(&self.topic, endpoint);
        let mut subscription = self.connection.subscribe(&subject).await?;
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscription.sid);
        debug!(subject = %subject, "subscribed");

        let codec = self.codec.clone();
        let connection = self.connection.clone();
        tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                tokio::spawn(handle(codec.clone(), connection.clone(), message));
            }
            debug!(subject = %subject, "subscription ended");
        });
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(codec: &dyn Codec, data: &[u8]) -> Result<T, CodecError> {
    let value = codec.unpack(data)?;
    serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))
}
