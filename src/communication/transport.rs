/**
 * communication/transport.rs
 *
 * Transport capability: publish, request/reply and subscriptions
 * over named subjects.
 */

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Per subscription buffer; messages beyond it are dropped (slow consumer)
pub(crate) const SUBSCRIPTION_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to '{0}' timed out")]
    Timeout(String),

    #[error("connection closed")]
    Closed,

    #[error("not connected to '{0}'")]
    NotConnected(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("invalid contact: {0}")]
    InvalidContact(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message delivered to a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

/// Live subscription handle
pub struct Subscription {
    pub sid: u64,
    pub subject: String,
    messages: mpsc::Receiver<Message>,
}

impl Subscription {
    pub(crate) fn new(sid: u64, subject: &str, messages: mpsc::Receiver<Message>) -> Self {
        Self {
            sid,
            subject: subject.to_string(),
            messages,
        }
    }

    /// Next message, `None` once unsubscribed or the connection closed
    pub async fn next(&mut self) -> Option<Message> {
        self.messages.recv().await
    }
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError>;

    async fn unsubscribe(&self, sid: u64) -> Result<(), TransportError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.publish_with_reply(subject, None, payload).await
    }

    async fn request(
        &self,
        subject: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        request_via_inbox(self, subject, payload, timeout).await
    }
}

/// Request/reply on top of a throwaway inbox subscription
pub(crate) async fn request_via_inbox<C: Connection + ?Sized>(
    connection: &C,
    subject: &str,
    payload: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
    let mut subscription = connection.subscribe(&inbox).await?;

    trace!(subject, inbox = %inbox, "sending request");
    let result = match connection
        .publish_with_reply(subject, Some(&inbox), payload)
        .await
    {
        Ok(()) => tokio::time::timeout(timeout, subscription.next()).await,
        Err(e) => {
            let _ = connection.unsubscribe(subscription.sid).await;
            return Err(e);
        }
    };
    let _ = connection.unsubscribe(subscription.sid).await;

    match result {
        Ok(Some(message)) => Ok(message.payload),
        Ok(None) => Err(TransportError::Closed),
        Err(_) => Err(TransportError::Timeout(subject.to_string())),
    }
}
