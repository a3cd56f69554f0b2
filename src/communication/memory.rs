/**
 * communication/memory.rs
 *
 * In-process broker implementing the transport capability.
 * Clones share the same broker, so one clone can play the remote peer.
 */

use super::transport::{request_via_inbox, Connection, Message, Subscription, TransportError, SUBSCRIPTION_CAPACITY};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Default)]
struct Broker {
    subscriptions: Mutex<HashMap<u64, (String, mpsc::Sender<Message>)>>,
    responses: Mutex<HashMap<String, Vec<u8>>>,
    published: Mutex<Vec<Message>>,
    next_sid: AtomicU64,
    closed: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryConnection {
    broker: Arc<Broker>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request on `subject` with the given bytes
    pub fn mock_response(&self, subject: &str, payload: &[u8]) {
        self.broker
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subject.to_string(), payload.to_vec());
    }

    /// Messages published so far, oldest first
    pub fn published(&self) -> Vec<Message> {
        self.broker
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of live subscriptions on `subject`
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.broker
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|(s, _)| s == subject)
            .count()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.broker.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.ensure_open()?;

        let message = Message {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload: payload.to_vec(),
        };
        self.broker
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());

        let subscriptions = self
            .broker
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for (sid, (sub_subject, sender)) in subscriptions.iter() {
            if sub_subject == subject && sender.try_send(message.clone()).is_err() {
                warn!(sid, subject, "dropping message for slow subscriber");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        self.ensure_open()?;

        let sid = self.broker.next_sid.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.broker
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sid, (subject.to_string(), tx));
        Ok(Subscription::new(sid, subject, rx))
    }

    async fn unsubscribe(&self, sid: u64) -> Result<(), TransportError> {
        self.broker
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&sid);
        Ok(())
    }

    fn close(&self) {
        self.broker.closed.store(true, Ordering::SeqCst);
        self.broker
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn is_closed(&self) -> bool {
        self.broker.closed.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        subject: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.ensure_open()?;

        let canned = self
            .broker
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(subject)
            .cloned();
        if let Some(response) = canned {
            return Ok(response);
        }
        request_via_inbox(self, subject, payload, timeout).await
    }
}
