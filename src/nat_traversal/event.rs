/**
 * nat_traversal/event.rs
 *
 * Stage events of the traversal pipeline.
 * Stages publish their outcome so later stages can react.
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

/// Topic all traversal stages publish on
pub const EVENT_TOPIC: &str = "Traversal";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub stage: String,
    pub successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn success(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            successful: true,
            error: None,
        }
    }

    pub fn failure(stage: &str, error: impl ToString) -> Self {
        Self {
            stage: stage.to_string(),
            successful: false,
            error: Some(error.to_string()),
        }
    }
}

pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, event: Event);
}

/// Blocks until the next stage event, `None` once no more can arrive
#[async_trait]
pub trait NatEventWaiter: Send + Sync {
    async fn wait_for_event(&self) -> Option<Event>;
}

/// In-process fan-out of stage events, one broadcast channel per topic
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Event> {
        self.sender(topic).subscribe()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Event> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .clone()
    }
}

impl Publisher for EventBus {
    fn publish(&self, topic: &str, event: Event) {
        trace!(topic, stage = %event.stage, successful = event.successful, "publishing event");
        // No subscribers is not an error
        let _ = self.sender(topic).send(event);
    }
}

/// Follows one topic of an `EventBus` and remembers the last event seen
pub struct EventTracker {
    events: tokio::sync::Mutex<broadcast::Receiver<Event>>,
    last: Mutex<Option<Event>>,
}

impl EventTracker {
    pub fn new(bus: &EventBus) -> Self {
        Self {
            events: tokio::sync::Mutex::new(bus.subscribe(EVENT_TOPIC)),
            last: Mutex::new(None),
        }
    }

    pub fn last_event(&self) -> Option<Event> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl NatEventWaiter for EventTracker {
    async fn wait_for_event(&self) -> Option<Event> {
        let mut events = self.events.lock().await;
        loop {
            match events.recv().await {
                Ok(event) => {
                    *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(event.clone());
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(skipped, "event tracker lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
