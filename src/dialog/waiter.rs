/**
 * dialog/waiter.rs
 *
 * Provider side of the dialog handshake. Listens on
 * `<topic>.dialog-create`, authenticates the caller against the identity
 * it claims, and hands an accepted dialog to the handler.
 */

use super::{
    Dialog, DialogCreateRequest, DialogCreateResponse, DialogError, DialogHandler,
    IdentityValidator, SecuredCodec, DIALOG_VERSION_V1, ENDPOINT_DIALOG_CREATE,
};
use crate::communication::{
    subject_for, Codec, CodecError, Connection, JsonCodec, Message, TopicAddress,
};
use crate::identity::{Identity, Signer, VerifierFactory};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub struct DialogWaiter {
    address: TopicAddress,
    signer: Arc<dyn Signer>,
    verifiers: VerifierFactory,
    validators: Vec<IdentityValidator>,
    subscription: Mutex<Option<u64>>,
}

/// Shared state for request handling tasks
struct WaiterContext {
    topic: String,
    connection: Arc<dyn Connection>,
    signer: Arc<dyn Signer>,
    verifiers: VerifierFactory,
    validators: Vec<IdentityValidator>,
    handler: Arc<dyn DialogHandler>,
}

/// Only the claimed identity is read before the signature is checked
#[derive(Deserialize)]
struct ClaimedPeer {
    payload: ClaimedPeerPayload,
}

#[derive(Deserialize)]
struct ClaimedPeerPayload {
    peer_id: Identity,
}

impl DialogWaiter {
    pub fn new(address: TopicAddress, signer: Arc<dyn Signer>, verifiers: VerifierFactory) -> Self {
        Self {
            address,
            signer,
            verifiers,
            validators: Vec::new(),
            subscription: Mutex::new(None),
        }
    }

    pub fn with_validator(mut self, validator: IdentityValidator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn address(&self) -> &TopicAddress {
        &self.address
    }

    /// Start accepting dialogs; each request is processed on its own task
    pub async fn serve_dialogs<H>(&self, handler: H) -> Result<(), DialogError>
    where
        H: DialogHandler + 'static,
    {
        let connection = self.address.connection()?;
        let subject = subject_for(self.address.topic(), ENDPOINT_DIALOG_CREATE);
        let mut subscription = connection.subscribe(&subject).await?;

        let previous = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(subscription.sid);
        if let Some(sid) = previous {
            let _ = connection.unsubscribe(sid).await;
        }

        let context = Arc::new(WaiterContext {
            topic: self.address.topic().to_string(),
            connection,
            signer: self.signer.clone(),
            verifiers: self.verifiers.clone(),
            validators: self.validators.clone(),
            handler: Arc::new(handler),
        });

        info!(subject = %subject, "waiting for dialogs");
        tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                tokio::spawn(context.clone().handle_request(message));
            }
            debug!("dialog subscription ended");
        });
        Ok(())
    }

    /// Stop accepting dialogs. Established dialogs stay open.
    pub async fn stop(&self) {
        let sid = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let (Some(sid), Ok(connection)) = (sid, self.address.connection()) {
            info!(topic = %self.address.topic(), "stopping dialog waiter");
            let _ = connection.unsubscribe(sid).await;
        }
    }
}

impl WaiterContext {
    async fn handle_request(self: Arc<Self>, message: Message) {
        let Some(reply) = message.reply.as_deref() else {
            warn!(subject = %message.subject, "dialog request without reply subject");
            return;
        };

        let peer_id = match serde_json::from_slice::<ClaimedPeer>(&message.payload) {
            Ok(claimed) => claimed.payload.peer_id,
            Err(e) => {
                warn!("malformed dialog request: {}", e);
                return;
            }
        };

        let codec = Arc::new(SecuredCodec::new(
            Arc::new(JsonCodec),
            self.signer.clone(),
            peer_id.clone(),
            (self.verifiers)(&peer_id),
        ));
        if peer_id.address.is_empty() {
            warn!("dialog request without peer identity");
            self.reply(codec.as_ref(), reply, &DialogCreateResponse::invalid_identity())
                .await;
            return;
        }
        let request: DialogCreateRequest = match codec
            .unpack(&message.payload)
            .and_then(|value| {
                serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))
            })
        {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %peer_id, "rejecting dialog request: {}", e);
                return;
            }
        };

        for validator in &self.validators {
            if let Err(e) = validator(&peer_id) {
                warn!(peer = %peer_id, "identity rejected: {:#}", e);
                self.reply(codec.as_ref(), reply, &DialogCreateResponse::invalid_identity())
                    .await;
                return;
            }
        }

        let (suffix, topic) = if request.version.as_deref() == Some(DIALOG_VERSION_V1) {
            let topic = uuid::Uuid::new_v4().to_string();
            (topic.clone(), topic)
        } else {
            (peer_id.address.clone(), String::new())
        };

        let address = self.address_for(&suffix);
        let dialog = match Dialog::new(peer_id.clone(), address, codec.clone()) {
            Ok(dialog) => dialog,
            Err(e) => {
                warn!(peer = %peer_id, "failed to create dialog: {}", e);
                return;
            }
        };
        info!(peer = %peer_id, topic = %dialog.topic(), "dialog accepted");

        let response = match self.handler.handle(dialog).await {
            Ok(()) => DialogCreateResponse::ok(topic),
            Err(e) => {
                warn!(peer = %peer_id, "dialog handler failed: {:#}", e);
                DialogCreateResponse::handler_failed()
            }
        };
        self.reply(codec.as_ref(), reply, &response).await;
    }

    fn address_for(&self, suffix: &str) -> TopicAddress {
        TopicAddress::with_connection(self.connection.clone(), &subject_for(&self.topic, suffix))
    }

    async fn reply(&self, codec: &dyn Codec, reply: &str, response: &DialogCreateResponse) {
        let packed = serde_json::to_value(response)
            .map_err(|e| CodecError::Encode(e.to_string()))
            .and_then(|value| codec.pack(&value));
        match packed {
            Ok(data) => {
                if let Err(e) = self.connection.publish(reply, &data).await {
                    warn!("failed to answer dialog request: {}", e);
                }
            }
            Err(e) => warn!("failed to pack dialog response: {}", e),
        }
    }
}
