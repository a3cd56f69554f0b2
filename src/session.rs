/**
 * session.rs
 *
 * Session negotiation over an established dialog.
 *
 * The consumer sends its public address in `session-create`, the provider
 * answers with its own and both sides start punching towards each other.
 */

use crate::communication::{CommunicationError, Contact};
use crate::dialog::{Dialog, DialogError, DialogEstablisher, DialogWaiter};
use crate::identity::Identity;
use crate::nat_traversal::{Params, PingConfig, Pinger, PunchError, ServiceType};
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const ENDPOINT_SESSION_CREATE: &str = "session-create";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreateRequest {
    pub service_type: ServiceType,
    /// Where the consumer can be punched
    pub config: PingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreateResponse {
    pub id: String,
    /// Where the provider can be punched
    pub config: PingConfig,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to establish dialog: {0}")]
    Dialog(#[from] DialogError),

    #[error("session create request failed: {0}")]
    Request(#[from] CommunicationError),

    #[error("hole punching failed: {0}")]
    Punch(#[from] PunchError),
}

fn ping_config(public: SocketAddr, service_type: &ServiceType) -> PingConfig {
    PingConfig {
        ip: public.ip().to_string(),
        port: public.port(),
        service_type: service_type.clone(),
    }
}

/// How long an accepted dialog may stay open without a session request
pub const SESSION_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Provider side: answers `session-create` on every accepted dialog and
/// queues a punch attempt towards the consumer.
///
/// A dialog is released once its session is created or after
/// `session_timeout` without a request. A peer reconnecting on the same
/// topic replaces its previous dialog.
pub struct SessionProvider {
    pinger: Arc<Pinger>,
    service_type: ServiceType,
    local_port: u16,
    public: SocketAddr,
    session_timeout: Duration,
    dialogs: Mutex<HashMap<String, Arc<Dialog>>>,
    shutdown: CancellationToken,
}

impl SessionProvider {
    /// `public` is the address STUN reported for `local_port`
    pub fn new(pinger: Arc<Pinger>, service_type: ServiceType, local_port: u16, public: SocketAddr) -> Self {
        Self {
            pinger,
            service_type,
            local_port,
            public,
            session_timeout: SESSION_REQUEST_TIMEOUT,
            dialogs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub async fn serve(self: &Arc<Self>, waiter: &DialogWaiter) -> Result<(), DialogError> {
        let provider = self.clone();
        waiter
            .serve_dialogs(move |dialog: Dialog| {
                let provider = provider.clone();
                async move { provider.accept(dialog).await }
            })
            .await
    }

    /// Close all dialogs and cancel pending punch attempts
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let dialogs = std::mem::take(&mut *self.dialogs.lock().unwrap_or_else(|e| e.into_inner()));
        for dialog in dialogs.into_values() {
            dialog.close().await;
        }
    }

    /// Dialogs still waiting for a session request
    pub fn dialog_count(&self) -> usize {
        self.dialogs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn accept(self: Arc<Self>, dialog: Dialog) -> anyhow::Result<()> {
        let dialog = Arc::new(dialog);
        let topic = dialog.topic().to_string();
        let peer = dialog.peer_id().clone();
        info!(%peer, %topic, "listening for sessions");

        let replaced = self
            .dialogs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.clone(), dialog.clone());
        if let Some(stale) = replaced {
            debug!(%peer, %topic, "replacing stale dialog");
            stale.close().await;
        }

        let provider = self.clone();
        let weak = Arc::downgrade(&dialog);
        let listening = dialog
            .receiver()
            .respond(ENDPOINT_SESSION_CREATE, move |request: SessionCreateRequest| {
                let provider = provider.clone();
                let peer = peer.clone();
                let dialog = weak.clone();
                async move {
                    let response = provider.create_session(&peer, request).await?;
                    // Replies go out on the shared connection, so the
                    // dialog can be released before the response is sent
                    if let Some(dialog) = dialog.upgrade() {
                        provider.release(&dialog).await;
                    }
                    Ok(response)
                }
            })
            .await;
        if let Err(e) = listening {
            self.release(&dialog).await;
            return Err(anyhow::Error::new(e).context("failed to listen for sessions"));
        }

        let provider = Arc::downgrade(&self);
        let weak = Arc::downgrade(&dialog);
        let timeout = self.session_timeout;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let (Some(provider), Some(dialog)) = (provider.upgrade(), weak.upgrade()) {
                        debug!(peer = %dialog.peer_id(), "no session requested, releasing dialog");
                        provider.release(&dialog).await;
                    }
                }
            }
        });
        Ok(())
    }

    /// Forget and close `dialog` unless a newer dialog took its topic
    async fn release(&self, dialog: &Arc<Dialog>) {
        {
            let mut dialogs = self.dialogs.lock().unwrap_or_else(|e| e.into_inner());
            if dialogs
                .get(dialog.topic())
                .is_some_and(|current| Arc::ptr_eq(current, dialog))
            {
                dialogs.remove(dialog.topic());
            }
        }
        dialog.close().await;
    }

    async fn create_session(
        &self,
        peer: &Identity,
        request: SessionCreateRequest,
    ) -> anyhow::Result<SessionCreateResponse> {
        if request.service_type != self.service_type {
            warn!(%peer, requested = %request.service_type, "unsupported service type");
            bail!("unsupported service type {}", request.service_type);
        }

        let id = Uuid::new_v4().to_string();
        info!(%peer, session = %id, consumer = %request.config.ip, "creating session");

        self.pinger
            .ping_target(Params {
                request_config: serde_json::to_value(&request.config)?,
                port: self.local_port,
                cancel: self.shutdown.child_token(),
            })
            .await;

        Ok(SessionCreateResponse {
            id,
            config: ping_config(self.public, &self.service_type),
        })
    }
}

/// Negotiated session as seen by the consumer
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub provider: PingConfig,
    pub dialog: Dialog,
    /// Punched socket connected to the provider
    pub socket: UdpSocket,
}

/// Consumer side: dialog, session-create, then punch towards the provider
pub struct SessionConsumer {
    establisher: DialogEstablisher,
    pinger: Arc<Pinger>,
    service_type: ServiceType,
    local_port: u16,
    public: SocketAddr,
}

impl SessionConsumer {
    /// `public` is the address STUN reported for `local_port`
    pub fn new(
        establisher: DialogEstablisher,
        pinger: Arc<Pinger>,
        service_type: ServiceType,
        local_port: u16,
        public: SocketAddr,
    ) -> Self {
        Self {
            establisher,
            pinger,
            service_type,
            local_port,
            public,
        }
    }

    pub async fn connect(
        &self,
        provider_id: &Identity,
        contact: &Contact,
        stop: &CancellationToken,
    ) -> Result<Session, SessionError> {
        let dialog = self.establisher.establish_dialog(provider_id, contact).await?;

        let request = SessionCreateRequest {
            service_type: self.service_type.clone(),
            config: ping_config(self.public, &self.service_type),
        };
        let response: SessionCreateResponse =
            match dialog.sender().request(ENDPOINT_SESSION_CREATE, &request).await {
                Ok(response) => response,
                Err(e) => {
                    dialog.close().await;
                    return Err(e.into());
                }
            };
        info!(session = %response.id, provider = %response.config.ip, port = response.config.port, "session created");

        self.pinger.bind_consumer_port(self.local_port);
        let socket = match self
            .pinger
            .ping_provider(&response.config.ip, response.config.port, stop)
            .await
        {
            Ok(socket) => socket,
            Err(e) => {
                dialog.close().await;
                return Err(e.into());
            }
        };

        Ok(Session {
            id: response.id,
            provider: response.config,
            dialog,
            socket,
        })
    }
}
