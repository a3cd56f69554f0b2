/**
 * nat_traversal/proxy.rs
 *
 * Takes over punched sockets and relays them to the local service
 */

use super::types::ServiceType;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const RELAY_BUFFER: usize = 65_535;

/// Receives ownership of a live punched socket
pub trait NatProxy: Send + Sync {
    fn is_available(&self, service_type: &ServiceType) -> bool;
    fn register_service_port(&self, service_type: ServiceType, port: u16);
    fn hand_off(&self, service_type: &ServiceType, socket: UdpSocket);
}

/// Relays datagrams between the punched socket and `127.0.0.1:<service port>`
pub struct UdpRelayProxy {
    ports: Mutex<HashMap<ServiceType, u16>>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl Default for UdpRelayProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpRelayProxy {
    pub fn new() -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
            idle_timeout: RELAY_IDLE_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Stop every relay started by this proxy
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn service_port(&self, service_type: &ServiceType) -> Option<u16> {
        self.ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(service_type)
            .copied()
    }
}

impl NatProxy for UdpRelayProxy {
    fn is_available(&self, service_type: &ServiceType) -> bool {
        self.service_port(service_type).is_some()
    }

    fn register_service_port(&self, service_type: ServiceType, port: u16) {
        info!(%service_type, port, "registered service port");
        self.ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service_type, port);
    }

    fn hand_off(&self, service_type: &ServiceType, socket: UdpSocket) {
        let Some(port) = self.service_port(service_type) else {
            warn!(%service_type, "no service port registered, dropping punched socket");
            return;
        };
        let service = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let idle_timeout = self.idle_timeout;
        let shutdown = self.shutdown.child_token();
        let service_type = service_type.clone();

        tokio::spawn(async move {
            match relay(socket, service, idle_timeout, shutdown).await {
                Ok(()) => info!(%service_type, "relay finished"),
                Err(e) => warn!(%service_type, "relay failed: {}", e),
            }
        });
    }
}

async fn relay(
    remote: UdpSocket,
    service: SocketAddr,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let local = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    local.connect(service).await?;
    info!(
        remote = ?remote.peer_addr().ok(),
        %service,
        "relaying punched socket to service"
    );

    let mut from_remote = vec![0u8; RELAY_BUFFER];
    let mut from_service = vec![0u8; RELAY_BUFFER];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(idle_timeout) => {
                debug!(%service, "relay idle, closing");
                return Ok(());
            }
            received = remote.recv(&mut from_remote) => {
                let forwarded = match received {
                    Ok(len) => local.send(&from_remote[..len]).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                skip_transient(forwarded, "service")?;
            }
            received = local.recv(&mut from_service) => {
                let forwarded = match received {
                    Ok(len) => remote.send(&from_service[..len]).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                skip_transient(forwarded, "remote")?;
            }
        }
    }
}

/// A connected UDP socket reports an earlier ICMP port unreachable as
/// `ConnectionRefused`; the other side may come back, so keep relaying.
fn skip_transient(result: io::Result<()>, side: &str) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            debug!(side, "relay peer unreachable, retrying: {}", e);
            Ok(())
        }
        other => other,
    }
}
