/**
 * nat_traversal/mod.rs
 *
 * NAT traversal module implementing:
 * - stage events shared by the traversal pipeline
 * - STUN client
 * - UDP hole punching (pinger)
 * - hand-off of punched sockets to local services
 */

mod event;
mod pinger;
mod proxy;
mod stun;
mod types;

pub use event::{Event, EventBus, EventTracker, NatEventWaiter, Publisher, EVENT_TOPIC};
pub use pinger::{
    ttl_for_attempt, Pinger, PingerState, PunchError, PING_INTERVAL, PING_TIMEOUT, STAGE_NAME,
};
pub use proxy::{NatProxy, UdpRelayProxy, RELAY_IDLE_TIMEOUT};
pub use stun::{public_address, StunClient};
pub use types::{ConfigParser, JsonConfigParser, Params, PingConfig, ServiceType};

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};

/// Stage that runs before hole punching; punching is skipped when it succeeds
pub const PORT_MAPPING_STAGE: &str = "port_mapping";

/// Non-blocking IPv4 UDP socket bound to `0.0.0.0:local_port`.
///
/// Address (and on unix, port) reuse lets STUN discovery and punch attempts
/// share the same local port.
pub(crate) fn reusable_udp_socket(local_port: u16) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port));
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}
