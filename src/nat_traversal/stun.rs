/**
 * nat_traversal/stun.rs
 *
 * STUN client for NAT discovery (RFC 5389 binding requests)
 */

use super::reusable_udp_socket;
use anyhow::{anyhow, bail, Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, info};

/// STUN message types
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;

const STUN_MAGIC_COOKIE: u32 = 0x2112A442;
const STUN_HEADER_LEN: usize = 20;

/// STUN attribute types
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

pub const STUN_TIMEOUT: Duration = Duration::from_secs(5);

type TransactionId = [u8; 12];

/// STUN client on a chosen local port.
///
/// The port is bound with address reuse, so the mapping it discovers is the
/// one later punched through by the pinger on the same port.
pub struct StunClient {
    socket: UdpSocket,
    server: SocketAddr,
    timeout: Duration,
}

impl StunClient {
    /// Resolve `server` (host:port) and bind `0.0.0.0:local_port`
    pub async fn bind(server: &str, local_port: u16) -> Result<Self> {
        let server = lookup_host(server)
            .await
            .with_context(|| format!("Failed to resolve STUN server {}", server))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| anyhow!("STUN server {} has no IPv4 address", server))?;

        let socket = reusable_udp_socket(local_port).context("Failed to bind UDP socket")?;
        let socket = UdpSocket::from_std(socket.into()).context("Failed to register UDP socket")?;

        Ok(Self {
            socket,
            server,
            timeout: STUN_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Query the server for our public address
    pub async fn query(&self) -> Result<SocketAddr> {
        let transaction_id: TransactionId = rand::random();
        self.socket
            .send_to(&binding_request(&transaction_id), self.server)
            .await
            .context("Failed to send STUN request")?;

        let mut buffer = [0u8; 1024];
        loop {
            let (len, from) = tokio::time::timeout(self.timeout, self.socket.recv_from(&mut buffer))
                .await
                .map_err(|_| anyhow!("STUN server {} did not answer", self.server))?
                .context("Failed to receive STUN response")?;
            if from != self.server {
                debug!(%from, "ignoring datagram from unexpected source");
                continue;
            }
            if len >= STUN_HEADER_LEN && buffer[8..20] != transaction_id[..] {
                debug!(%from, "ignoring response to another transaction");
                continue;
            }

            let public = parse_binding_response(&buffer[..len], &transaction_id)?;
            info!(%public, local = ?self.socket.local_addr().ok(), "STUN discovery complete");
            return Ok(public);
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("Failed to get local address")
    }
}

/// Public address seen by `server` for traffic leaving `local_port`
pub async fn public_address(server: &str, local_port: u16) -> Result<SocketAddr> {
    StunClient::bind(server, local_port).await?.query().await
}

fn binding_request(transaction_id: &TransactionId) -> Vec<u8> {
    let mut request = Vec::with_capacity(STUN_HEADER_LEN);
    request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    // No attributes
    request.extend_from_slice(&0u16.to_be_bytes());
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    request.extend_from_slice(transaction_id);
    request
}

fn parse_binding_response(data: &[u8], transaction_id: &TransactionId) -> Result<SocketAddr> {
    if data.len() < STUN_HEADER_LEN {
        bail!("STUN response too short");
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != STUN_BINDING_RESPONSE {
        bail!("Invalid STUN response type: 0x{:04x}", msg_type);
    }
    if data[4..8] != STUN_MAGIC_COOKIE.to_be_bytes() {
        bail!("Invalid magic cookie");
    }
    if data[8..20] != transaction_id[..] {
        bail!("Transaction ID mismatch");
    }

    let end = STUN_HEADER_LEN + u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < end {
        bail!("STUN response truncated");
    }

    // XOR-MAPPED-ADDRESS wins over the legacy MAPPED-ADDRESS
    let mut mapped = None;
    let mut offset = STUN_HEADER_LEN;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > end {
            break;
        }

        let value = &data[offset..offset + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return parse_address(value, Some(transaction_id)),
            ATTR_MAPPED_ADDRESS => mapped = Some(parse_address(value, None)?),
            _ => {}
        }
        // Attributes are padded to 4 bytes
        offset += (attr_len + 3) & !3;
    }

    mapped.ok_or_else(|| anyhow!("No address attribute found in STUN response"))
}

/// Decode a (XOR-)MAPPED-ADDRESS value; `xor_key` is the transaction id
/// for the XOR variant
fn parse_address(value: &[u8], xor_key: Option<&TransactionId>) -> Result<SocketAddr> {
    if value.len() < 8 {
        bail!("address attribute too short");
    }

    let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor_key.is_some() {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match value[1] {
        FAMILY_IPV4 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xor_key.is_some() {
                for (octet, key) in octets.iter_mut().zip(cookie) {
                    *octet ^= key;
                }
            }
            IpAddr::from(octets)
        }
        FAMILY_IPV6 => {
            if value.len() < 20 {
                bail!("Invalid IPv6 address length");
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(transaction_id) = xor_key {
                let key = cookie.iter().chain(transaction_id.iter());
                for (octet, key) in octets.iter_mut().zip(key) {
                    *octet ^= key;
                }
            }
            IpAddr::from(octets)
        }
        family => bail!("Unknown address family: {}", family),
    };

    Ok(SocketAddr::new(ip, port))
}
