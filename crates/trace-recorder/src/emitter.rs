//! Segment emission to the local trace daemon
//!
//! Each entity is sent as one UDP datagram: the protocol header line,
//! a newline, then the JSON document. Datagram boundaries are the message
//! boundaries. Delivery is best effort; every failure is reported as an
//! [`EmitOutcome`] that callers are free to ignore.

use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use tokio::net::UdpSocket;

use crate::entity::{Entity, EntityDocument};
use crate::error::{Result, TraceError};

/// Daemon address used when nothing else is configured
pub const DEFAULT_DAEMON_ADDRESS: &str = "127.0.0.1:2000";

/// Environment override for the daemon address; wins over explicit config
pub const DAEMON_ADDRESS_ENV: &str = "AWS_XRAY_DAEMON_ADDRESS";

/// First line of every datagram
pub const PROTOCOL_HEADER: &str = r#"{"format":"json","version":1}"#;

/// Result of a send attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Datagram written; carries its size in bytes
    Sent(usize),
    /// Trace was not sampled, nothing to send
    NotSampled,
    /// Facade segments belong to the host and are not sent
    Facade,
    /// Encoding or transport failed; the entity was dropped
    Dropped(String),
}

impl EmitOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, EmitOutcome::Sent(_))
    }
}

/// Destination for finished entities
pub trait Emitter: Send + Sync {
    fn send(&self, entity: &Entity) -> EmitOutcome;
}

/// Encode an entity into a daemon datagram
pub fn encode_packet(document: &EntityDocument) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(document)?;
    let mut packet = Vec::with_capacity(PROTOCOL_HEADER.len() + 1 + body.len());
    packet.extend_from_slice(PROTOCOL_HEADER.as_bytes());
    packet.push(b'\n');
    packet.extend_from_slice(&body);
    Ok(packet)
}

fn precheck(entity: &Entity) -> Option<EmitOutcome> {
    if !entity.sampled().is_sampled() {
        return Some(EmitOutcome::NotSampled);
    }
    if entity.is_segment() && entity.is_facade() {
        return Some(EmitOutcome::Facade);
    }
    None
}

/// Where datagrams go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    udp_address: String,
}

impl DaemonConfig {
    /// Parse `host:port` or `udp:host:port tcp:host:port`
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let parts: Vec<&str> = value.split_whitespace().collect();

        let udp = match parts.as_slice() {
            [single] if !single.starts_with("udp:") && !single.starts_with("tcp:") => *single,
            _ => parts
                .iter()
                .find_map(|part| part.strip_prefix("udp:"))
                .ok_or_else(|| TraceError::InvalidDaemonAddress(value.to_string()))?,
        };

        let (host, port) = udp
            .rsplit_once(':')
            .ok_or_else(|| TraceError::InvalidDaemonAddress(value.to_string()))?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(TraceError::InvalidDaemonAddress(value.to_string()));
        }

        Ok(Self {
            udp_address: udp.to_string(),
        })
    }

    /// Resolve the address with precedence: environment, explicit, default.
    ///
    /// Invalid values are logged and skipped.
    pub fn resolve(explicit: Option<&str>) -> Self {
        let from_env = std::env::var(DAEMON_ADDRESS_ENV).ok();
        Self::resolve_with(from_env.as_deref(), explicit)
    }

    fn resolve_with(from_env: Option<&str>, explicit: Option<&str>) -> Self {
        if let Some(value) = from_env {
            match Self::parse(value) {
                Ok(config) => {
                    if explicit.is_some() {
                        tracing::debug!(
                            env = value,
                            "Daemon address set in environment; ignoring explicit address"
                        );
                    }
                    return config;
                }
                Err(e) => tracing::warn!(error = %e, "Ignoring daemon address from environment"),
            }
        }

        if let Some(value) = explicit {
            match Self::parse(value) {
                Ok(config) => return config,
                Err(e) => tracing::warn!(error = %e, "Ignoring explicit daemon address"),
            }
        }

        Self::default()
    }

    pub fn udp_address(&self) -> &str {
        &self.udp_address
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            udp_address: DEFAULT_DAEMON_ADDRESS.to_string(),
        }
    }
}

/// Sends entities over UDP without waiting
#[derive(Debug)]
pub struct UdpEmitter {
    socket: Option<UdpSocket>,
    target: Option<SocketAddr>,
}

impl UdpEmitter {
    /// Bind a local socket and resolve the daemon address.
    ///
    /// Never fails: on error the emitter is created disabled and drops
    /// everything it is given.
    pub async fn bind(config: &DaemonConfig) -> Self {
        let target = match tokio::net::lookup_host(config.udp_address()).await {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                tracing::warn!(address = config.udp_address(), error = %e, "Cannot resolve trace daemon");
                None
            }
        };

        let bind_addr = match target {
            Some(SocketAddr::V6(_)) => "[::]:0",
            _ => "0.0.0.0:0",
        };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot bind trace emitter socket");
                None
            }
        };

        tracing::debug!(?target, "Trace emitter ready");
        Self { socket, target }
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    fn transmit(&self, packet: &[u8]) -> std::result::Result<usize, TraceError> {
        let (socket, target) = match (&self.socket, self.target) {
            (Some(socket), Some(target)) => (socket, target),
            _ => return Err(TraceError::Config("emitter is disabled".to_string())),
        };
        Ok(socket.try_send_to(packet, target)?)
    }
}

impl Emitter for UdpEmitter {
    fn send(&self, entity: &Entity) -> EmitOutcome {
        if let Some(outcome) = precheck(entity) {
            return outcome;
        }

        let result = encode_packet(&entity.to_document()).and_then(|packet| self.transmit(&packet));
        match result {
            Ok(bytes) => {
                tracing::trace!(entity_id = %entity.id(), bytes, "Sent entity to daemon");
                EmitOutcome::Sent(bytes)
            }
            Err(e) => {
                tracing::debug!(entity_id = %entity.id(), error = %e, "Dropped entity");
                EmitOutcome::Dropped(e.to_string())
            }
        }
    }
}

/// Keeps emitted documents in memory instead of sending them.
///
/// Useful for local runs and for asserting on what would have been sent.
#[derive(Debug, Default)]
pub struct MemoryEmitter {
    documents: Mutex<Vec<EntityDocument>>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far
    pub fn documents(&self) -> Vec<EntityDocument> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Emitter for MemoryEmitter {
    fn send(&self, entity: &Entity) -> EmitOutcome {
        if let Some(outcome) = precheck(entity) {
            return outcome;
        }
        let document = entity.to_document();
        let bytes = encode_packet(&document).map(|p| p.len()).unwrap_or_default();
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(document);
        EmitOutcome::Sent(bytes)
    }
}
