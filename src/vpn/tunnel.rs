//! Tunnel platform capability
//!
//! The OS-level tunnel (VPN service, TUN device, WireGuard library) lives
//! outside this crate. Backends drive it through [`TunnelPlatform`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::error::ConnectionError;
use super::intent::TransportProtocol;
use super::peers::Peer;
use super::wireguard::WireGuardConfig;

/// What a connection plan will connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TunnelTarget {
    /// Candidate endpoints are tried in order
    WireGuard {
        config: WireGuardConfig,
        endpoints: Vec<SocketAddr>,
        transport: TransportProtocol,
    },
    /// The multi-peer tunnel handles port/protocol fallback itself
    ProTun { peers: Vec<Peer> },
}

/// One establish() call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelRequest {
    WireGuard {
        config: WireGuardConfig,
        endpoint: SocketAddr,
        transport: TransportProtocol,
    },
    ProTun { peers: Vec<Peer> },
}

/// Handle to an established tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelHandle {
    pub id: Uuid,
    pub interface_name: String,
}

impl TunnelHandle {
    pub fn new(interface_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            interface_name: interface_name.into(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TunnelPlatform: Send + Sync {
    async fn establish(&self, request: TunnelRequest) -> Result<TunnelHandle, ConnectionError>;

    async fn teardown(&self, handle: TunnelHandle) -> Result<(), ConnectionError>;
}
