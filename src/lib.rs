//! vpnctl - VPN connection orchestration library
//!
//! Async core of a VPN client providing:
//! - Server directory with lock-free snapshots
//! - Binary server status feed (load / availability)
//! - Server list truncation with must-have servers
//! - ProTun peer resolution
//! - Tunnel backends (WireGuard, ProTun)
//! - Connection manager owning the published VPN state
//!
//! The OS tunnel and the server list API are external collaborators, see
//! [`vpn::TunnelPlatform`] and [`servers::ServerListApi`].

pub mod error;
pub mod validation;
pub mod config;
pub mod servers;
pub mod vpn;
pub mod connection_manager;

// Re-export commonly used types
pub use error::{ConnectionError, DecodeError, PreparationError, VpnError, VpnResult};
pub use config::{ConnectionSettings, RetryPolicy, TruncationSettings, VpnCoreConfig};
pub use servers::{
    ConnectingDomain, ConnectionHistory, DirectorySnapshot, Server, ServerDirectory, ServerEntryInfo,
    ServerFeature, ServerId, ServerListApi, ServerListUpdater, ServerStatusReference, StatusEntry,
    StatusUpdate, TruncationLimits, TruncationSelector,
};
pub use vpn::{
    ConnectIntent, ConnectionPlan, DefaultPorts, ErrorKind, Peer, PeerResolver, ProtocolSelection,
    TransportProtocol, TunnelHandle, TunnelPlatform, TunnelRequest, VpnBackend, VpnManager,
    VpnProtocol, VpnState,
};
pub use connection_manager::{ConnectionManager, RetryInfo, VpnStatus};
