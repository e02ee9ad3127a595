//! VPN backends and everything they consume
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   VpnManager (backend registry)     │
//! └──────────────┬──────────────────────┘
//!                │
//!        ┌───────┴───────┐
//!        ▼               ▼
//!   ┌─────────┐     ┌─────────┐
//!   │   WG    │     │ ProTun  │   <- Backend drivers
//!   └────┬────┘     └────┬────┘
//!        └───────┬───────┘
//!                ▼
//!        TunnelPlatform (OS tunnel)
//! ```
//!
//! Each backend implements [`VpnBackend`]: `prepare` builds an immutable
//! [`ConnectionPlan`] for one server, `connect` brings it up.

pub mod backend;
pub mod common;
pub mod intent;
pub mod manager;
pub mod peers;
pub mod protun;
pub mod tunnel;
pub mod wireguard;

pub use backend::{ConnectionPlan, ErrorKind, VpnBackend, VpnState};
pub use common::{DefaultPorts, TunnelSession};
pub use intent::{ConnectIntent, ProtocolSelection, TransportProtocol, VpnProtocol};
pub use manager::VpnManager;
pub use peers::{Peer, PeerResolver};
pub use protun::ProTunBackend;
pub use tunnel::{TunnelHandle, TunnelPlatform, TunnelRequest, TunnelTarget};
pub use wireguard::{WireGuardBackend, WireGuardConfig, WireGuardSettings};
