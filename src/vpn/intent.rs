//! Connect intents and protocol selection

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::VpnError;
use crate::servers::{ServerFeature, ServerId};

/// Transport carrying the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
}

impl TransportProtocol {
    pub const ALL: [TransportProtocol; 3] = [TransportProtocol::Udp, TransportProtocol::Tcp, TransportProtocol::Tls];

    /// Tag used by the server list API in `entry_ip_per_protocol`
    pub fn api_name(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "WireGuardUDP",
            TransportProtocol::Tcp => "WireGuardTCP",
            TransportProtocol::Tls => "WireGuardTLS",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportProtocol::Udp => "udp",
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Tls => "tls",
        };
        f.write_str(name)
    }
}

impl FromStr for TransportProtocol {
    type Err = VpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportProtocol::Udp),
            "tcp" => Ok(TransportProtocol::Tcp),
            "tls" => Ok(TransportProtocol::Tls),
            other => Err(VpnError::InvalidParameter(format!("Unknown transport protocol '{}'", other))),
        }
    }
}

/// Tunnel technology, one backend each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnProtocol {
    WireGuard,
    ProTun,
}

impl VpnProtocol {
    pub fn name(&self) -> &'static str {
        match self {
            VpnProtocol::WireGuard => "wireguard",
            VpnProtocol::ProTun => "protun",
        }
    }
}

impl fmt::Display for VpnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Protocol choice for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSelection {
    pub vpn: VpnProtocol,
    /// `None` lets the backend pick (WireGuard: UDP, ProTun: any)
    #[serde(default)]
    pub transport: Option<TransportProtocol>,
}

impl ProtocolSelection {
    pub fn new(vpn: VpnProtocol, transport: Option<TransportProtocol>) -> Self {
        Self { vpn, transport }
    }

    /// Transports acceptable for this selection
    pub fn transports(&self) -> BTreeSet<TransportProtocol> {
        match (self.vpn, self.transport) {
            (_, Some(transport)) => BTreeSet::from([transport]),
            (VpnProtocol::WireGuard, None) => BTreeSet::from([TransportProtocol::Udp]),
            (VpnProtocol::ProTun, None) => TransportProtocol::ALL.into_iter().collect(),
        }
    }
}

impl Default for ProtocolSelection {
    fn default() -> Self {
        Self::new(VpnProtocol::WireGuard, None)
    }
}

impl fmt::Display for ProtocolSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            Some(transport) => write!(f, "{}/{}", self.vpn, transport),
            None => write!(f, "{}", self.vpn),
        }
    }
}

/// What the user (or the system) asked to connect to.
///
/// Immutable once created; every connection attempt carries its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectIntent {
    Fastest,
    FastestInCountry {
        country: String,
        #[serde(default)]
        excluded_features: BTreeSet<ServerFeature>,
    },
    SpecificServer {
        server_id: ServerId,
    },
    Gateway {
        gateway_name: String,
        /// Pin a specific server of the gateway
        #[serde(default)]
        server_id: Option<ServerId>,
    },
    Profile {
        profile_id: u64,
        target: Box<ConnectIntent>,
        #[serde(default)]
        protocol: Option<ProtocolSelection>,
    },
}

impl ConnectIntent {
    pub fn fastest_in_country(country: impl Into<String>) -> Self {
        ConnectIntent::FastestInCountry {
            country: country.into(),
            excluded_features: BTreeSet::new(),
        }
    }

    pub fn server(server_id: impl Into<ServerId>) -> Self {
        ConnectIntent::SpecificServer { server_id: server_id.into() }
    }

    /// Target with any profile wrapping removed
    pub fn target(&self) -> &ConnectIntent {
        match self {
            ConnectIntent::Profile { target, .. } => target.target(),
            other => other,
        }
    }

    /// Protocol forced by a profile, innermost profile wins
    pub fn protocol_override(&self) -> Option<ProtocolSelection> {
        match self {
            ConnectIntent::Profile { target, protocol, .. } => target.protocol_override().or(*protocol),
            _ => None,
        }
    }

    pub fn profile_id(&self) -> Option<u64> {
        match self {
            ConnectIntent::Profile { profile_id, .. } => Some(*profile_id),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectIntent::Fastest => write!(f, "fastest"),
            ConnectIntent::FastestInCountry { country, .. } => write!(f, "fastest in {}", country),
            ConnectIntent::SpecificServer { server_id } => write!(f, "server {}", server_id),
            ConnectIntent::Gateway { gateway_name, .. } => write!(f, "gateway {}", gateway_name),
            ConnectIntent::Profile { profile_id, target, .. } => write!(f, "profile {} ({})", profile_id, target),
        }
    }
}
