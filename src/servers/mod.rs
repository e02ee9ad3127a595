//! Server model and directory
//!
//! Server descriptors arrive wholesale from the server list API. Between full
//! refreshes only `load`, `online` and `visible` change, and only through the
//! binary status feed (see [`status`]).

pub mod directory;
pub mod status;
pub mod truncation;
pub mod updater;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

use crate::error::VpnResult;
use crate::validation;
use crate::vpn::intent::TransportProtocol;

pub use directory::{DirectorySnapshot, LoadRanking, SelectionContext, ServerDirectory, ServerRanking};
pub use status::{StatusEntry, StatusUpdate};
pub use truncation::{must_have_ids, ConnectionHistory, TruncationLimits, TruncationSelector};
pub use updater::{RefreshOutcome, ServerListApi, ServerListRequest, ServerListResponse, ServerListUpdater};

/// Logical server identifier as issued by the API
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ServerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Server features used for filtering intents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFeature {
    SecureCore,
    Tor,
    P2p,
    Streaming,
    Ipv6,
}

/// Binds a server to its record in the binary status feed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerStatusReference {
    /// Position of this server's record in the status feed
    pub index: u32,
    /// Reserved for selection scoring
    #[serde(default)]
    pub penalty: f32,
    /// Reserved for selection scoring
    #[serde(default)]
    pub cost: i32,
}

/// Per-protocol entry override of a connecting domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntryInfo {
    pub ip: IpAddr,
    /// Overrides the default ports for the protocol when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
}

impl ServerEntryInfo {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip, ports: None }
    }

    pub fn with_ports(ip: IpAddr, ports: Vec<u16>) -> Self {
        Self { ip, ports: Some(ports) }
    }
}

/// One physical endpoint of a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectingDomain {
    pub id: String,
    pub entry_domain: String,
    /// Default entry IP, used for protocols without an override
    #[serde(default)]
    pub entry_ip: Option<IpAddr>,
    /// Keyed by protocol tag, e.g. "WireGuardUDP"
    #[serde(default)]
    pub entry_ip_per_protocol: BTreeMap<String, ServerEntryInfo>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default = "default_true")]
    pub is_online: bool,
}

impl ConnectingDomain {
    pub fn new(id: impl Into<String>, entry_domain: impl Into<String>, entry_ip: Option<IpAddr>) -> Self {
        Self {
            id: id.into(),
            entry_domain: entry_domain.into(),
            entry_ip,
            entry_ip_per_protocol: BTreeMap::new(),
            public_key: None,
            is_online: true,
        }
    }

    /// Override for a transport protocol, if the API sent one
    pub fn entry_override(&self, protocol: TransportProtocol) -> Option<&ServerEntryInfo> {
        self.entry_ip_per_protocol.get(protocol.api_name())
    }

    /// IP to use for a protocol: the override wins over the default entry IP
    pub fn entry_ip_for(&self, protocol: TransportProtocol) -> Option<IpAddr> {
        self.entry_override(protocol).map(|entry| entry.ip).or(self.entry_ip)
    }

    pub fn validate(&self) -> VpnResult<()> {
        validation::validate_identifier(&self.id, "connecting domain id")?;
        validation::validate_identifier(&self.entry_domain, "entry domain")?;
        for entry in self.entry_ip_per_protocol.values() {
            if let Some(ports) = &entry.ports {
                validation::validate_port_list(ports)?;
            }
        }
        if let Some(key) = &self.public_key {
            validation::validate_key_base64(key)?;
        }
        Ok(())
    }
}

/// Logical server as published by the server list API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub server_id: ServerId,
    /// Display name, e.g. "CH#1"
    pub server_name: String,
    /// Access level required to use this server
    #[serde(default)]
    pub tier: u8,
    /// Load percentage 0..=100
    #[serde(default)]
    pub load: f32,
    #[serde(default = "default_true")]
    pub online: bool,
    /// Hidden servers are kept but never offered for selection
    #[serde(default = "default_true")]
    pub visible: bool,
    pub exit_country: String,
    #[serde(default)]
    pub entry_country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub gateway_name: Option<String>,
    #[serde(default)]
    pub features: BTreeSet<ServerFeature>,
    pub connecting_domains: Vec<ConnectingDomain>,
    #[serde(default)]
    pub status_reference: Option<ServerStatusReference>,
}

fn default_true() -> bool {
    true
}

impl Server {
    /// Online and visible: eligible for selection
    pub fn is_available(&self) -> bool {
        self.online && self.visible
    }

    pub fn has_feature(&self, feature: ServerFeature) -> bool {
        self.features.contains(&feature)
    }

    /// Connecting domains marked online, in API order
    pub fn online_domains(&self) -> impl Iterator<Item = &ConnectingDomain> {
        self.connecting_domains.iter().filter(|domain| domain.is_online)
    }

    /// Domain names of all connecting domains
    pub fn domain_names(&self) -> Vec<&str> {
        self.connecting_domains.iter().map(|domain| domain.entry_domain.as_str()).collect()
    }

    pub fn validate(&self) -> VpnResult<()> {
        validation::validate_identifier(self.server_id.as_str(), "server id")?;
        validation::validate_identifier(&self.server_name, "server name")?;
        validation::validate_load(self.load)?;
        for domain in &self.connecting_domains {
            domain.validate()?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_override_wins() {
        let mut domain = ConnectingDomain::new("d1", "ch-1.example.net", Some("10.0.0.1".parse().unwrap()));
        domain.entry_ip_per_protocol.insert(
            "WireGuardTLS".to_string(),
            ServerEntryInfo::new("10.0.0.9".parse().unwrap()),
        );

        assert_eq!(domain.entry_ip_for(TransportProtocol::Udp), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(domain.entry_ip_for(TransportProtocol::Tls), Some("10.0.0.9".parse().unwrap()));
    }

    #[test]
    fn test_server_deserialize_defaults() {
        let json = r#"{
            "server_id": "s1",
            "server_name": "CH#1",
            "exit_country": "CH",
            "connecting_domains": [
                {"id": "d1", "entry_domain": "ch-1.example.net", "entry_ip": "10.0.0.1"}
            ]
        }"#;
        let server: Server = serde_json::from_str(json).unwrap();

        assert!(server.online);
        assert!(server.visible);
        assert!(server.status_reference.is_none());
        assert!(server.connecting_domains[0].is_online);
        assert!(server.validate().is_ok());
    }

    #[test]
    fn test_server_validation_rejects_bad_load() {
        let mut server = test_support::server("s1", Some(0), 10.0);
        server.load = 140.0;
        assert!(server.validate().is_err());
    }
}
