use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{ConnectionError, PreparationError, VpnError, VpnResult};
use crate::servers::Server;
use crate::validation;
use super::backend::{ConnectionPlan, VpnBackend, VpnState};
use super::common::{DefaultPorts, TunnelSession};
use super::intent::{ConnectIntent, ProtocolSelection, TransportProtocol, VpnProtocol};
use super::peers::PeerResolver;
use super::tunnel::{TunnelPlatform, TunnelRequest, TunnelTarget};

/// Client side of the `[wireguard]` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGuardSettings {
    /// Base64 client private key; a platform-generated key is used when absent
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,
    #[serde(default = "default_allowed_ips")]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub mtu: Option<u16>,
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
}

fn default_address() -> String {
    "10.2.0.2/32".to_string()
}

fn default_dns() -> Vec<String> {
    vec!["10.2.0.1".to_string()]
}

fn default_allowed_ips() -> Vec<String> {
    vec!["0.0.0.0/0".to_string(), "::/0".to_string()]
}

impl Default for WireGuardSettings {
    fn default() -> Self {
        Self {
            private_key: None,
            address: default_address(),
            dns: default_dns(),
            allowed_ips: default_allowed_ips(),
            mtu: None,
            persistent_keepalive: None,
        }
    }
}

impl WireGuardSettings {
    pub fn validate(&self) -> VpnResult<()> {
        if let Some(key) = &self.private_key {
            validation::validate_key_base64(key)?;
        }
        validation::validate_cidr(&self.address)?;
        for dns in &self.dns {
            validation::validate_ip_address(dns)?;
        }
        for cidr in &self.allowed_ips {
            validation::validate_cidr(cidr)?;
        }
        if let Some(mtu) = self.mtu {
            if !(576..=9000).contains(&mtu) {
                return Err(VpnError::InvalidParameter(format!(
                    "WireGuard MTU {} out of range 576..=9000",
                    mtu
                )));
            }
        }
        Ok(())
    }
}

/// Tunnel configuration for one server, minus the endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGuardConfig {
    pub private_key: Option<String>,
    pub address: String,
    pub dns: Vec<String>,
    pub mtu: Option<u16>,
    pub peer_public_key: String,
    pub allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
}

impl WireGuardConfig {
    pub fn from_settings(settings: &WireGuardSettings, peer_public_key: String) -> Self {
        Self {
            private_key: settings.private_key.clone(),
            address: settings.address.clone(),
            dns: settings.dns.clone(),
            mtu: settings.mtu,
            peer_public_key,
            allowed_ips: settings.allowed_ips.clone(),
            persistent_keepalive: settings.persistent_keepalive,
        }
    }

    /// Render `wg-quick` style configuration content for one endpoint
    pub fn render(&self, endpoint: SocketAddr) -> String {
        let mut cfg = String::new();

        // [Interface] section
        cfg.push_str("[Interface]\n");
        if let Some(private_key) = &self.private_key {
            let _ = writeln!(cfg, "PrivateKey = {}", private_key);
        }
        let _ = writeln!(cfg, "Address = {}", self.address);
        if !self.dns.is_empty() {
            let _ = writeln!(cfg, "DNS = {}", self.dns.join(", "));
        }
        if let Some(mtu) = self.mtu {
            let _ = writeln!(cfg, "MTU = {}", mtu);
        }

        // [Peer] section
        cfg.push_str("\n[Peer]\n");
        let _ = writeln!(cfg, "PublicKey = {}", self.peer_public_key);
        let _ = writeln!(cfg, "AllowedIPs = {}", self.allowed_ips.join(", "));
        let _ = writeln!(cfg, "Endpoint = {}", endpoint);
        if let Some(keepalive) = self.persistent_keepalive {
            let _ = writeln!(cfg, "PersistentKeepalive = {}", keepalive);
        }

        cfg
    }
}

/// WireGuard VPN backend implementation
pub struct WireGuardBackend {
    session: TunnelSession,
    resolver: PeerResolver,
    settings: WireGuardSettings,
}

impl WireGuardBackend {
    pub fn new(platform: Arc<dyn TunnelPlatform>, settings: WireGuardSettings, default_ports: DefaultPorts) -> Self {
        Self {
            session: TunnelSession::new(platform),
            resolver: PeerResolver::new(default_ports),
            settings,
        }
    }

    /// Endpoints on the first online domain that has a key and an address
    /// for `transport`, in port order
    fn endpoints(&self, server: &Server, transport: TransportProtocol) -> Option<(String, Vec<SocketAddr>)> {
        let peers = self.resolver.resolve(server, &BTreeSet::from([transport]))?;
        peers.into_iter().find_map(|peer| {
            let key = peer.public_key_base64.clone()?;
            let endpoints: Vec<SocketAddr> = peer
                .ports_for(transport)
                .iter()
                .map(|port| SocketAddr::new(peer.address, *port))
                .collect();
            Some((key, endpoints))
        })
    }
}

#[async_trait]
impl VpnBackend for WireGuardBackend {
    fn protocol(&self) -> VpnProtocol {
        VpnProtocol::WireGuard
    }

    async fn prepare(
        &self,
        intent: &ConnectIntent,
        server: &Arc<Server>,
        protocol: ProtocolSelection,
    ) -> Result<ConnectionPlan, PreparationError> {
        let transport = protocol.transport.unwrap_or(TransportProtocol::Udp);
        let (peer_public_key, endpoints) = self
            .endpoints(server, transport)
            .ok_or_else(|| PreparationError::NoViablePeer { server_id: server.server_id.clone() })?;

        debug!(
            "WireGuard plan for {} over {}: {} endpoint(s)",
            server.server_id,
            transport,
            endpoints.len()
        );

        let config = WireGuardConfig::from_settings(&self.settings, peer_public_key);
        Ok(ConnectionPlan::new(
            intent.clone(),
            Arc::clone(server),
            ProtocolSelection::new(VpnProtocol::WireGuard, Some(transport)),
            TunnelTarget::WireGuard { config, endpoints, transport },
        ))
    }

    async fn connect(&self, plan: &ConnectionPlan) -> Result<(), ConnectionError> {
        let TunnelTarget::WireGuard { config, endpoints, transport } = &plan.target else {
            return Err(ConnectionError::Platform("plan was not prepared by the WireGuard backend".to_string()));
        };

        info!("Connecting WireGuard VPN to {}", plan.server.server_name);
        let requests = endpoints
            .iter()
            .map(|endpoint| TunnelRequest::WireGuard {
                config: config.clone(),
                endpoint: *endpoint,
                transport: *transport,
            })
            .collect();
        self.session.establish_first(plan, requests).await
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.session.teardown().await
    }

    async fn last_plan(&self) -> Option<ConnectionPlan> {
        self.session.last_plan().await
    }

    fn state(&self) -> watch::Receiver<VpnState> {
        self.session.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::test_support::server;
    use crate::servers::{ConnectingDomain, ServerEntryInfo};
    use crate::vpn::tunnel::{MockTunnelPlatform, TunnelHandle};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use mockall::predicate::*;

    fn key() -> String {
        BASE64.encode([7u8; 32])
    }

    fn wg_server() -> Arc<Server> {
        let mut server = server("S1", Some(0), 10.0);
        let mut domain = ConnectingDomain::new("d1", "d1.example.net", Some("1.2.3.4".parse().unwrap()));
        domain.public_key = Some(key());
        domain.entry_ip_per_protocol.insert(
            TransportProtocol::Tcp.api_name().to_string(),
            ServerEntryInfo::with_ports("5.6.7.8".parse().unwrap(), vec![8443]),
        );
        server.connecting_domains = vec![domain];
        Arc::new(server)
    }

    fn ports() -> DefaultPorts {
        DefaultPorts { udp: vec![51820, 443], tcp: vec![443], tls: vec![443] }
    }

    fn endpoint(value: &str) -> SocketAddr {
        value.parse().unwrap()
    }

    #[test]
    fn test_render_config() {
        let config = WireGuardConfig::from_settings(&WireGuardSettings::default(), key());
        let text = config.render(endpoint("1.2.3.4:51820"));

        assert!(text.starts_with("[Interface]\n"));
        assert!(text.contains("Address = 10.2.0.2/32\n"));
        assert!(text.contains("AllowedIPs = 0.0.0.0/0, ::/0\n"));
        assert!(text.contains("Endpoint = 1.2.3.4:51820\n"));
        assert!(!text.contains("PrivateKey"));
    }

    #[test]
    fn test_settings_validation() {
        assert!(WireGuardSettings::default().validate().is_ok());

        let bad_key = WireGuardSettings { private_key: Some("short".into()), ..Default::default() };
        assert!(bad_key.validate().is_err());

        let bad_mtu = WireGuardSettings { mtu: Some(100), ..Default::default() };
        assert!(bad_mtu.validate().is_err());
    }

    #[tokio::test]
    async fn test_prepare_uses_default_ports_for_udp() {
        let backend = WireGuardBackend::new(Arc::new(MockTunnelPlatform::new()), WireGuardSettings::default(), ports());

        let plan = backend
            .prepare(&ConnectIntent::Fastest, &wg_server(), ProtocolSelection::default())
            .await
            .unwrap();

        assert_eq!(plan.protocol.transport, Some(TransportProtocol::Udp));
        match plan.target {
            TunnelTarget::WireGuard { endpoints, config, .. } => {
                assert_eq!(endpoints, vec![endpoint("1.2.3.4:51820"), endpoint("1.2.3.4:443")]);
                assert_eq!(config.peer_public_key, key());
            }
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prepare_uses_override_for_tcp() {
        let backend = WireGuardBackend::new(Arc::new(MockTunnelPlatform::new()), WireGuardSettings::default(), ports());
        let selection = ProtocolSelection::new(VpnProtocol::WireGuard, Some(TransportProtocol::Tcp));

        let plan = backend
            .prepare(&ConnectIntent::Fastest, &wg_server(), selection)
            .await
            .unwrap();

        match plan.target {
            TunnelTarget::WireGuard { endpoints, .. } => {
                assert_eq!(endpoints, vec![endpoint("5.6.7.8:8443")]);
            }
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prepare_without_key_has_no_viable_peer() {
        let backend = WireGuardBackend::new(Arc::new(MockTunnelPlatform::new()), WireGuardSettings::default(), ports());
        // test_support servers carry no public key
        let server = Arc::new(server("S2", Some(0), 10.0));

        let err = backend
            .prepare(&ConnectIntent::Fastest, &server, ProtocolSelection::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PreparationError::NoViablePeer { .. }));
        assert!(err.try_next_candidate());
    }

    #[tokio::test]
    async fn test_connect_falls_back_to_next_endpoint() {
        let mut platform = MockTunnelPlatform::new();
        platform
            .expect_establish()
            .withf(|request| matches!(request, TunnelRequest::WireGuard { endpoint, .. } if endpoint.port() == 51820))
            .times(1)
            .returning(|_| Err(ConnectionError::Unreachable("blocked".into())));
        platform
            .expect_establish()
            .withf(|request| matches!(request, TunnelRequest::WireGuard { endpoint, .. } if endpoint.port() == 443))
            .times(1)
            .returning(|_| Ok(TunnelHandle::new("wg0")));
        platform.expect_teardown().with(always()).times(1).returning(|_| Ok(()));

        let backend = WireGuardBackend::new(Arc::new(platform), WireGuardSettings::default(), ports());
        let plan = backend
            .prepare(&ConnectIntent::Fastest, &wg_server(), ProtocolSelection::default())
            .await
            .unwrap();

        backend.connect(&plan).await.unwrap();
        assert_eq!(*backend.state().borrow(), VpnState::Connected);
        assert_eq!(backend.last_plan().await.map(|p| p.id), Some(plan.id));

        backend.disconnect().await.unwrap();
        assert_eq!(*backend.state().borrow(), VpnState::Disabled);
    }

    #[tokio::test]
    async fn test_reconnect_without_plan_fails() {
        let backend = WireGuardBackend::new(Arc::new(MockTunnelPlatform::new()), WireGuardSettings::default(), ports());

        let err = backend.reconnect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotPrepared));
    }
}
