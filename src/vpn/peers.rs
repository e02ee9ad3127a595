//! ProTun peer resolution
//!
//! Turns a server's connecting domains into concrete peers: one peer per
//! distinct entry IP, each carrying the ports for every transport that
//! resolved to that IP.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::debug;

use crate::servers::{ConnectingDomain, Server, ServerId};
use super::common::DefaultPorts;
use super::intent::TransportProtocol;

/// A resolved network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub server_id: ServerId,
    pub address: IpAddr,
    pub ports: BTreeMap<TransportProtocol, Vec<u16>>,
    pub public_key_base64: Option<String>,
    /// Lower is tried first
    pub ordinal: usize,
}

impl Peer {
    pub fn ports_for(&self, protocol: TransportProtocol) -> &[u16] {
        self.ports.get(&protocol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn protocols(&self) -> impl Iterator<Item = TransportProtocol> + '_ {
        self.ports.keys().copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerResolver {
    default_ports: DefaultPorts,
}

impl PeerResolver {
    pub fn new(default_ports: DefaultPorts) -> Self {
        Self { default_ports }
    }

    pub fn default_ports(&self) -> &DefaultPorts {
        &self.default_ports
    }

    /// Resolve peers for `server` covering `protocols`.
    ///
    /// Returns `None` when no domain yields a usable (IP, ports) pair for any
    /// of the protocols. Offline domains are skipped.
    pub fn resolve(&self, server: &Server, protocols: &BTreeSet<TransportProtocol>) -> Option<Vec<Peer>> {
        let mut peers = Vec::new();

        for domain in server.online_domains() {
            for mut peer in self.resolve_domain(&server.server_id, domain, protocols) {
                peer.ordinal = peers.len();
                peers.push(peer);
            }
        }

        if peers.is_empty() {
            debug!(
                "No peer for server {} covering {:?}",
                server.server_id, protocols
            );
            None
        } else {
            Some(peers)
        }
    }

    fn resolve_domain(
        &self,
        server_id: &ServerId,
        domain: &ConnectingDomain,
        protocols: &BTreeSet<TransportProtocol>,
    ) -> Vec<Peer> {
        let mut peers: Vec<Peer> = Vec::new();

        for &protocol in protocols {
            let (address, ports) = match domain.entry_override(protocol) {
                Some(entry) => {
                    let ports = entry
                        .ports
                        .clone()
                        .unwrap_or_else(|| self.default_ports.for_protocol(protocol).to_vec());
                    (entry.ip, ports)
                }
                None => match domain.entry_ip {
                    Some(ip) => (ip, self.default_ports.for_protocol(protocol).to_vec()),
                    None => continue,
                },
            };

            if ports.is_empty() {
                debug!("No ports for {} on {}", protocol, domain.entry_domain);
                continue;
            }

            match peers.iter_mut().find(|peer| peer.address == address) {
                Some(peer) => {
                    peer.ports.insert(protocol, ports);
                }
                None => peers.push(Peer {
                    server_id: server_id.clone(),
                    address,
                    ports: BTreeMap::from([(protocol, ports)]),
                    public_key_base64: domain.public_key.clone(),
                    ordinal: 0,
                }),
            }
        }

        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::test_support::server;
    use crate::servers::{ConnectingDomain, ServerEntryInfo};

    fn ip(value: &str) -> IpAddr {
        value.parse().unwrap()
    }

    fn ports(udp: &[u16], tcp: &[u16], tls: &[u16]) -> DefaultPorts {
        DefaultPorts { udp: udp.to_vec(), tcp: tcp.to_vec(), tls: tls.to_vec() }
    }

    fn protocols(list: &[TransportProtocol]) -> BTreeSet<TransportProtocol> {
        list.iter().copied().collect()
    }

    fn server_with_domain(domain: ConnectingDomain) -> Server {
        let mut server = server("S1", Some(0), 10.0);
        server.connecting_domains = vec![domain];
        server
    }

    #[test]
    fn test_override_wins_over_defaults() {
        let mut domain = ConnectingDomain::new("d1", "d1.example.net", Some(ip("9.9.9.9")));
        domain.entry_ip_per_protocol.insert(
            TransportProtocol::Udp.api_name().to_string(),
            ServerEntryInfo::with_ports(ip("1.1.1.1"), vec![3]),
        );
        let server = server_with_domain(domain);
        let resolver = PeerResolver::new(ports(&[1, 2], &[], &[]));

        let peers = resolver
            .resolve(&server, &protocols(&[TransportProtocol::Udp]))
            .unwrap();

        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, ip("1.1.1.1"));
        assert_eq!(peers[0].ports_for(TransportProtocol::Udp), &[3]);
        assert_eq!(peers[0].server_id, ServerId::new("S1"));
    }

    #[test]
    fn test_protocols_on_different_ips_fan_out() {
        let mut domain = ConnectingDomain::new("d1", "d1.example.net", Some(ip("1.1.1.1")));
        domain.entry_ip_per_protocol.insert(
            TransportProtocol::Tcp.api_name().to_string(),
            ServerEntryInfo::new(ip("2.2.2.2")),
        );
        let server = server_with_domain(domain);
        let resolver = PeerResolver::new(ports(&[51820], &[443], &[8443]));

        let peers = resolver
            .resolve(&server, &protocols(&TransportProtocol::ALL))
            .unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].address, ip("1.1.1.1"));
        assert_eq!(
            peers[0].protocols().collect::<Vec<_>>(),
            vec![TransportProtocol::Udp, TransportProtocol::Tls]
        );
        assert_eq!(peers[0].ports_for(TransportProtocol::Tls), &[8443]);
        assert_eq!(peers[1].address, ip("2.2.2.2"));
        assert_eq!(peers[1].ports_for(TransportProtocol::Tcp), &[443]);
        assert_eq!((peers[0].ordinal, peers[1].ordinal), (0, 1));
    }

    #[test]
    fn test_override_without_ports_uses_defaults() {
        let mut domain = ConnectingDomain::new("d1", "d1.example.net", None);
        domain.entry_ip_per_protocol.insert(
            TransportProtocol::Tls.api_name().to_string(),
            ServerEntryInfo::new(ip("3.3.3.3")),
        );
        let server = server_with_domain(domain);
        let resolver = PeerResolver::new(ports(&[], &[], &[443]));

        let peers = resolver
            .resolve(&server, &protocols(&[TransportProtocol::Udp, TransportProtocol::Tls]))
            .unwrap();

        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ports_for(TransportProtocol::Tls), &[443]);
        assert!(peers[0].ports_for(TransportProtocol::Udp).is_empty());
    }

    #[test]
    fn test_no_address_yields_none() {
        let domain = ConnectingDomain::new("d1", "d1.example.net", None);
        let server = server_with_domain(domain);
        let resolver = PeerResolver::default();

        assert!(resolver
            .resolve(&server, &protocols(&[TransportProtocol::Udp]))
            .is_none());
    }

    #[test]
    fn test_offline_domains_are_skipped_and_ordinals_follow_domain_order() {
        let mut offline = ConnectingDomain::new("d0", "d0.example.net", Some(ip("4.4.4.4")));
        offline.is_online = false;
        let mut first = ConnectingDomain::new("d1", "d1.example.net", Some(ip("5.5.5.5")));
        first.public_key = Some("key-1".to_string());
        let second = ConnectingDomain::new("d2", "d2.example.net", Some(ip("6.6.6.6")));

        let mut server = server("S2", Some(0), 10.0);
        server.connecting_domains = vec![offline, first, second];

        let peers = PeerResolver::default()
            .resolve(&server, &protocols(&[TransportProtocol::Udp]))
            .unwrap();

        let addresses: Vec<_> = peers.iter().map(|p| p.address).collect();
        assert_eq!(addresses, vec![ip("5.5.5.5"), ip("6.6.6.6")]);
        assert_eq!(peers[0].public_key_base64.as_deref(), Some("key-1"));
        assert_eq!(peers[1].ordinal, 1);
    }
}
