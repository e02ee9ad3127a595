//! ProTun backend
//!
//! Multi-peer tunnel: the plan carries every resolved peer and the platform
//! walks ports and transports itself.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{ConnectionError, PreparationError};
use crate::servers::Server;
use super::backend::{ConnectionPlan, VpnBackend, VpnState};
use super::common::{DefaultPorts, TunnelSession};
use super::intent::{ConnectIntent, ProtocolSelection, VpnProtocol};
use super::peers::PeerResolver;
use super::tunnel::{TunnelPlatform, TunnelRequest, TunnelTarget};

pub struct ProTunBackend {
    session: TunnelSession,
    resolver: PeerResolver,
}

impl ProTunBackend {
    pub fn new(platform: Arc<dyn TunnelPlatform>, default_ports: DefaultPorts) -> Self {
        Self {
            session: TunnelSession::new(platform),
            resolver: PeerResolver::new(default_ports),
        }
    }
}

#[async_trait]
impl VpnBackend for ProTunBackend {
    fn protocol(&self) -> VpnProtocol {
        VpnProtocol::ProTun
    }

    async fn prepare(
        &self,
        intent: &ConnectIntent,
        server: &Arc<Server>,
        protocol: ProtocolSelection,
    ) -> Result<ConnectionPlan, PreparationError> {
        let selection = ProtocolSelection::new(VpnProtocol::ProTun, protocol.transport);
        let peers = self
            .resolver
            .resolve(server, &selection.transports())
            .ok_or_else(|| PreparationError::NoViablePeer { server_id: server.server_id.clone() })?;

        debug!("ProTun plan for {}: {} peer(s)", server.server_id, peers.len());
        Ok(ConnectionPlan::new(
            intent.clone(),
            Arc::clone(server),
            selection,
            TunnelTarget::ProTun { peers },
        ))
    }

    async fn connect(&self, plan: &ConnectionPlan) -> Result<(), ConnectionError> {
        let TunnelTarget::ProTun { peers } = &plan.target else {
            return Err(ConnectionError::Platform("plan was not prepared by the ProTun backend".to_string()));
        };

        info!("Connecting ProTun to {} with {} peer(s)", plan.server.server_name, peers.len());
        let request = TunnelRequest::ProTun { peers: peers.clone() };
        self.session.establish_first(plan, vec![request]).await
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
