use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::PreparationError;
use crate::servers::Server;
use super::backend::{ConnectionPlan, VpnBackend};
use super::common::DefaultPorts;
use super::intent::{ConnectIntent, ProtocolSelection, VpnProtocol};
use super::protun::ProTunBackend;
use super::tunnel::TunnelPlatform;
use super::wireguard::{WireGuardBackend, WireGuardSettings};

/// VPN Manager - registry of the tunnel backends, one per [`VpnProtocol`]
#[derive(Default)]
pub struct VpnManager {
    backends: HashMap<VpnProtocol, Arc<dyn VpnBackend>>,
}

impl VpnManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager with the WireGuard and ProTun backends on one platform
    pub fn with_platform(
        platform: Arc<dyn TunnelPlatform>,
        wireguard: WireGuardSettings,
        default_ports: DefaultPorts,
    ) -> Self {
        let mut manager = Self::new();
        manager.register_backend(Arc::new(WireGuardBackend::new(
            Arc::clone(&platform),
            wireguard,
            default_ports.clone(),
        )));
        manager.register_backend(Arc::new(ProTunBackend::new(platform, default_ports)));
        manager
    }

    /// Register a VPN backend driver, replacing any backend for the same protocol
    pub fn register_backend(&mut self, backend: Arc<dyn VpnBackend>) {
        info!("Registering VPN backend: {}", backend.name());
        self.backends.insert(backend.protocol(), backend);
    }

    /// Get a list of registered backend protocols
    pub fn available_backends(&self) -> Vec<VpnProtocol> {
        let mut protocols: Vec<VpnProtocol> = self.backends.keys().copied().collect();
        protocols.sort();
        protocols
    }

    pub fn has_backend(&self, protocol: VpnProtocol) -> bool {
        self.backends.contains_key(&protocol)
    }

    pub fn backend(&self, protocol: VpnProtocol) -> Result<Arc<dyn VpnBackend>, PreparationError> {
        self.backends
            .get(&protocol)
            .cloned()
            .ok_or_else(|| PreparationError::BackendUnavailable(protocol.to_string()))
    }

    /// Prepare `server` on the backend the selection names
    pub async fn prepare(
        &self,
        intent: &ConnectIntent,
        server: &Arc<Server>,
        selection: ProtocolSelection,
    ) -> Result<(Arc<dyn VpnBackend>, ConnectionPlan), PreparationError> {
        let backend = self.backend(selection.vpn)?;
        debug!("Preparing {} on {} ({})", server.server_id, backend.name(), selection);
        let plan = backend.prepare(intent, server, selection).await?;
        Ok((backend, plan))
    }

    /// Disconnect every backend except `keep`, so at most one tunnel is up
    pub async fn disconnect_others(&self, keep: VpnProtocol) {
        for (protocol, backend) in &self.backends {
            if *protocol != keep {
                if let Err(e) = backend.disconnect().await {
                    warn!("Failed to disconnect {}: {}", backend.name(), e);
                }
            }
        }
    }

    /// Disconnect every backend, logging failures
    pub async fn disconnect_all(&self) {
        for backend in self.backends.values() {
            if let Err(e) = backend.disconnect().await {
                warn!("Failed to disconnect {}: {}", backend.name(), e);
            }
        }
    }
}
