//! Common VPN utility functions shared across all backends

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, VpnError, VpnResult};
use super::backend::{ConnectionPlan, VpnState};
use super::intent::TransportProtocol;
use super::tunnel::{TunnelHandle, TunnelPlatform, TunnelRequest};

/// Default ports per transport, used when a domain carries no override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultPorts {
    #[serde(default = "default_udp_ports")]
    pub udp: Vec<u16>,
    #[serde(default = "default_stream_ports")]
    pub tcp: Vec<u16>,
    #[serde(default = "default_stream_ports")]
    pub tls: Vec<u16>,
}

fn default_udp_ports() -> Vec<u16> {
    vec![443, 88, 1224, 51820, 500, 4500]
}

fn default_stream_ports() -> Vec<u16> {
    vec![443]
}

impl Default for DefaultPorts {
    fn default() -> Self {
        Self {
            udp: default_udp_ports(),
            tcp: default_stream_ports(),
            tls: default_stream_ports(),
        }
    }
}

impl DefaultPorts {
    pub fn for_protocol(&self, protocol: TransportProtocol) -> &[u16] {
        match protocol {
            TransportProtocol::Udp => &self.udp,
            TransportProtocol::Tcp => &self.tcp,
            TransportProtocol::Tls => &self.tls,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.udp.is_empty() && self.tcp.is_empty() && self.tls.is_empty()
    }
}

#[derive(Default)]
struct SessionInner {
    handle: Option<TunnelHandle>,
    last_plan: Option<ConnectionPlan>,
}

/// Tunnel bookkeeping shared by the backends: the platform handle, the last
/// plan and the backend-reported state.
pub struct TunnelSession {
    platform: Arc<dyn TunnelPlatform>,
    state: watch::Sender<VpnState>,
    inner: Mutex<SessionInner>,
}

impl TunnelSession {
    pub fn new(platform: Arc<dyn TunnelPlatform>) -> Self {
        let (state, _) = watch::channel(VpnState::Disabled);
        Self {
            platform,
            state,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<VpnState> {
        self.state.subscribe()
    }

    pub fn set_state(&self, state: VpnState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("Backend state {} -> {}", current, state);
                *current = state;
                true
            }
        });
    }

    pub async fn last_plan(&self) -> Option<ConnectionPlan> {
        self.inner.lock().await.last_plan.clone()
    }

    pub async fn is_up(&self) -> bool {
        self.inner.lock().await.handle.is_some()
    }

    /// Establish the first request that succeeds, tearing down any current
    /// tunnel beforehand. A non-retryable failure stops the walk.
    pub async fn establish_first(
        &self,
        plan: &ConnectionPlan,
        requests: Vec<TunnelRequest>,
    ) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock().await;

        if let Some(handle) = inner.handle.take() {
            debug!("Replacing tunnel {}", handle.interface_name);
            if let Err(e) = self.platform.teardown(handle).await {
                warn!("Failed to tear down previous tunnel: {}", e);
            }
        }

        inner.last_plan = Some(plan.clone());
        self.set_state(VpnState::Connecting);

        let mut last_error = None;
        for request in requests {
            match self.platform.establish(request).await {
                Ok(handle) => {
                    info!("Tunnel {} up for server {}", handle.interface_name, plan.server.server_id);
                    inner.handle = Some(handle);
                    self.set_state(VpnState::Connected);
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    debug!("Endpoint failed, trying next: {}", e);
                    last_error = Some(e);
                }
                Err(e) => {
                    self.set_state(VpnState::Error { kind: e.reason(), is_final: true });
                    return Err(e);
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| ConnectionError::Unreachable("no endpoint to connect to".to_string()));
        self.set_state(VpnState::Error { kind: error.reason(), is_final: true });
        Err(error)
    }

    /// Tear the tunnel down. Always ends in `Disabled`, even if the platform
    /// reports a failure.
    pub async fn teardown(&self) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock().await;
        let result = match inner.handle.take() {
            Some(handle) => {
                self.set_state(VpnState::Disconnecting);
                info!("Tearing down tunnel {}", handle.interface_name);
                self.platform.teardown(handle).await
            }
            None => Ok(()),
        };
        self.set_state(VpnState::Disabled);
        result
    }
}

/// Write configuration to a file securely (with appropriate permissions)
pub async fn write_secure_config(path: &Path, content: &str, permissions: u32) -> VpnResult<()> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| VpnError::ConfigError(format!("Failed to write config to {:?}: {}", path, e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(permissions);
        tokio::fs::set_permissions(path, perms)
            .await
            .map_err(|e| VpnError::ConfigError(format!("Failed to set permissions on {:?}: {}", path, e)))?;
    }
    #[cfg(not(unix))]
    let _ = permissions;

    debug!("Wrote config to {:?} with permissions {:o}", path, permissions);
    Ok(())
}
