use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{ConnectionError, PreparationError};
use crate::servers::Server;
use super::intent::{ConnectIntent, ProtocolSelection, VpnProtocol};
use super::tunnel::TunnelTarget;

/// Coarse, user-facing failure reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoServerAvailable,
    Maintenance,
    ConnectionFailed,
    Unreachable,
    AuthFailed,
    PermissionDenied,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::NoServerAvailable => "no server available",
            ErrorKind::Maintenance => "server in maintenance",
            ErrorKind::ConnectionFailed => "connection failed",
            ErrorKind::Unreachable => "server unreachable",
            ErrorKind::AuthFailed => "authentication failed",
            ErrorKind::PermissionDenied => "permission denied",
        };
        f.write_str(text)
    }
}

/// Connection state for VPN connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VpnState {
    Disabled,
    Connecting,
    /// Connecting, but the device has no network right now
    WaitingForNetwork,
    Connected,
    Disconnecting,
    /// `is_final == false` means a retry is already scheduled
    Error { kind: ErrorKind, is_final: bool },
}

impl VpnState {
    pub fn is_establishing_or_connected(&self) -> bool {
        matches!(self, VpnState::Connecting | VpnState::WaitingForNetwork | VpnState::Connected)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, VpnState::Error { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            VpnState::Disabled => "disabled",
            VpnState::Connecting => "connecting",
            VpnState::WaitingForNetwork => "waiting_for_network",
            VpnState::Connected => "connected",
            VpnState::Disconnecting => "disconnecting",
            VpnState::Error { .. } => "error",
        }
    }
}

impl fmt::Display for VpnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpnState::Error { kind, is_final } => {
                write!(f, "error ({}{})", kind, if *is_final { "" } else { ", retrying" })
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Immutable result of [`VpnBackend::prepare`]: everything needed to connect
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionPlan {
    pub id: Uuid,
    pub intent: ConnectIntent,
    pub server: Arc<Server>,
    pub protocol: ProtocolSelection,
    pub target: TunnelTarget,
}

impl ConnectionPlan {
    pub fn new(
        intent: ConnectIntent,
        server: Arc<Server>,
        protocol: ProtocolSelection,
        target: TunnelTarget,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent,
            server,
            protocol,
            target,
        }
    }
}

/// Common interface of tunnel backends (WireGuard, ProTun).
///
/// Backends report their own sub-state through [`VpnBackend::state`]; the
/// connection manager decides what gets published.
#[async_trait]
pub trait VpnBackend: Send + Sync {
    fn protocol(&self) -> VpnProtocol;

    /// Get the name of this VPN backend (e.g., "wireguard", "protun")
    fn name(&self) -> &str {
        self.protocol().name()
    }

    /// Resolve endpoints for `server` and build a connection plan.
    /// Must not touch shared state.
    async fn prepare(
        &self,
        intent: &ConnectIntent,
        server: &Arc<Server>,
        protocol: ProtocolSelection,
    ) -> Result<ConnectionPlan, PreparationError>;

    /// Bring the tunnel up for a prepared plan, replacing any current tunnel
    async fn connect(&self, plan: &ConnectionPlan) -> Result<(), ConnectionError>;

    /// Tear the tunnel down; no-op when not connected
    async fn disconnect(&self) -> Result<(), ConnectionError>;

    /// Plan of the last connect() call
    async fn last_plan(&self) -> Option<ConnectionPlan>;

    /// Reconnect with the last plan
    async fn reconnect(&self) -> Result<(), ConnectionError> {
        let plan = self.last_plan().await.ok_or(ConnectionError::NotPrepared)?;
        self.disconnect().await?;
        self.connect(&plan).await
    }

    /// Backend's own view of its tunnel
    fn state(&self) -> watch::Receiver<VpnState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(VpnState::Connecting.is_establishing_or_connected());
        assert!(VpnState::WaitingForNetwork.is_establishing_or_connected());
        assert!(!VpnState::Disconnecting.is_establishing_or_connected());

        let error = VpnState::Error { kind: ErrorKind::Unreachable, is_final: false };
        assert!(error.is_error());
        assert_eq!(error.to_string(), "error (server unreachable, retrying)");
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_value(VpnState::Error { kind: ErrorKind::Maintenance, is_final: true }).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["kind"], "maintenance");
    }
}
