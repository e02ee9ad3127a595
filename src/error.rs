//! Error types for vpnctl
//!
//! Errors are split by the layer that produces them. Only the connection
//! manager turns them into something user-visible, via [`ErrorKind`].

use std::io;
use thiserror::Error;

use crate::servers::ServerId;
use crate::vpn::backend::ErrorKind;

/// Failure to decode a binary status payload.
///
/// A decode error never results in a partially applied update.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// Payload is empty, so not even the version header is present
    #[error("status payload is empty")]
    Empty,
    /// Header carries a format version this decoder does not understand
    #[error("unsupported status format version {0}")]
    UnsupportedVersion(u8),
    /// Body length is not a whole number of records
    #[error("status body of {len} bytes is not a multiple of the {record_size}-byte record size")]
    MisalignedLength { len: usize, record_size: usize },
    /// Load value is NaN, infinite or outside 0..=100
    #[error("record {position} carries invalid load {load}")]
    InvalidLoad { position: usize, load: f32 },
    /// The same status index appears twice in one payload
    #[error("status index {0} appears more than once")]
    DuplicateIndex(u32),
}

/// Failure while turning a connect intent into a connection plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreparationError {
    /// Server has no domain/IP able to carry any of the requested transports
    #[error("server {server_id} has no peer for the requested protocols")]
    NoViablePeer { server_id: ServerId },
    #[error("unknown server {0}")]
    UnknownServer(ServerId),
    #[error("no servers known for country {0}")]
    UnknownCountry(String),
    #[error("no servers known for gateway {0}")]
    UnknownGateway(String),
    /// Target exists but nothing usable is online
    #[error("server {0} is in maintenance")]
    ServerInMaintenance(String),
    #[error("no server available")]
    NoServerAvailable,
    #[error("no backend registered for {0}")]
    BackendUnavailable(String),
    /// Temporary condition worth retrying (e.g. resolution timed out)
    #[error("transient preparation failure: {0}")]
    Transient(String),
}

impl PreparationError {
    /// Whether retrying the same intent later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, PreparationError::Transient(_))
    }

    /// Whether another candidate server may succeed where this one failed
    pub fn try_next_candidate(&self) -> bool {
        matches!(
            self,
            PreparationError::NoViablePeer { .. } | PreparationError::ServerInMaintenance(_)
        )
    }

    /// Coarse reason reported to observers
    pub fn reason(&self) -> ErrorKind {
        match self {
            PreparationError::ServerInMaintenance(_) => ErrorKind::Maintenance,
            PreparationError::Transient(_) => ErrorKind::ConnectionFailed,
            _ => ErrorKind::NoServerAvailable,
        }
    }
}

/// Failure while establishing, maintaining or tearing down a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("tunnel platform error: {0}")]
    Platform(String),
    /// connect() or reconnect() called without a prepared plan
    #[error("backend has no prepared connection")]
    NotPrepared,
    /// Attempt superseded by a newer request
    #[error("connection attempt cancelled")]
    Cancelled,
}

impl ConnectionError {
    /// Retryable errors are retried with backoff within the same intent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::Unreachable(_) | ConnectionError::Timeout(_) | ConnectionError::Platform(_)
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, ConnectionError::Cancelled)
    }

    /// Coarse reason reported to observers
    pub fn reason(&self) -> ErrorKind {
        match self {
            ConnectionError::Unreachable(_) | ConnectionError::Timeout(_) => ErrorKind::Unreachable,
            ConnectionError::AuthFailed(_) => ErrorKind::AuthFailed,
            ConnectionError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            _ => ErrorKind::ConnectionFailed,
        }
    }
}

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Server list API collaborator failed
    #[error("API error: {0}")]
    Api(String),
    #[error("Status decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Preparation failed: {0}")]
    Preparation(#[from] PreparationError),
    #[error("Connection failed: {0}")]
    Connection(#[from] ConnectionError),
}

impl From<serde_json::Error> for VpnError {
    fn from(error: serde_json::Error) -> Self {
        VpnError::ParseError(error.to_string())
    }
}

pub type VpnResult<T> = Result<T, VpnError>;
