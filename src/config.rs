//! Configuration management for vpnctl

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{VpnError, VpnResult};
use crate::servers::{SelectionContext, TruncationLimits};
use crate::validation;
use crate::vpn::{DefaultPorts, ProtocolSelection, TransportProtocol, VpnProtocol, WireGuardSettings};

/// Main vpnctl configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VpnCoreConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub truncation: TruncationSettings,
    /// Default ports per transport
    #[serde(default)]
    pub ports: DefaultPorts,
    #[serde(default)]
    pub wireguard: WireGuardSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Default VPN protocol
    #[serde(default = "default_protocol")]
    pub protocol: VpnProtocol,
    /// Transport; backend default when unset
    #[serde(default)]
    pub transport: Option<TransportProtocol>,
    /// Connection attempts per connect before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_true")]
    pub backoff_jitter: bool,
    /// Candidate servers tried per attempt
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Highest server tier the user may connect to
    #[serde(default = "default_user_tier")]
    pub user_tier: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncationSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_recents")]
    pub max_recents: usize,
    #[serde(default = "default_max_must_haves")]
    pub max_must_haves: usize,
}

fn default_protocol() -> VpnProtocol {
    VpnProtocol::WireGuard
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_max_candidates() -> usize {
    5
}

fn default_user_tier() -> u8 {
    2
}

fn default_max_recents() -> usize {
    10
}

fn default_max_must_haves() -> usize {
    50
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            transport: None,
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: true,
            max_candidates: default_max_candidates(),
            user_tier: default_user_tier(),
        }
    }
}

impl Default for TruncationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_recents: default_max_recents(),
            max_must_haves: default_max_must_haves(),
        }
    }
}

/// Bounded exponential backoff between connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        ConnectionSettings::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), without jitter
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay with up to 25% random jitter added, still capped at `max_delay`
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let delay = self.delay(retry);
        if !self.jitter {
            return delay;
        }
        let spread = delay.as_millis() as u64 / 4;
        let extra = if spread == 0 { 0 } else { rand::random::<u64>() % (spread + 1) };
        (delay + Duration::from_millis(extra)).min(self.max_delay)
    }
}

impl ConnectionSettings {
    pub fn protocol_selection(&self) -> ProtocolSelection {
        ProtocolSelection::new(self.protocol, self.transport)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            jitter: self.backoff_jitter,
        }
    }

    pub fn selection_context(&self) -> SelectionContext {
        SelectionContext {
            max_tier: self.user_tier,
            max_candidates: self.max_candidates,
        }
    }
}

impl TruncationSettings {
    pub fn limits(&self) -> TruncationLimits {
        TruncationLimits {
            max_recents: self.max_recents,
            max_must_haves: self.max_must_haves,
        }
    }
}

impl VpnCoreConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> VpnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VpnError::ConfigError(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> VpnResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| VpnError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> VpnResult<()> {
        let content = self.to_toml()?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| VpnError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn to_toml(&self) -> VpnResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| VpnError::ConfigError(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> VpnResult<()> {
        let connection = &self.connection;
        if connection.max_attempts == 0 {
            return Err(VpnError::ConfigError("connection.max_attempts must be at least 1".to_string()));
        }
        if connection.backoff_base_ms > connection.backoff_max_ms {
            return Err(VpnError::ConfigError(
                "connection.backoff_base_ms exceeds connection.backoff_max_ms".to_string(),
            ));
        }
        if connection.max_candidates == 0 {
            return Err(VpnError::ConfigError("connection.max_candidates must be at least 1".to_string()));
        }

        let truncation = &self.truncation;
        if truncation.max_must_haves == 0 {
            return Err(VpnError::ConfigError("truncation.max_must_haves must be at least 1".to_string()));
        }
        if truncation.max_recents > truncation.max_must_haves {
            return Err(VpnError::ConfigError(
                "truncation.max_recents exceeds truncation.max_must_haves".to_string(),
            ));
        }

        if self.ports.is_empty() {
            return Err(VpnError::ConfigError("ports: no default port for any transport".to_string()));
        }
        for protocol in TransportProtocol::ALL {
            validation::validate_port_list(self.ports.for_protocol(protocol))
                .map_err(|e| VpnError::ConfigError(format!("ports.{}: {}", protocol, e)))?;
        }

        self.wireguard
            .validate()
            .map_err(|e| VpnError::ConfigError(format!("wireguard: {}", e)))
    }
}
