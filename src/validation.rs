//! Input validation
//!
//! Server descriptors come from the server list API and configuration comes
//! from disk; both are checked here before anything tries to connect with them.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::net::IpAddr;

use crate::error::{VpnError, VpnResult};

/// WireGuard/X25519 keys are 32 raw bytes
const KEY_LEN: usize = 32;

/// Maximum length for server ids and names coming from the API
const MAX_IDENTIFIER_LEN: usize = 255;

/// Validate IP address
pub fn validate_ip_address(addr: &str) -> VpnResult<IpAddr> {
    addr.parse::<IpAddr>()
        .map_err(|_| VpnError::InvalidParameter(format!("Invalid IP address: {}", addr)))
}

/// Validate a port number (0 is never a usable destination port)
pub fn validate_port(port: u16) -> VpnResult<()> {
    if port == 0 {
        return Err(VpnError::InvalidParameter("Port 0 is not a valid destination".to_string()));
    }
    Ok(())
}

/// Validate a list of ports: all valid, no duplicates
pub fn validate_port_list(ports: &[u16]) -> VpnResult<()> {
    for (i, port) in ports.iter().enumerate() {
        validate_port(*port)?;
        if ports[..i].contains(port) {
            return Err(VpnError::InvalidParameter(format!("Duplicate port {} in list", port)));
        }
    }
    Ok(())
}

/// Validate a base64-encoded X25519 key (public or private)
pub fn validate_key_base64(key: &str) -> VpnResult<()> {
    let bytes = BASE64
        .decode(key.trim())
        .map_err(|_| VpnError::InvalidParameter("Key is not valid base64".to_string()))?;

    if bytes.len() != KEY_LEN {
        return Err(VpnError::InvalidParameter(format!(
            "Key must decode to {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        )));
    }

    Ok(())
}

/// Validate an identifier from the API (server id, server name, domain)
pub fn validate_identifier(value: &str, what: &str) -> VpnResult<()> {
    if value.is_empty() {
        return Err(VpnError::InvalidParameter(format!("{} cannot be empty", what)));
    }

    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(VpnError::InvalidParameter(format!(
            "{} too long (max {} characters)",
            what, MAX_IDENTIFIER_LEN
        )));
    }

    if value.chars().any(|c| c.is_control()) {
        return Err(VpnError::InvalidParameter(format!(
            "{} contains control characters",
            what
        )));
    }

    Ok(())
}

/// Validate load percentage
pub fn validate_load(load: f32) -> VpnResult<()> {
    if !load.is_finite() || !(0.0..=100.0).contains(&load) {
        return Err(VpnError::InvalidParameter(format!("Load {} outside 0..=100", load)));
    }
    Ok(())
}

/// Validate a CIDR notation (e.g., "10.2.0.2/32")
pub fn validate_cidr(cidr: &str) -> VpnResult<()> {
    let (ip, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| VpnError::InvalidParameter(format!("Missing prefix in CIDR: {}", cidr)))?;

    let addr = validate_ip_address(ip)?;
    let prefix_len: u8 = prefix
        .parse()
        .map_err(|_| VpnError::InvalidParameter(format!("Invalid prefix in CIDR: {}", cidr)))?;

    let max = if addr.is_ipv6() { 128 } else { 32 };
    if prefix_len > max {
        return Err(VpnError::InvalidParameter(format!(
            "Prefix length {} exceeds maximum {}",
            prefix_len, max
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_validation() {
        assert!(validate_ip_address("10.0.0.1").is_ok());
        assert!(validate_ip_address("fe80::1").is_ok());

        assert!(validate_ip_address("256.1.1.1").is_err());
        assert!(validate_ip_address("not_an_ip").is_err());
    }

    #[test]
    fn test_port_list_validation() {
        assert!(validate_port_list(&[443, 88, 1224]).is_ok());
        assert!(validate_port_list(&[]).is_ok());

        assert!(validate_port_list(&[443, 0]).is_err());
        assert!(validate_port_list(&[443, 88, 443]).is_err());
    }

    #[test]
    fn test_key_validation() {
        let key = BASE64.encode([7u8; 32]);
        assert!(validate_key_base64(&key).is_ok());

        assert!(validate_key_base64("not base64!").is_err());
        // valid base64, wrong length
        assert!(validate_key_base64("AAAA").is_err());
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("CH#1", "server name").is_ok());

        assert!(validate_identifier("", "server id").is_err());
        assert!(validate_identifier("bad\nname", "server name").is_err());
        assert!(validate_identifier(&"x".repeat(300), "server id").is_err());
    }

    #[test]
    fn test_load_and_cidr_validation() {
        assert!(validate_load(0.0).is_ok());
        assert!(validate_load(100.0).is_ok());
        assert!(validate_load(100.5).is_err());
        assert!(validate_load(f32::NAN).is_err());

        assert!(validate_cidr("10.2.0.2/32").is_ok());
        assert!(validate_cidr("::/0").is_ok());
        assert!(validate_cidr("10.2.0.2/33").is_err());
        assert!(validate_cidr("10.2.0.2").is_err());
    }
}
