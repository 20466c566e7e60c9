//! Tunnel type definitions and constants

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vxtun_common::{TunnelError, TunnelResult};

/// Lowest valid VXLAN network identifier
pub const VNI_MIN: u32 = 1;

/// Highest valid VXLAN network identifier (24 bits)
pub const VNI_MAX: u32 = 16_777_215;

/// IANA VXLAN UDP port
pub const DEFAULT_TUNNEL_PORT: u16 = 4789;

/// Default SOCKS5 port
pub const DEFAULT_PROXY_PORT: u16 = 1080;

/// Overlay pool every tunnel subnet is carved from (10.100.0.0/16)
pub const OVERLAY_POOL: Ipv4Addr = Ipv4Addr::new(10, 100, 0, 0);

/// Prefix length of one tunnel's overlay subnet
pub const OVERLAY_PREFIX_LEN: u8 = 30;

/// Network address of the overlay subnet containing `addr`
pub fn overlay_network(addr: Ipv4Addr) -> Ipv4Addr {
    let mask = u32::MAX << (32 - OVERLAY_PREFIX_LEN as u32);
    Ipv4Addr::from(u32::from(addr) & mask)
}

/// CIDR string of the overlay subnet containing `addr` (e.g. `10.100.4.0/30`)
pub fn overlay_cidr(addr: Ipv4Addr) -> String {
    format!("{}/{}", overlay_network(addr), OVERLAY_PREFIX_LEN)
}

/// Tunnel endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts client connections and forwards them through the tunnel
    Origin,
    /// Provides egress to the wider network for the origin
    Relay,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Origin => "origin",
            Role::Relay => "relay",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "origin" => Ok(Role::Origin),
            "relay" => Ok(Role::Relay),
            other => Err(TunnelError::validation(
                "role",
                format!("expected 'origin' or 'relay', got '{}'", other),
            )),
        }
    }
}

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Inactive,
    Active,
    Error,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Inactive => "inactive",
            TunnelStatus::Active => "active",
            TunnelStatus::Error => "error",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted tunnel record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    /// Opaque unique identifier, immutable
    pub id: String,
    /// Display label
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub status: TunnelStatus,
    /// Routable address of the origin host (unknown for descriptor-built origins)
    #[serde(default)]
    pub origin_address: Option<Ipv4Addr>,
    /// Routable address of the relay host
    pub relay_address: Ipv4Addr,
    /// VXLAN UDP destination port
    pub tunnel_port: u16,
    /// SOCKS5 port
    pub proxy_port: u16,
    /// VXLAN network identifier, unique across the registry
    pub vni: u32,
    pub origin_overlay_address: Ipv4Addr,
    pub relay_overlay_address: Ipv4Addr,
    /// Advisory, bytes per second
    #[serde(default)]
    pub bandwidth_usage: u64,
    #[serde(default)]
    pub connection_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Tunnel {
    /// Name of the VXLAN interface backing this tunnel
    pub fn interface_name(&self) -> String {
        interface_name(self.vni)
    }

    /// Network address of this tunnel's overlay subnet
    pub fn overlay_network(&self) -> Ipv4Addr {
        overlay_network(self.relay_overlay_address)
    }

    pub fn is_active(&self) -> bool {
        self.status == TunnelStatus::Active
    }

    /// Mark active: clears the error and resets the advisory counters
    pub fn mark_active(&mut self) {
        self.status = TunnelStatus::Active;
        self.error_message = None;
        self.bandwidth_usage = 0;
        self.connection_count = 0;
        self.last_active_at = Utc::now();
    }

    /// Mark inactive: clears the error and zeroes the advisory counters
    pub fn mark_inactive(&mut self) {
        self.status = TunnelStatus::Inactive;
        self.error_message = None;
        self.bandwidth_usage = 0;
        self.connection_count = 0;
    }

    /// Mark error with a human readable message
    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = TunnelStatus::Error;
        self.error_message = Some(message.into());
        self.bandwidth_usage = 0;
        self.connection_count = 0;
    }

    /// Check field-level invariants that do not depend on other records
    pub fn validate(&self) -> TunnelResult<()> {
        validate_vni(self.vni)?;
        validate_port("tunnel_port", self.tunnel_port)?;
        validate_port("proxy_port", self.proxy_port)?;
        validate_overlay_pair(self.relay_overlay_address, self.origin_overlay_address)?;
        if self.name.trim().is_empty() {
            return Err(TunnelError::validation("name", "must not be empty"));
        }
        if self.role == Role::Relay && self.origin_address.is_none() {
            return Err(TunnelError::validation(
                "origin_address",
                "required for relay tunnels",
            ));
        }
        Ok(())
    }
}

/// Name of the VXLAN interface for `vni`
pub fn interface_name(vni: u32) -> String {
    format!("vxlan{}", vni)
}

pub fn validate_vni(vni: u32) -> TunnelResult<()> {
    if (VNI_MIN..=VNI_MAX).contains(&vni) {
        Ok(())
    } else {
        Err(TunnelError::validation(
            "vni",
            format!("{} is outside {}..={}", vni, VNI_MIN, VNI_MAX),
        ))
    }
}

pub fn validate_port(field: &str, port: u16) -> TunnelResult<()> {
    if port == 0 {
        Err(TunnelError::validation(field, "port must be between 1 and 65535"))
    } else {
        Ok(())
    }
}

/// Both overlay addresses must differ and share one overlay subnet
pub fn validate_overlay_pair(relay: Ipv4Addr, origin: Ipv4Addr) -> TunnelResult<()> {
    if relay == origin {
        return Err(TunnelError::validation(
            "overlay_address",
            format!("relay and origin overlay addresses are both {}", relay),
        ));
    }
    if overlay_network(relay) != overlay_network(origin) {
        return Err(TunnelError::validation(
            "overlay_address",
            format!(
                "{} and {} are not in the same /{} subnet",
                relay, origin, OVERLAY_PREFIX_LEN
            ),
        ));
    }
    Ok(())
}

/// Fields accepted by an explicit edit
///
/// VNI and overlay addresses are deliberately absent: edits never reallocate them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelPatch {
    pub name: Option<String>,
    pub origin_address: Option<Ipv4Addr>,
    pub relay_address: Option<Ipv4Addr>,
    pub tunnel_port: Option<u16>,
    pub proxy_port: Option<u16>,
}

impl TunnelPatch {
    pub fn is_empty(&self) -> bool {
        self == &TunnelPatch::default()
    }

    /// True if the patch changes anything the host configuration depends on
    pub fn touches_network(&self) -> bool {
        self.origin_address.is_some()
            || self.relay_address.is_some()
            || self.tunnel_port.is_some()
            || self.proxy_port.is_some()
    }

    pub fn apply(&self, tunnel: &mut Tunnel) {
        if let Some(name) = &self.name {
            tunnel.name = name.clone();
        }
        if let Some(addr) = self.origin_address {
            tunnel.origin_address = Some(addr);
        }
        if let Some(addr) = self.relay_address {
            tunnel.relay_address = addr;
        }
        if let Some(port) = self.tunnel_port {
            tunnel.tunnel_port = port;
        }
        if let Some(port) = self.proxy_port {
            tunnel.proxy_port = port;
        }
    }
}

/// Parameters for creating a relay tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub name: String,
    pub relay_address: Ipv4Addr,
    pub origin_address: Ipv4Addr,
    #[serde(default)]
    pub tunnel_port: Option<u16>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
}

/// Origin parameters typed in by hand instead of a descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualOrigin {
    pub relay_address: Option<Ipv4Addr>,
    pub origin_address: Option<Ipv4Addr>,
    pub tunnel_port: Option<u16>,
    pub proxy_port: Option<u16>,
    pub vni: Option<u32>,
    pub origin_overlay_address: Option<Ipv4Addr>,
    pub relay_overlay_address: Option<Ipv4Addr>,
}

/// Where an origin tunnel's parameters come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginSource {
    /// Encoded transfer descriptor exported by the relay
    Descriptor(String),
    Manual(ManualOrigin),
}

/// Parameters for creating an origin tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginRequest {
    /// Display label; defaults to the descriptor label
    pub name: Option<String>,
    pub source: OriginSource,
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_overlay_network() {
        assert_eq!(
            overlay_network(Ipv4Addr::new(10, 100, 3, 6)),
            Ipv4Addr::new(10, 100, 3, 4)
        );
        assert_eq!(overlay_cidr(Ipv4Addr::new(10, 100, 3, 1)), "10.100.3.0/30");
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("relay".parse::<Role>().unwrap(), Role::Relay);
        assert_eq!("origin".parse::<Role>().unwrap(), Role::Origin);
        assert!("foreign".parse::<Role>().is_err());
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(
            serde_json::to_string(&TunnelStatus::Error).unwrap(),
            "\"error\""
        );
        let status: TunnelStatus = serde_json::from_str("\"active\"").unwrap();
        assert_eq!(status, TunnelStatus::Active);
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut tunnel = relay_tunnel("a", 10000);
        assert!(tunnel.validate().is_ok());

        tunnel.vni = 0;
        assert!(tunnel.validate().is_err());

        let mut tunnel = relay_tunnel("a", 10000);
        tunnel.proxy_port = 0;
        assert!(tunnel.validate().is_err());

        let mut tunnel = relay_tunnel("a", 10000);
        tunnel.origin_overlay_address = Ipv4Addr::new(10, 100, 200, 2);
        assert!(tunnel.validate().is_err());

        let mut tunnel = relay_tunnel("a", 10000);
        tunnel.origin_address = None;
        assert!(tunnel.validate().is_err());
    }

    #[test]
    fn test_origin_without_origin_address_is_valid() {
        let mut tunnel = origin_tunnel("b", 10000);
        tunnel.origin_address = None;
        assert!(tunnel.validate().is_ok());
    }

    #[test]
    fn test_status_transitions_reset_counters() {
        let mut tunnel = relay_tunnel("a", 10000);
        tunnel.bandwidth_usage = 500;
        tunnel.connection_count = 12;

        tunnel.mark_error("create-overlay failed: boom");
        assert_eq!(tunnel.status, TunnelStatus::Error);
        assert_eq!(tunnel.connection_count, 0);
        assert!(tunnel.error_message.is_some());

        tunnel.mark_active();
        assert!(tunnel.is_active());
        assert_eq!(tunnel.error_message, None);

        tunnel.mark_inactive();
        assert_eq!(tunnel.status, TunnelStatus::Inactive);
    }

    #[test]
    fn test_patch_never_touches_allocation() {
        let mut tunnel = relay_tunnel("a", 10000);
        let before = (tunnel.vni, tunnel.relay_overlay_address, tunnel.origin_overlay_address);

        let patch = TunnelPatch {
            name: Some("renamed".to_string()),
            proxy_port: Some(1081),
            ..Default::default()
        };
        assert!(patch.touches_network());
        patch.apply(&mut tunnel);

        assert_eq!(tunnel.name, "renamed");
        assert_eq!(tunnel.proxy_port, 1081);
        assert_eq!(
            (tunnel.vni, tunnel.relay_overlay_address, tunnel.origin_overlay_address),
            before
        );
        assert!(TunnelPatch::default().is_empty());
    }
}
