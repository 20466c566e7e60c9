//! Transfer descriptor: the portable snapshot of a relay tunnel
//!
//! A descriptor is base64 (standard alphabet) over a JSON object. The origin
//! host decodes it and materializes an independent origin record with the
//! same VNI, ports and overlay pair.

use std::net::Ipv4Addr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vxtun_common::{TunnelError, TunnelResult};

use crate::types::{validate_overlay_pair, validate_port, validate_vni, Role, Tunnel};

/// Value of the `kind` discriminator
pub const DESCRIPTOR_KIND: &str = "tunnel_config";

/// Format version written by this crate; any `1.x` is accepted on decode
pub const DESCRIPTOR_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub kind: String,
    pub version: String,
    pub label: String,
    pub relay_address: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_address: Option<Ipv4Addr>,
    pub tunnel_port: u16,
    pub proxy_port: u16,
    pub vni: u32,
    pub origin_overlay_address: Ipv4Addr,
    pub relay_overlay_address: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl TransferDescriptor {
    /// Snapshot a relay tunnel
    pub fn from_relay(tunnel: &Tunnel) -> TunnelResult<Self> {
        if tunnel.role != Role::Relay {
            return Err(TunnelError::validation(
                "role",
                format!(
                    "descriptors are exported from relay tunnels, '{}' is {}",
                    tunnel.id, tunnel.role
                ),
            ));
        }

        Ok(Self {
            kind: DESCRIPTOR_KIND.to_string(),
            version: DESCRIPTOR_VERSION.to_string(),
            label: tunnel.name.clone(),
            relay_address: tunnel.relay_address,
            origin_address: tunnel.origin_address,
            tunnel_port: tunnel.tunnel_port,
            proxy_port: tunnel.proxy_port,
            vni: tunnel.vni,
            origin_overlay_address: tunnel.origin_overlay_address,
            relay_overlay_address: tunnel.relay_overlay_address,
            created_at: Some(tunnel.created_at),
        })
    }

    pub fn encode(&self) -> TunnelResult<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| TunnelError::internal(format!("serialize descriptor: {}", e)))?;
        Ok(STANDARD.encode(json))
    }

    /// Decode and validate an encoded descriptor
    pub fn decode(code: &str) -> TunnelResult<Self> {
        let bytes = STANDARD
            .decode(code.trim())
            .map_err(|e| TunnelError::validation("descriptor", format!("invalid base64: {}", e)))?;

        let descriptor: Self = serde_json::from_slice(&bytes)
            .map_err(|e| TunnelError::validation("descriptor", format!("invalid JSON: {}", e)))?;

        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> TunnelResult<()> {
        if self.kind != DESCRIPTOR_KIND {
            return Err(TunnelError::validation(
                "descriptor",
                format!("kind is '{}', expected '{}'", self.kind, DESCRIPTOR_KIND),
            ));
        }
        if self.version.split('.').next() != Some("1") {
            return Err(TunnelError::validation(
                "descriptor",
                format!("unsupported version '{}'", self.version),
            ));
        }
        if self.label.trim().is_empty() {
            return Err(TunnelError::validation("descriptor", "tunnel label is empty"));
        }
        validate_vni(self.vni)?;
        validate_port("tunnel_port", self.tunnel_port)?;
        validate_port("proxy_port", self.proxy_port)?;
        validate_overlay_pair(self.relay_overlay_address, self.origin_overlay_address)
    }
}
