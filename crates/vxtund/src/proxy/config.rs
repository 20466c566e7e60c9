//! Proxy daemon configuration document
//!
//! The proxy is an Xray-compatible daemon driven entirely by a JSON file.
//! Only the subset needed for a SOCKS5 inbound with either a direct or a
//! chained SOCKS5 outbound is modelled.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use vxtun_common::{TunnelError, TunnelResult};

pub const INBOUND_TAG: &str = "socks-in";
pub const TUNNEL_OUTBOUND_TAG: &str = "tunnel-out";
pub const DIRECT_OUTBOUND_TAG: &str = "direct";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub log: LogSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Routing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub loglevel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub listen: Ipv4Addr,
    pub port: u16,
    pub protocol: String,
    pub settings: SocksInboundSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocksInboundSettings {
    pub auth: String,
    pub udp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SocksOutboundSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocksOutboundSettings {
    pub servers: Vec<SocksServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocksServer {
    pub address: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    pub domain_strategy: String,
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: String,
    pub inbound_tag: Vec<String>,
    pub outbound_tag: String,
}

fn socks_inbound(listen: Ipv4Addr, port: u16) -> Inbound {
    Inbound {
        tag: INBOUND_TAG.to_string(),
        listen,
        port,
        protocol: "socks".to_string(),
        settings: SocksInboundSettings {
            auth: "noauth".to_string(),
            udp: true,
        },
    }
}

fn direct_outbound() -> Outbound {
    Outbound {
        tag: DIRECT_OUTBOUND_TAG.to_string(),
        protocol: "freedom".to_string(),
        settings: None,
    }
}

fn log_section(log_path: &Path) -> LogSection {
    let path = log_path.display().to_string();
    LogSection {
        loglevel: "warning".to_string(),
        access: Some(path.clone()),
        error: Some(path),
    }
}

impl ProxyConfig {
    /// Relay: SOCKS5 on the overlay address, straight out to the network
    pub fn relay(listen: Ipv4Addr, port: u16, log_path: &Path) -> Self {
        Self {
            log: log_section(log_path),
            inbounds: vec![socks_inbound(listen, port)],
            outbounds: vec![direct_outbound()],
            routing: None,
        }
    }

    /// Origin: public SOCKS5 chained to the relay's SOCKS5 across the overlay
    ///
    /// The direct outbound is kept as a fallback only; the routing rule sends
    /// every inbound connection through the tunnel.
    pub fn origin(
        listen: Ipv4Addr,
        port: u16,
        upstream: Ipv4Addr,
        upstream_port: u16,
        log_path: &Path,
    ) -> Self {
        Self {
            log: log_section(log_path),
            inbounds: vec![socks_inbound(listen, port)],
            outbounds: vec![
                Outbound {
                    tag: TUNNEL_OUTBOUND_TAG.to_string(),
                    protocol: "socks".to_string(),
                    settings: Some(SocksOutboundSettings {
                        servers: vec![SocksServer {
                            address: upstream,
                            port: upstream_port,
                        }],
                    }),
                },
                direct_outbound(),
            ],
            routing: Some(Routing {
                domain_strategy: "AsIs".to_string(),
                rules: vec![RoutingRule {
                    kind: "field".to_string(),
                    inbound_tag: vec![INBOUND_TAG.to_string()],
                    outbound_tag: TUNNEL_OUTBOUND_TAG.to_string(),
                }],
            }),
        }
    }

    /// Port the SOCKS5 inbound listens on
    pub fn listen_port(&self) -> Option<u16> {
        self.inbounds.first().map(|inbound| inbound.port)
    }

    pub fn to_json(&self) -> TunnelResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TunnelError::internal(format!("serialize proxy config: {}", e)))
    }
}
