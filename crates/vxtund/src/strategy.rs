//! Role strategies
//!
//! Everything that differs between the two tunnel endpoints lives here so
//! the orchestrator can run one sequence for both roles.

use std::net::Ipv4Addr;
use std::path::Path;

use async_trait::async_trait;
use vxtun_common::{TunnelError, TunnelResult};

use crate::provisioner::{steps, NetworkProvisioner, OverlaySpec};
use crate::proxy::ProxyConfig;
use crate::types::{Role, Tunnel};

/// Role-specific behaviour of a tunnel endpoint
#[async_trait]
pub trait RoleStrategy: Send + Sync {
    fn role(&self) -> Role;

    /// Overlay address assigned to the local interface
    fn local_overlay(&self, tunnel: &Tunnel) -> Ipv4Addr;

    /// Overlay address of the peer
    fn remote_overlay(&self, tunnel: &Tunnel) -> Ipv4Addr;

    /// Routable address of the peer host
    fn remote_underlay(&self, tunnel: &Tunnel) -> TunnelResult<Ipv4Addr>;

    /// Label of the role-specific provisioning step
    fn attach_step(&self) -> &'static str;

    /// Proxy daemon configuration for this endpoint
    fn proxy_config(&self, tunnel: &Tunnel, public_listen: Ipv4Addr, log_path: &Path) -> ProxyConfig;

    /// Role-specific host setup once the overlay and proxy are up
    async fn attach(&self, provisioner: &dyn NetworkProvisioner, tunnel: &Tunnel) -> TunnelResult<()>;

    /// Undo [`RoleStrategy::attach`]
    async fn detach(&self, provisioner: &dyn NetworkProvisioner, tunnel: &Tunnel) -> TunnelResult<()>;

    fn overlay_spec(&self, tunnel: &Tunnel) -> TunnelResult<OverlaySpec> {
        Ok(OverlaySpec {
            vni: tunnel.vni,
            local_overlay: self.local_overlay(tunnel),
            remote_overlay: self.remote_overlay(tunnel),
            remote_underlay: self.remote_underlay(tunnel)?,
            tunnel_port: tunnel.tunnel_port,
        })
    }
}

/// Endpoint that accepts client connections and forwards them to the relay
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginStrategy;

/// Endpoint that gives the origin egress to the wider network
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayStrategy;

/// Strategy for `role`
pub fn strategy_for(role: Role) -> &'static dyn RoleStrategy {
    match role {
        Role::Origin => &OriginStrategy,
        Role::Relay => &RelayStrategy,
    }
}

#[async_trait]
impl RoleStrategy for OriginStrategy {
    fn role(&self) -> Role {
        Role::Origin
    }

    fn local_overlay(&self, tunnel: &Tunnel) -> Ipv4Addr {
        tunnel.origin_overlay_address
    }

    fn remote_overlay(&self, tunnel: &Tunnel) -> Ipv4Addr {
        tunnel.relay_overlay_address
    }

    fn remote_underlay(&self, tunnel: &Tunnel) -> TunnelResult<Ipv4Addr> {
        Ok(tunnel.relay_address)
    }

    fn attach_step(&self) -> &'static str {
        steps::CLIENT_ROUTE
    }

    fn proxy_config(&self, tunnel: &Tunnel, public_listen: Ipv4Addr, log_path: &Path) -> ProxyConfig {
        ProxyConfig::origin(
            public_listen,
            tunnel.proxy_port,
            tunnel.relay_overlay_address,
            tunnel.proxy_port,
            log_path,
        )
    }

    async fn attach(&self, provisioner: &dyn NetworkProvisioner, tunnel: &Tunnel) -> TunnelResult<()> {
        provisioner
            .setup_client_route(tunnel.vni, tunnel.relay_overlay_address, tunnel.proxy_port)
            .await
    }

    async fn detach(&self, provisioner: &dyn NetworkProvisioner, tunnel: &Tunnel) -> TunnelResult<()> {
        provisioner
            .teardown_client_route(tunnel.vni, tunnel.relay_overlay_address)
            .await
    }
}

#[async_trait]
impl RoleStrategy for RelayStrategy {
    fn role(&self) -> Role {
        Role::Relay
    }

    fn local_overlay(&self, tunnel: &Tunnel) -> Ipv4Addr {
        tunnel.relay_overlay_address
    }

    fn remote_overlay(&self, tunnel: &Tunnel) -> Ipv4Addr {
        tunnel.origin_overlay_address
    }

    fn remote_underlay(&self, tunnel: &Tunnel) -> TunnelResult<Ipv4Addr> {
        tunnel.origin_address.ok_or_else(|| {
            TunnelError::validation("origin_address", "required for relay tunnels")
        })
    }

    fn attach_step(&self) -> &'static str {
        steps::SETUP_NAT
    }

    fn proxy_config(&self, tunnel: &Tunnel, _public_listen: Ipv4Addr, log_path: &Path) -> ProxyConfig {
        ProxyConfig::relay(tunnel.relay_overlay_address, tunnel.proxy_port, log_path)
    }

    async fn attach(&self, provisioner: &dyn NetworkProvisioner, tunnel: &Tunnel) -> TunnelResult<()> {
        provisioner
            .setup_nat(tunnel.vni, tunnel.relay_overlay_address)
            .await
    }

    async fn detach(&self, provisioner: &dyn NetworkProvisioner, tunnel: &Tunnel) -> TunnelResult<()> {
        provisioner
            .teardown_nat(tunnel.vni, tunnel.relay_overlay_address)
            .await
    }
}
