//! Network Provisioner - VXLAN interface, NAT and client route management
//!
//! [`NetworkProvisioner`] is the seam the orchestrator drives. The Linux
//! implementation shells out to `ip`, `iptables` and `sysctl` through a
//! [`CommandRunner`], and refuses to run unless the host is Linux and the
//! process is privileged.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use vxtun_common::{
    ensure_linux, ensure_privileged_linux, CommandRunner, HostIdentity, TunnelError, TunnelResult,
};

use crate::commands::*;
use crate::types::{interface_name, overlay_cidr, OVERLAY_PREFIX_LEN};

/// Step labels carried by provisioning errors
pub mod steps {
    pub const CREATE_OVERLAY: &str = "create-overlay";
    pub const DESTROY_OVERLAY: &str = "destroy-overlay";
    pub const SETUP_NAT: &str = "setup-nat";
    pub const TEARDOWN_NAT: &str = "teardown-nat";
    pub const CLIENT_ROUTE: &str = "client-route";
    pub const TEARDOWN_CLIENT_ROUTE: &str = "teardown-client-route";
}

/// Parameters of one overlay interface, seen from the local endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlaySpec {
    pub vni: u32,
    pub local_overlay: Ipv4Addr,
    pub remote_overlay: Ipv4Addr,
    /// Routable address of the peer host
    pub remote_underlay: Ipv4Addr,
    pub tunnel_port: u16,
}

impl OverlaySpec {
    pub fn interface_name(&self) -> String {
        interface_name(self.vni)
    }
}

/// Host network operations for one tunnel endpoint
#[async_trait]
pub trait NetworkProvisioner: Send + Sync {
    /// Create, address and bring up the overlay interface
    ///
    /// Fails with `ResourceConflict` if the interface already exists. On
    /// partial failure the interface is removed before returning.
    async fn create_overlay(&self, spec: &OverlaySpec) -> TunnelResult<()>;

    /// Remove the overlay interface and anything routed through it
    ///
    /// Succeeds if the interface is already absent.
    async fn destroy_overlay(
        &self,
        vni: u32,
        local_overlay: Option<Ipv4Addr>,
        remote_overlay: Option<Ipv4Addr>,
    ) -> TunnelResult<()>;

    /// Enable forwarding and masquerade the overlay subnet out of the default egress
    async fn setup_nat(&self, vni: u32, overlay: Ipv4Addr) -> TunnelResult<()>;

    async fn teardown_nat(&self, vni: u32, overlay: Ipv4Addr) -> TunnelResult<()>;

    /// Route the peer overlay address through the tunnel and probe its proxy port
    async fn setup_client_route(
        &self,
        vni: u32,
        peer_overlay: Ipv4Addr,
        proxy_port: u16,
    ) -> TunnelResult<()>;

    async fn teardown_client_route(&self, vni: u32, peer_overlay: Ipv4Addr) -> TunnelResult<()>;

    async fn overlay_exists(&self, vni: u32) -> TunnelResult<bool>;
}

/// Tunables for [`LinuxProvisioner`]
#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    /// Pause after interface creation and removal
    pub settle_delay: Duration,
    /// Bound on the peer proxy reachability probe; `None` skips the probe
    pub probe_timeout: Option<Duration>,
    /// Treat a failed probe as a provisioning failure
    pub require_peer_reachable: bool,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            probe_timeout: Some(Duration::from_secs(5)),
            require_peer_reachable: false,
        }
    }
}

/// [`NetworkProvisioner`] for Linux hosts
pub struct LinuxProvisioner {
    runner: Arc<dyn CommandRunner>,
    host: Arc<dyn HostIdentity>,
    settings: ProvisionerSettings,
}

impl LinuxProvisioner {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        host: Arc<dyn HostIdentity>,
        settings: ProvisionerSettings,
    ) -> Self {
        Self {
            runner,
            host,
            settings,
        }
    }

    async fn link_exists(&self, ifname: &str) -> TunnelResult<bool> {
        Ok(self.runner.run(&build_link_show_cmd(ifname)).await?.success())
    }

    async fn default_egress(&self) -> TunnelResult<String> {
        let output = self.runner.run_checked(&build_default_route_cmd()).await?;
        parse_route_dev(&output)
            .ok_or_else(|| TunnelError::internal("no default route on this host"))
    }

    /// Egress interface towards `remote`, falling back to the default route
    async fn egress_towards(&self, remote: Ipv4Addr) -> TunnelResult<String> {
        let result = self.runner.run(&build_route_get_cmd(remote)).await?;
        if result.success() {
            if let Some(dev) = parse_route_dev(&result.stdout) {
                return Ok(dev);
            }
        }
        self.default_egress().await
    }

    async fn settle(&self) {
        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }
    }

    async fn configure_interface(&self, spec: &OverlaySpec, ifname: &str) -> TunnelResult<()> {
        let local_prefix = format!("{}/{}", spec.local_overlay, OVERLAY_PREFIX_LEN);
        self.runner
            .run_checked(&build_add_address_cmd(&local_prefix, ifname))
            .await?;
        self.runner
            .run_checked(&build_set_link_up_cmd(ifname))
            .await?;
        self.runner
            .run_checked(&build_add_route_cmd(&overlay_cidr(spec.local_overlay), ifname))
            .await?;
        Ok(())
    }

    async fn apply_nat_rules(&self, ifname: &str, subnet: &str) -> TunnelResult<()> {
        let egress = self.default_egress().await?;
        for rule in nat_rules(ifname, subnet, &egress) {
            let present = self
                .runner
                .run(&build_iptables_cmd(RuleAction::Check, &rule))
                .await?
                .success();
            if present {
                debug!(chain = rule.chain, "NAT rule already present");
                continue;
            }
            self.runner
                .run_checked(&build_iptables_cmd(RuleAction::Append, &rule))
                .await?;
        }
        Ok(())
    }

    /// Delete every NAT rule that is present; returns the first failure
    async fn remove_nat_rules(&self, ifname: &str, subnet: &str) -> TunnelResult<()> {
        let egress = self.default_egress().await?;
        let mut first_error = None;
        for rule in nat_rules(ifname, subnet, &egress) {
            let present = self
                .runner
                .run(&build_iptables_cmd(RuleAction::Check, &rule))
                .await?
                .success();
            if !present {
                continue;
            }
            if let Err(e) = self
                .runner
                .run_checked(&build_iptables_cmd(RuleAction::Delete, &rule))
                .await
            {
                warn!(chain = rule.chain, error = %e, "Failed to delete NAT rule");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn probe_peer(&self, peer: Ipv4Addr, port: u16) -> Result<(), String> {
        let Some(limit) = self.settings.probe_timeout else {
            return Ok(());
        };
        match tokio::time::timeout(limit, TcpStream::connect((peer, port))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(format!("peer proxy {}:{} unreachable: {}", peer, port, e)),
            Err(_) => Err(format!(
                "peer proxy {}:{} did not answer within {:?}",
                peer, port, limit
            )),
        }
    }
}

#[async_trait]
impl NetworkProvisioner for LinuxProvisioner {
    async fn create_overlay(&self, spec: &OverlaySpec) -> TunnelResult<()> {
        ensure_privileged_linux(self.host.as_ref(), "create overlay interface").await?;

        let ifname = spec.interface_name();
        if self.link_exists(&ifname).await? {
            return Err(TunnelError::conflict(
                "Overlay interface",
                format!("{} already exists", ifname),
            ));
        }

        let egress = self
            .egress_towards(spec.remote_underlay)
            .await
            .map_err(|e| TunnelError::provisioning(steps::CREATE_OVERLAY, e.to_string()))?;

        self.runner
            .run_checked(&build_add_vxlan_cmd(
                &ifname,
                spec.vni,
                spec.remote_underlay,
                spec.tunnel_port,
                &egress,
            ))
            .await
            .map_err(|e| TunnelError::provisioning(steps::CREATE_OVERLAY, e.to_string()))?;

        if let Err(e) = self.configure_interface(spec, &ifname).await {
            warn!(interface = %ifname, error = %e, "Overlay configuration failed, removing interface");
            if let Err(cleanup) = self.runner.run_checked(&build_del_link_cmd(&ifname)).await {
                warn!(interface = %ifname, error = %cleanup, "Failed to remove partial interface");
            }
            return Err(TunnelError::provisioning(steps::CREATE_OVERLAY, e.to_string()));
        }

        self.settle().await;
        info!(
            interface = %ifname,
            local = %spec.local_overlay,
            remote = %spec.remote_underlay,
            egress = %egress,
            "Overlay interface created"
        );
        Ok(())
    }

    async fn destroy_overlay(
        &self,
        vni: u32,
        local_overlay: Option<Ipv4Addr>,
        remote_overlay: Option<Ipv4Addr>,
    ) -> TunnelResult<()> {
        ensure_privileged_linux(self.host.as_ref(), "destroy overlay interface").await?;

        let ifname = interface_name(vni);
        if !self.link_exists(&ifname).await? {
            debug!(interface = %ifname, "Overlay interface already absent");
            return Ok(());
        }

        if let Some(peer) = remote_overlay {
            let host_route = format!("{}/32", peer);
            if let Err(e) = self
                .runner
                .run_checked(&build_del_route_cmd(&host_route, &ifname))
                .await
            {
                debug!(interface = %ifname, error = %e, "No peer route to remove");
            }
        }

        if let Some(local) = local_overlay {
            let subnet = overlay_cidr(local);
            if let Err(e) = self.remove_nat_rules(&ifname, &subnet).await {
                warn!(interface = %ifname, error = %e, "NAT cleanup incomplete");
            }
            if let Err(e) = self
                .runner
                .run_checked(&build_del_route_cmd(&subnet, &ifname))
                .await
            {
                debug!(interface = %ifname, error = %e, "No subnet route to remove");
            }
        }

        self.runner
            .run_checked(&build_del_link_cmd(&ifname))
            .await
            .map_err(|e| TunnelError::teardown(steps::DESTROY_OVERLAY, e.to_string()))?;

        self.settle().await;
        info!(interface = %ifname, "Overlay interface removed");
        Ok(())
    }

    async fn setup_nat(&self, vni: u32, overlay: Ipv4Addr) -> TunnelResult<()> {
        ensure_privileged_linux(self.host.as_ref(), "configure NAT").await?;

        let ifname = interface_name(vni);
        let subnet = overlay_cidr(overlay);

        self.runner
            .run_checked(&build_enable_forwarding_cmd())
            .await
            .map_err(|e| TunnelError::provisioning(steps::SETUP_NAT, e.to_string()))?;
        self.apply_nat_rules(&ifname, &subnet)
            .await
            .map_err(|e| TunnelError::provisioning(steps::SETUP_NAT, e.to_string()))?;

        info!(interface = %ifname, subnet = %subnet, "NAT configured");
        Ok(())
    }

    async fn teardown_nat(&self, vni: u32, overlay: Ipv4Addr) -> TunnelResult<()> {
        ensure_privileged_linux(self.host.as_ref(), "remove NAT").await?;

        let ifname = interface_name(vni);
        let subnet = overlay_cidr(overlay);
        self.remove_nat_rules(&ifname, &subnet)
            .await
            .map_err(|e| TunnelError::teardown(steps::TEARDOWN_NAT, e.to_string()))?;

        info!(interface = %ifname, subnet = %subnet, "NAT removed");
        Ok(())
    }

    async fn setup_client_route(
        &self,
        vni: u32,
        peer_overlay: Ipv4Addr,
        proxy_port: u16,
    ) -> TunnelResult<()> {
        ensure_privileged_linux(self.host.as_ref(), "configure client route").await?;

        let ifname = interface_name(vni);
        let host_route = format!("{}/32", peer_overlay);
        self.runner
            .run_checked(&build_add_route_cmd(&host_route, &ifname))
            .await
            .map_err(|e| TunnelError::provisioning(steps::CLIENT_ROUTE, e.to_string()))?;

        if let Err(detail) = self.probe_peer(peer_overlay, proxy_port).await {
            if self.settings.require_peer_reachable {
                return Err(TunnelError::provisioning(steps::CLIENT_ROUTE, detail));
            }
            warn!(interface = %ifname, "{}", detail);
        }

        info!(interface = %ifname, peer = %peer_overlay, "Client route configured");
        Ok(())
    }

    async fn teardown_client_route(&self, vni: u32, peer_overlay: Ipv4Addr) -> TunnelResult<()> {
        ensure_privileged_linux(self.host.as_ref(), "remove client route").await?;

        let ifname = interface_name(vni);
        let host_route = format!("{}/32", peer_overlay);
        let result = self
            .runner
            .run(&build_del_route_cmd(&host_route, &ifname))
            .await?;
        if !result.success() {
            // Absent route or interface: nothing left to remove
            debug!(interface = %ifname, output = %result.combined_output(), "Client route already absent");
        }
        Ok(())
    }

    async fn overlay_exists(&self, vni: u32) -> TunnelResult<bool> {
        ensure_linux(self.host.as_ref(), "query overlay interface")?;
        self.link_exists(&interface_name(vni)).await
    }
}
