//! Tunnel Lifecycle Orchestrator
//!
//! Composes the registry, allocator, provisioner and service manager into
//! create/start/stop/restart/delete. Operations on one tunnel id are
//! serialized by a per-id async mutex; different ids proceed concurrently.
//!
//! Start order: overlay interface, proxy deploy and start, then the
//! role-specific step (NAT on the relay, client route on the origin). A
//! failure after the overlay exists stops the proxy and destroys the overlay
//! before the record is marked `error` with the failing step's label.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vxtun_common::{TunnelError, TunnelResult};

use crate::allocator::{derive_overlay_pair, Allocator};
use crate::descriptor::TransferDescriptor;
use crate::provisioner::{steps, NetworkProvisioner};
use crate::proxy::ServiceManager;
use crate::registry::TunnelRegistry;
use crate::strategy::{strategy_for, RoleStrategy};
use crate::types::*;

/// Step label for proxy configuration failures
pub const DEPLOY_PROXY_STEP: &str = "deploy-proxy";

/// Step label for proxy launch failures
pub const START_PROXY_STEP: &str = "start-proxy";

/// A failed start step and its cause
#[derive(Debug)]
struct StepFailure {
    step: &'static str,
    error: TunnelError,
}

impl StepFailure {
    fn new(step: &'static str, error: TunnelError) -> Self {
        Self { step, error }
    }

    /// Message persisted on the tunnel record
    fn message(&self) -> String {
        match &self.error {
            TunnelError::Provisioning { step, .. } if step == self.step => self.error.to_string(),
            other => format!("{} failed: {}", self.step, other),
        }
    }

    /// True if nothing on the host was touched
    fn left_host_untouched(&self) -> bool {
        self.step == steps::CREATE_OVERLAY && self.error.is_precondition()
    }
}

/// Validated origin parameters, whatever their source
struct OriginFields {
    relay_address: std::net::Ipv4Addr,
    origin_address: Option<std::net::Ipv4Addr>,
    tunnel_port: u16,
    proxy_port: u16,
    vni: u32,
    origin_overlay_address: std::net::Ipv4Addr,
    relay_overlay_address: std::net::Ipv4Addr,
}

impl From<TransferDescriptor> for OriginFields {
    fn from(d: TransferDescriptor) -> Self {
        Self {
            relay_address: d.relay_address,
            origin_address: d.origin_address,
            tunnel_port: d.tunnel_port,
            proxy_port: d.proxy_port,
            vni: d.vni,
            origin_overlay_address: d.origin_overlay_address,
            relay_overlay_address: d.relay_overlay_address,
        }
    }
}

impl TryFrom<ManualOrigin> for OriginFields {
    type Error = TunnelError;

    fn try_from(m: ManualOrigin) -> TunnelResult<Self> {
        let mut missing = Vec::new();
        if m.relay_address.is_none() {
            missing.push("relay_address");
        }
        if m.vni.is_none() {
            missing.push("vni");
        }
        let (Some(relay_address), Some(vni)) = (m.relay_address, m.vni) else {
            return Err(TunnelError::validation(
                "origin",
                format!("missing {}", missing.join(", ")),
            ));
        };

        let (relay_overlay_address, origin_overlay_address) =
            match (m.relay_overlay_address, m.origin_overlay_address) {
                (Some(relay), Some(origin)) => (relay, origin),
                (None, None) => derive_overlay_pair(vni),
                _ => {
                    return Err(TunnelError::validation(
                        "overlay_address",
                        "give both overlay addresses or neither",
                    ))
                }
            };

        Ok(Self {
            relay_address,
            origin_address: m.origin_address,
            tunnel_port: m.tunnel_port.unwrap_or(DEFAULT_TUNNEL_PORT),
            proxy_port: m.proxy_port.unwrap_or(DEFAULT_PROXY_PORT),
            vni,
            origin_overlay_address,
            relay_overlay_address,
        })
    }
}

/// Drives tunnels through their lifecycle
pub struct Orchestrator {
    registry: Arc<TunnelRegistry>,
    allocator: Allocator,
    provisioner: Arc<dyn NetworkProvisioner>,
    services: Arc<dyn ServiceManager>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        allocator: Allocator,
        provisioner: Arc<dyn NetworkProvisioner>,
        services: Arc<dyn ServiceManager>,
    ) -> Self {
        Self {
            registry,
            allocator,
            provisioner,
            services,
            locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub(crate) fn provisioner(&self) -> &dyn NetworkProvisioner {
        self.provisioner.as_ref()
    }

    pub(crate) fn services(&self) -> &dyn ServiceManager {
        self.services.as_ref()
    }

    /// Acquire the per-tunnel operation lock
    ///
    /// Unknown ids fail with `NotFound` and leave no entry behind.
    async fn lock(&self, id: &str) -> TunnelResult<OwnedMutexGuard<()>> {
        if !self.registry.contains(id).await {
            return Err(TunnelError::not_found("Tunnel", id));
        }
        let lock = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.clone().lock_owned().await;

        // Deleted while waiting
        if !self.registry.contains(id).await {
            drop(guard);
            self.locks.remove_if(id, |_, entry| Arc::ptr_eq(entry, &lock));
            return Err(TunnelError::not_found("Tunnel", id));
        }
        Ok(guard)
    }

    pub async fn list(&self) -> Vec<Tunnel> {
        self.registry.list().await
    }

    pub async fn get(&self, id: &str) -> TunnelResult<Tunnel> {
        self.registry.get(id).await
    }

    /// Create a relay tunnel with a freshly allocated VNI and overlay pair
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_relay(&self, request: RelayRequest) -> TunnelResult<Tunnel> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(TunnelError::validation("name", "must not be empty"));
        }
        let tunnel_port = request.tunnel_port.unwrap_or(DEFAULT_TUNNEL_PORT);
        let proxy_port = request.proxy_port.unwrap_or(DEFAULT_PROXY_PORT);
        validate_port("tunnel_port", tunnel_port)?;
        validate_port("proxy_port", proxy_port)?;

        let tunnel = self
            .registry
            .insert_allocated(&self.allocator, |allocation| {
                let now = Utc::now();
                Ok(Tunnel {
                    id: Uuid::new_v4().to_string(),
                    name,
                    role: Role::Relay,
                    status: TunnelStatus::Inactive,
                    origin_address: Some(request.origin_address),
                    relay_address: request.relay_address,
                    tunnel_port,
                    proxy_port,
                    vni: allocation.vni,
                    origin_overlay_address: allocation.origin_overlay_address,
                    relay_overlay_address: allocation.relay_overlay_address,
                    bandwidth_usage: 0,
                    connection_count: 0,
                    created_at: now,
                    last_active_at: now,
                    error_message: None,
                })
            })
            .await?;

        info!(
            tunnel = %tunnel.id,
            vni = tunnel.vni,
            relay_overlay = %tunnel.relay_overlay_address,
            "Relay tunnel created"
        );
        Ok(tunnel)
    }

    /// Materialize an origin tunnel from a descriptor or manual parameters
    #[instrument(skip(self, request))]
    pub async fn create_origin(&self, request: OriginRequest) -> TunnelResult<Tunnel> {
        let (label, fields) = match request.source {
            OriginSource::Descriptor(code) => {
                let descriptor = TransferDescriptor::decode(&code)?;
                (Some(descriptor.label.clone()), OriginFields::from(descriptor))
            }
            OriginSource::Manual(manual) => (None, OriginFields::try_from(manual)?),
        };

        let name = request
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .or(label.map(|l| l.trim().to_string()))
            .unwrap_or_else(|| format!("origin-{}", fields.vni));

        let now = Utc::now();
        let tunnel = self
            .registry
            .insert(Tunnel {
                id: Uuid::new_v4().to_string(),
                name,
                role: Role::Origin,
                status: TunnelStatus::Inactive,
                origin_address: fields.origin_address,
                relay_address: fields.relay_address,
                tunnel_port: fields.tunnel_port,
                proxy_port: fields.proxy_port,
                vni: fields.vni,
                origin_overlay_address: fields.origin_overlay_address,
                relay_overlay_address: fields.relay_overlay_address,
                bandwidth_usage: 0,
                connection_count: 0,
                created_at: now,
                last_active_at: now,
                error_message: None,
            })
            .await?;

        info!(tunnel = %tunnel.id, vni = tunnel.vni, relay = %tunnel.relay_address, "Origin tunnel created");
        Ok(tunnel)
    }

    /// Encoded transfer descriptor of a relay tunnel
    pub async fn descriptor(&self, id: &str) -> TunnelResult<String> {
        let tunnel = self.registry.get(id).await?;
        TransferDescriptor::from_relay(&tunnel)?.encode()
    }

    /// Edit name, addresses or ports
    ///
    /// Network-affecting fields can only change while the tunnel is not active.
    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: &str, patch: TunnelPatch) -> TunnelResult<Tunnel> {
        let _guard = self.lock(id).await?;
        let current = self.registry.get(id).await?;
        if patch.is_empty() {
            return Ok(current);
        }
        if current.is_active() && patch.touches_network() {
            return Err(TunnelError::validation(
                "status",
                format!(
                    "stop tunnel '{}' before changing its addresses or ports",
                    id
                ),
            ));
        }

        let updated = self.registry.update(id, |t| patch.apply(t)).await?;
        info!(tunnel = %id, "Tunnel updated");
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn start(&self, id: &str) -> TunnelResult<Tunnel> {
        let _guard = self.lock(id).await?;
        let tunnel = self.registry.get(id).await?;
        if tunnel.is_active() {
            return Err(TunnelError::already_in_state(id, TunnelStatus::Active.as_str()));
        }
        self.start_locked(tunnel).await
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> TunnelResult<Tunnel> {
        let _guard = self.lock(id).await?;
        let tunnel = self.registry.get(id).await?;
        if tunnel.status == TunnelStatus::Inactive {
            return Err(TunnelError::already_in_state(id, TunnelStatus::Inactive.as_str()));
        }

        if let Err(e) = self.run_stop(&tunnel).await {
            self.record_error(id, e.to_string()).await;
            return Err(e);
        }

        let stopped = self.registry.update(id, Tunnel::mark_inactive).await?;
        info!(tunnel = %id, "Tunnel stopped");
        Ok(stopped)
    }

    /// Stop (ignoring failures) then start, from any state
    #[instrument(skip(self))]
    pub async fn restart(&self, id: &str) -> TunnelResult<Tunnel> {
        let _guard = self.lock(id).await?;
        let tunnel = self.registry.get(id).await?;
        if let Err(e) = self.run_stop(&tunnel).await {
            warn!(tunnel = %id, error = %e, "Stop during restart failed, starting anyway");
        }
        self.start_locked(tunnel).await
    }

    /// Remove a tunnel and its proxy artifacts
    ///
    /// An active tunnel is stopped first and the delete is aborted if that
    /// fails. An errored tunnel gets a best-effort teardown.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> TunnelResult<Tunnel> {
        let guard = self.lock(id).await?;
        let tunnel = self.registry.get(id).await?;

        match tunnel.status {
            TunnelStatus::Active => {
                if let Err(e) = self.run_stop(&tunnel).await {
                    self.record_error(id, e.to_string()).await;
                    return Err(e);
                }
            }
            TunnelStatus::Error => {
                if let Err(e) = self.run_stop(&tunnel).await {
                    warn!(tunnel = %id, error = %e, "Teardown of errored tunnel incomplete");
                }
            }
            TunnelStatus::Inactive => {}
        }

        if let Err(e) = self.services.remove(id).await {
            warn!(tunnel = %id, error = %e, "Failed to remove proxy artifacts");
        }
        let removed = self.registry.delete(id).await?;

        drop(guard);
        self.locks.remove(id);
        info!(tunnel = %id, vni = removed.vni, "Tunnel deleted");
        Ok(removed)
    }

    /// Mark an active tunnel as errored after an external health finding
    ///
    /// `observed` is the record the finding was made against. Returns `None`
    /// if the tunnel has left that activation since (stopped, failed or
    /// restarted).
    pub(crate) async fn mark_unhealthy(
        &self,
        observed: &Tunnel,
        message: String,
    ) -> TunnelResult<Option<Tunnel>> {
        let id = observed.id.as_str();
        let _guard = self.lock(id).await?;
        let tunnel = self.registry.get(id).await?;
        if !tunnel.is_active() || tunnel.last_active_at != observed.last_active_at {
            debug!(tunnel = %id, "Tunnel changed since health check, not marking");
            return Ok(None);
        }
        warn!(tunnel = %id, reason = %message, "Active tunnel failed health check");
        let updated = self.registry.update(id, |t| t.mark_error(message)).await?;
        Ok(Some(updated))
    }

    async fn start_locked(&self, tunnel: Tunnel) -> TunnelResult<Tunnel> {
        match self.run_start(&tunnel).await {
            Ok(()) => {
                let started = self.registry.update(&tunnel.id, Tunnel::mark_active).await?;
                info!(
                    tunnel = %tunnel.id,
                    role = %tunnel.role,
                    interface = %tunnel.interface_name(),
                    "Tunnel started"
                );
                Ok(started)
            }
            Err(failure) if failure.left_host_untouched() => Err(failure.error),
            Err(failure) => {
                let message = failure.message();
                warn!(tunnel = %tunnel.id, error = %message, "Tunnel start failed");
                self.record_error(&tunnel.id, message).await;
                Err(failure.error)
            }
        }
    }

    async fn run_start(&self, tunnel: &Tunnel) -> Result<(), StepFailure> {
        let strategy = strategy_for(tunnel.role);
        let spec = strategy
            .overlay_spec(tunnel)
            .map_err(|e| StepFailure::new(steps::CREATE_OVERLAY, e))?;

        self.provisioner
            .create_overlay(&spec)
            .await
            .map_err(|e| StepFailure::new(steps::CREATE_OVERLAY, e))?;

        if let Err(e) = self.services.deploy(tunnel).await {
            self.rollback(tunnel, strategy).await;
            return Err(StepFailure::new(DEPLOY_PROXY_STEP, e));
        }

        if let Err(e) = self.services.start(&tunnel.id).await {
            self.rollback(tunnel, strategy).await;
            return Err(StepFailure::new(START_PROXY_STEP, e));
        }

        if let Err(e) = strategy.attach(self.provisioner.as_ref(), tunnel).await {
            self.rollback(tunnel, strategy).await;
            return Err(StepFailure::new(strategy.attach_step(), e));
        }

        Ok(())
    }

    /// Undo a partial start: stop the proxy, destroy the overlay
    async fn rollback(&self, tunnel: &Tunnel, strategy: &dyn RoleStrategy) {
        warn!(tunnel = %tunnel.id, "Rolling back partial start");
        if let Err(e) = self.services.stop(&tunnel.id).await {
            warn!(tunnel = %tunnel.id, error = %e, "Rollback: proxy stop failed");
        }
        if let Err(e) = self
            .provisioner
            .destroy_overlay(
                tunnel.vni,
                Some(strategy.local_overlay(tunnel)),
                Some(strategy.remote_overlay(tunnel)),
            )
            .await
        {
            warn!(tunnel = %tunnel.id, error = %e, "Rollback: overlay removal failed");
        }
    }

    /// Stop sequence: only the overlay removal must succeed
    async fn run_stop(&self, tunnel: &Tunnel) -> TunnelResult<()> {
        let strategy = strategy_for(tunnel.role);

        if let Err(e) = self.services.stop(&tunnel.id).await {
            warn!(tunnel = %tunnel.id, error = %e, "Proxy stop failed, continuing teardown");
        }
        if let Err(e) = strategy.detach(self.provisioner.as_ref(), tunnel).await {
            warn!(tunnel = %tunnel.id, error = %e, "Role teardown failed, continuing");
        }
        self.provisioner
            .destroy_overlay(
                tunnel.vni,
                Some(strategy.local_overlay(tunnel)),
                Some(strategy.remote_overlay(tunnel)),
            )
            .await
    }

    async fn record_error(&self, id: &str, message: String) {
        if let Err(e) = self.registry.update(id, |t| t.mark_error(message)).await {
            warn!(tunnel = %id, error = %e, "Failed to record tunnel error");
        }
    }
}
