//! In-memory provisioner and service manager for orchestrator tests

use std::collections::{BTreeSet, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use vxtun_common::{TunnelError, TunnelResult};

use crate::connectivity::{ConnectivityProbe, ProbeResult};
use crate::provisioner::{NetworkProvisioner, OverlaySpec};
use crate::proxy::{ServiceManager, ServiceStatus, ServiceUsage};
use crate::types::Tunnel;

/// Records calls as `"<operation>:<key>"` and fails operations on request
#[derive(Default)]
pub struct FakeProvisioner {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    interfaces: Mutex<BTreeSet<u32>>,
    unprivileged: AtomicBool,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every mutating operation as if not running as root
    pub fn drop_privileges(&self) {
        self.unprivileged.store(true, Ordering::SeqCst);
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        self.failing.lock().unwrap().remove(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn has_interface(&self, vni: u32) -> bool {
        self.interfaces.lock().unwrap().contains(&vni)
    }

    pub fn drop_interface(&self, vni: u32) {
        self.interfaces.lock().unwrap().remove(&vni);
    }

    fn record(&self, operation: &'static str, vni: u32) -> TunnelResult<()> {
        self.calls.lock().unwrap().push(format!("{}:{}", operation, vni));
        if self.failing.lock().unwrap().contains(operation) {
            Err(TunnelError::provisioning(operation, "injected failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NetworkProvisioner for FakeProvisioner {
    async fn create_overlay(&self, spec: &OverlaySpec) -> TunnelResult<()> {
        if self.unprivileged.load(Ordering::SeqCst) {
            return Err(TunnelError::privilege_required("create VXLAN interface"));
        }
        self.record("create-overlay", spec.vni)?;
        if !self.interfaces.lock().unwrap().insert(spec.vni) {
            return Err(TunnelError::conflict(
                "Overlay interface",
                format!("{} already exists", spec.interface_name()),
            ));
        }
        Ok(())
    }

    async fn destroy_overlay(
        &self,
        vni: u32,
        _local_overlay: Option<Ipv4Addr>,
        _remote_overlay: Option<Ipv4Addr>,
    ) -> TunnelResult<()> {
        self.calls.lock().unwrap().push(format!("destroy-overlay:{}", vni));
        if self.failing.lock().unwrap().contains("destroy-overlay") {
            return Err(TunnelError::teardown("destroy-overlay", "injected failure"));
        }
        self.interfaces.lock().unwrap().remove(&vni);
        Ok(())
    }

    async fn setup_nat(&self, vni: u32, _overlay: Ipv4Addr) -> TunnelResult<()> {
        self.record("setup-nat", vni)
    }

    async fn teardown_nat(&self, vni: u32, _overlay: Ipv4Addr) -> TunnelResult<()> {
        self.record("teardown-nat", vni)
    }

    async fn setup_client_route(
        &self,
        vni: u32,
        _peer_overlay: Ipv4Addr,
        _proxy_port: u16,
    ) -> TunnelResult<()> {
        self.record("client-route", vni)
    }

    async fn teardown_client_route(&self, vni: u32, _peer_overlay: Ipv4Addr) -> TunnelResult<()> {
        self.record("teardown-client-route", vni)
    }

    async fn overlay_exists(&self, vni: u32) -> TunnelResult<bool> {
        Ok(self.has_interface(vni))
    }
}

/// Tracks deployed and running services in memory
#[derive(Default)]
pub struct FakeServices {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    deployed: Mutex<BTreeSet<String>>,
    running: Mutex<BTreeSet<String>>,
}

impl FakeServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.lock().unwrap().contains(id)
    }

    pub fn is_deployed(&self, id: &str) -> bool {
        self.deployed.lock().unwrap().contains(id)
    }

    /// Pretend a service was deployed outside the registry's knowledge
    pub fn plant(&self, id: &str, running: bool) {
        self.deployed.lock().unwrap().insert(id.to_string());
        if running {
            self.running.lock().unwrap().insert(id.to_string());
        }
    }

    pub fn crash(&self, id: &str) {
        self.running.lock().unwrap().remove(id);
    }

    fn record(&self, operation: &'static str, id: &str) -> bool {
        self.calls.lock().unwrap().push(format!("{}:{}", operation, id));
        self.failing.lock().unwrap().contains(operation)
    }
}

#[async_trait]
impl ServiceManager for FakeServices {
    async fn deploy(&self, tunnel: &Tunnel) -> TunnelResult<()> {
        if self.record("deploy", &tunnel.id) {
            return Err(TunnelError::conflict("Proxy port", "injected failure"));
        }
        self.deployed.lock().unwrap().insert(tunnel.id.clone());
        Ok(())
    }

    async fn start(&self, id: &str) -> TunnelResult<()> {
        if self.record("start", id) {
            return Err(TunnelError::service_start(id, "injected failure"));
        }
        self.running.lock().unwrap().insert(id.to_string());
        Ok(())
    }

    async fn stop(&self, id: &str) -> TunnelResult<()> {
        if self.record("stop", id) {
            return Err(TunnelError::teardown("stop-proxy", "injected failure"));
        }
        self.running.lock().unwrap().remove(id);
        Ok(())
    }

    async fn remove(&self, id: &str) -> TunnelResult<()> {
        if self.record("remove", id) {
            return Err(TunnelError::storage("remove", "injected failure"));
        }
        self.running.lock().unwrap().remove(id);
        self.deployed.lock().unwrap().remove(id);
        Ok(())
    }

    async fn status(&self, id: &str) -> TunnelResult<ServiceStatus> {
        let running = self.is_running(id);
        Ok(ServiceStatus {
            id: id.to_string(),
            running,
            detail: if running { "active" } else { "inactive" }.to_string(),
        })
    }

    async fn list(&self) -> TunnelResult<Vec<String>> {
        Ok(self.deployed.lock().unwrap().iter().cloned().collect())
    }

    async fn logs(&self, id: &str, lines: usize) -> TunnelResult<String> {
        Ok(format!("{} lines of {}", lines, id))
    }

    async fn usage(&self, id: &str) -> TunnelResult<ServiceUsage> {
        if !self.is_running(id) {
            return Ok(ServiceUsage::stopped(id));
        }
        Ok(ServiceUsage {
            id: id.to_string(),
            running: true,
            pid: Some(100),
            cpu_percent: Some(0.5),
            memory_kb: Some(2048),
        })
    }
}

/// Connectivity probe answering with a fixed egress address
pub struct FakeProbe {
    pub egress: Option<Ipv4Addr>,
    pub seen: Mutex<Vec<SocketAddrV4>>,
}

impl FakeProbe {
    pub fn answering(egress: Ipv4Addr) -> Self {
        Self {
            egress: Some(egress),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            egress: None,
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for FakeProbe {
    async fn fetch_egress(&self, proxy: SocketAddrV4) -> TunnelResult<ProbeResult> {
        self.seen.lock().unwrap().push(proxy);
        match self.egress {
            Some(egress) => Ok(ProbeResult {
                egress: egress.to_string(),
                round_trip: Duration::from_millis(30),
            }),
            None => Err(TunnelError::connectivity(proxy.to_string(), "connection refused")),
        }
    }
}
