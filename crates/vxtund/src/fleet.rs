//! Fleet-wide operations and diagnostics
//!
//! Batch operations iterate the registry and collect a result per tunnel;
//! one failing tunnel never aborts the batch.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use vxtun_common::{TunnelError, TunnelResult};

use crate::connectivity::{ConnectivityProbe, ConnectivityReport};
use crate::orchestrator::Orchestrator;
use crate::proxy::ServiceUsage;
use crate::types::{Role, Tunnel, TunnelStatus};

/// Outcome of orphan cleanup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub failed: Vec<FailedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub id: String,
    pub error: String,
}

/// Outcome of a bulk restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedItem>,
    pub skipped: Vec<String>,
}

/// Health of one tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEntry {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub status: TunnelStatus,
    pub overlay_present: bool,
    pub service_running: bool,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One deployed proxy service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_name: Option<String>,
    pub running: bool,
    pub detail: String,
    /// No registry record owns this service
    pub orphan: bool,
}

/// Resource usage across all registered tunnels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub services: Vec<ServiceUsage>,
    pub running: usize,
    pub total_cpu_percent: f64,
    pub total_memory_kb: u64,
}

impl UsageSummary {
    fn add(&mut self, usage: ServiceUsage) {
        if usage.running {
            self.running += 1;
        }
        self.total_cpu_percent += usage.cpu_percent.unwrap_or(0.0);
        self.total_memory_kb += usage.memory_kb.unwrap_or(0);
        self.services.push(usage);
    }
}

pub struct Fleet {
    orchestrator: Arc<Orchestrator>,
    probe: Arc<dyn ConnectivityProbe>,
    listen_address: Ipv4Addr,
}

impl Fleet {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        probe: Arc<dyn ConnectivityProbe>,
        listen_address: Ipv4Addr,
    ) -> Self {
        Self {
            orchestrator,
            probe,
            listen_address,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Stop and remove proxy services whose id has no registry record
    #[instrument(skip(self))]
    pub async fn cleanup_orphans(&self) -> TunnelResult<CleanupReport> {
        let services = self.orchestrator.services();
        let deployed = services.list().await?;
        let mut report = CleanupReport::default();

        for id in deployed {
            if self.orchestrator.registry().contains(&id).await {
                continue;
            }
            match services.remove(&id).await {
                Ok(()) => {
                    info!(service = %id, "Removed orphaned proxy service");
                    report.removed.push(id);
                }
                Err(e) => {
                    warn!(service = %id, error = %e, "Failed to remove orphaned proxy service");
                    report.failed.push(FailedItem {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Restart every active or errored tunnel
    #[instrument(skip(self))]
    pub async fn restart_all(&self) -> BatchReport {
        let mut report = BatchReport::default();
        for tunnel in self.orchestrator.list().await {
            if tunnel.status == TunnelStatus::Inactive {
                report.skipped.push(tunnel.id);
                continue;
            }
            match self.orchestrator.restart(&tunnel.id).await {
                Ok(_) => report.succeeded.push(tunnel.id),
                Err(e) => report.failed.push(FailedItem {
                    id: tunnel.id,
                    error: e.to_string(),
                }),
            }
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Bulk restart finished"
        );
        report
    }

    /// Check each tunnel's interface and proxy; mark broken active tunnels as errored
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Vec<HealthEntry> {
        let mut entries = Vec::new();
        for tunnel in self.orchestrator.list().await {
            entries.push(self.check_one(tunnel).await);
        }
        entries
    }

    async fn check_one(&self, tunnel: Tunnel) -> HealthEntry {
        let mut problems = Vec::new();

        let overlay_present = match self.orchestrator.provisioner().overlay_exists(tunnel.vni).await {
            Ok(present) => present,
            Err(e) => {
                problems.push(format!("interface query failed: {}", e));
                false
            }
        };
        let service_running = match self.orchestrator.services().status(&tunnel.id).await {
            Ok(status) => status.running,
            Err(e) => {
                problems.push(format!("service query failed: {}", e));
                false
            }
        };

        let mut status = tunnel.status;
        let healthy = match tunnel.status {
            TunnelStatus::Active => {
                if !overlay_present {
                    problems.push(format!("interface {} is missing", tunnel.interface_name()));
                }
                if !service_running {
                    problems.push("proxy service is not running".to_string());
                }
                if !problems.is_empty() {
                    let message = format!("health check: {}", problems.join("; "));
                    match self.orchestrator.mark_unhealthy(&tunnel, message).await {
                        Ok(Some(updated)) => status = updated.status,
                        Ok(None) => {}
                        Err(e) => warn!(tunnel = %tunnel.id, error = %e, "Failed to record health"),
                    }
                }
                problems.is_empty()
            }
            TunnelStatus::Inactive => problems.is_empty(),
            TunnelStatus::Error => {
                if let Some(message) = &tunnel.error_message {
                    problems.push(message.clone());
                }
                false
            }
        };

        HealthEntry {
            id: tunnel.id,
            name: tunnel.name,
            role: tunnel.role,
            status,
            overlay_present,
            service_running,
            healthy,
            detail: (!problems.is_empty()).then(|| problems.join("; ")),
        }
    }

    /// Every deployed proxy service, flagged when no tunnel owns it
    pub async fn list_services(&self) -> TunnelResult<Vec<ServiceEntry>> {
        let services = self.orchestrator.services();
        let tunnels = self.orchestrator.list().await;
        let mut entries = Vec::new();

        for id in services.list().await? {
            let status = services.status(&id).await?;
            let owner = tunnels.iter().find(|t| t.id == id);
            entries.push(ServiceEntry {
                tunnel_name: owner.map(|t| t.name.clone()),
                orphan: owner.is_none(),
                running: status.running,
                detail: status.detail,
                id,
            });
        }
        Ok(entries)
    }

    pub async fn resource_usage(&self) -> UsageSummary {
        let mut summary = UsageSummary::default();
        for tunnel in self.orchestrator.list().await {
            let usage = match self.orchestrator.services().usage(&tunnel.id).await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(tunnel = %tunnel.id, error = %e, "Usage query failed");
                    ServiceUsage::stopped(&tunnel.id)
                }
            };
            summary.add(usage);
        }
        summary
    }

    pub async fn logs(&self, id: &str, lines: usize) -> TunnelResult<String> {
        self.orchestrator.get(id).await?;
        self.orchestrator.services().logs(id, lines).await
    }

    /// Request the echo endpoint through an active origin's SOCKS5 listener
    ///
    /// A failed request is reported, not returned as an error.
    #[instrument(skip(self))]
    pub async fn test_connectivity(&self, id: &str) -> TunnelResult<ConnectivityReport> {
        let tunnel = self.orchestrator.get(id).await?;
        if tunnel.role != Role::Origin {
            return Err(TunnelError::validation(
                "role",
                "connectivity tests run on origin tunnels",
            ));
        }
        if !tunnel.is_active() {
            return Err(TunnelError::validation(
                "status",
                format!("tunnel '{}' is {}", id, tunnel.status),
            ));
        }

        let host = if self.listen_address.is_unspecified() {
            Ipv4Addr::LOCALHOST
        } else {
            self.listen_address
        };
        let proxy = SocketAddrV4::new(host, tunnel.proxy_port);
        let outcome = self.probe.fetch_egress(proxy).await;
        let report = ConnectivityReport::from_probe(id, proxy, tunnel.relay_address, outcome);

        if report.success {
            info!(
                tunnel = %id,
                egress = report.observed_egress.as_deref().unwrap_or(""),
                matches_relay = report.matches_relay,
                "Connectivity test passed"
            );
        } else {
            warn!(tunnel = %id, error = report.error.as_deref().unwrap_or(""), "Connectivity test failed");
        }
        Ok(report)
    }
}
