//! Proxy supervision as detached processes tracked by pid files

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use vxtun_common::shell::{shellquote, KILL_CMD};
use vxtun_common::{CommandRunner, TunnelError, TunnelResult};

use super::{
    ensure_port_free, process_usage, remove_file_if_exists, tail_file, write_config, ProxySettings,
    ServiceManager, ServiceStatus, ServiceUsage, STOP_STEP,
};
use crate::types::Tunnel;

/// Lines of the daemon log attached to a start failure
const FAILURE_LOG_LINES: usize = 20;

/// Launches the proxy with `nohup` and remembers its pid
pub struct ProcessServiceManager {
    runner: Arc<dyn CommandRunner>,
    settings: ProxySettings,
}

impl ProcessServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: ProxySettings) -> Self {
        Self { runner, settings }
    }

    async fn read_pid(&self, id: &str) -> Option<u32> {
        let contents = tokio::fs::read_to_string(self.settings.pid_path(id)).await.ok()?;
        contents.trim().parse().ok()
    }

    async fn is_alive(&self, pid: u32) -> TunnelResult<bool> {
        Ok(self
            .runner
            .run(&format!("{} -0 {}", KILL_CMD, pid))
            .await?
            .success())
    }

    /// Pid of the running daemon, if any
    async fn running_pid(&self, id: &str) -> TunnelResult<Option<u32>> {
        match self.read_pid(id).await {
            Some(pid) if self.is_alive(pid).await? => Ok(Some(pid)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl ServiceManager for ProcessServiceManager {
    async fn deploy(&self, tunnel: &Tunnel) -> TunnelResult<()> {
        ensure_port_free(self.runner.as_ref(), tunnel.proxy_port).await?;
        write_config(&self.settings, tunnel).await?;
        info!(tunnel = %tunnel.id, "Proxy configuration deployed");
        Ok(())
    }

    async fn start(&self, id: &str) -> TunnelResult<()> {
        let service = self.settings.service_name(id);
        if let Some(pid) = self.running_pid(id).await? {
            debug!(service = %service, pid, "Proxy already running");
            return Ok(());
        }

        let config = self.settings.config_path(id);
        let log = self.settings.log_path(id);
        let cmd = format!(
            "nohup {} run -c {} >> {} 2>&1 & echo $!",
            shellquote(&self.settings.binary.display().to_string()),
            shellquote(&config.display().to_string()),
            shellquote(&log.display().to_string())
        );
        let output = self
            .runner
            .run_checked(&cmd)
            .await
            .map_err(|e| TunnelError::service_start(&service, e.to_string()))?;
        let pid: u32 = output.trim().parse().map_err(|_| {
            TunnelError::service_start(&service, format!("unexpected launcher output '{}'", output))
        })?;

        let pid_path = self.settings.pid_path(id);
        tokio::fs::create_dir_all(&self.settings.run_dir)
            .await
            .map_err(|e| {
                TunnelError::storage(
                    format!("create {}", self.settings.run_dir.display()),
                    e.to_string(),
                )
            })?;
        tokio::fs::write(&pid_path, pid.to_string())
            .await
            .map_err(|e| TunnelError::storage(format!("write {}", pid_path.display()), e.to_string()))?;

        tokio::time::sleep(self.settings.start_wait).await;

        if self.is_alive(pid).await? {
            info!(service = %service, pid, "Proxy process running");
            return Ok(());
        }

        remove_file_if_exists(&pid_path).await?;
        let detail = tail_file(self.runner.as_ref(), &log, FAILURE_LOG_LINES)
            .await
            .unwrap_or_default();
        Err(TunnelError::service_start(
            service,
            if detail.is_empty() {
                format!("process {} exited", pid)
            } else {
                detail
            },
        ))
    }

    async fn stop(&self, id: &str) -> TunnelResult<()> {
        let pid_path = self.settings.pid_path(id);
        let Some(pid) = self.running_pid(id).await? else {
            remove_file_if_exists(&pid_path).await?;
            return Ok(());
        };

        self.runner
            .run_checked(&format!("{} {}", KILL_CMD, pid))
            .await
            .map_err(|e| TunnelError::teardown(STOP_STEP, e.to_string()))?;
        remove_file_if_exists(&pid_path).await?;
        info!(tunnel = %id, pid, "Proxy process stopped");
        Ok(())
    }

    async fn remove(&self, id: &str) -> TunnelResult<()> {
        if let Err(e) = self.stop(id).await {
            warn!(tunnel = %id, error = %e, "Stopping proxy before removal failed");
        }
        remove_file_if_exists(&self.settings.pid_path(id)).await?;
        remove_file_if_exists(&self.settings.config_path(id)).await?;
        remove_file_if_exists(&self.settings.log_path(id)).await?;
        info!(tunnel = %id, "Proxy artifacts removed");
        Ok(())
    }

    async fn status(&self, id: &str) -> TunnelResult<ServiceStatus> {
        let (running, detail) = match self.read_pid(id).await {
            None => (false, "not running".to_string()),
            Some(pid) if self.is_alive(pid).await? => (true, format!("running (pid {})", pid)),
            Some(pid) => (false, format!("exited (stale pid {})", pid)),
        };
        Ok(ServiceStatus {
            id: id.to_string(),
            running,
            detail,
        })
    }

    async fn list(&self) -> TunnelResult<Vec<String>> {
        let mut ids = BTreeSet::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.settings.config_dir).await else {
            return Ok(Vec::new());
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let id = name
                .to_str()
                .and_then(|n| n.strip_prefix("proxy-"))
                .and_then(|n| n.strip_suffix(".json"))
                .filter(|n| !n.is_empty());
            if let Some(id) = id {
                ids.insert(id.to_string());
            }
        }
        Ok(ids.into_iter().collect())
    }

    async fn logs(&self, id: &str, lines: usize) -> TunnelResult<String> {
        tail_file(self.runner.as_ref(), &self.settings.log_path(id), lines).await
    }

    async fn usage(&self, id: &str) -> TunnelResult<ServiceUsage> {
        match self.running_pid(id).await? {
            Some(pid) => process_usage(self.runner.as_ref(), id, pid).await,
            None => Ok(ServiceUsage::stopped(id)),
        }
    }
}
