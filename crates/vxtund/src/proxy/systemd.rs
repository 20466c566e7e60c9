//! Proxy supervision through systemd units

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use vxtun_common::shell::{shellquote, JOURNALCTL_CMD, SYSTEMCTL_CMD};
use vxtun_common::{CommandRunner, TunnelError, TunnelResult};

use super::{
    ensure_port_free, process_usage, remove_file_if_exists, tail_file, write_config, ProxySettings,
    ServiceManager, ServiceStatus, ServiceUsage, SERVICE_PREFIX, STOP_STEP,
};
use crate::types::Tunnel;

const UNIT_SUFFIX: &str = ".service";

fn systemctl(verb: &str, unit: &str) -> String {
    format!("{} {} {}", SYSTEMCTL_CMD, verb, shellquote(unit))
}

/// One `vxtun-proxy-<id>.service` unit per tunnel
pub struct SystemdServiceManager {
    runner: Arc<dyn CommandRunner>,
    settings: ProxySettings,
}

impl SystemdServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: ProxySettings) -> Self {
        Self { runner, settings }
    }

    pub fn unit_name(&self, id: &str) -> String {
        format!("{}{}", self.settings.service_name(id), UNIT_SUFFIX)
    }

    fn unit_path(&self, id: &str) -> PathBuf {
        self.settings.unit_dir.join(self.unit_name(id))
    }

    fn render_unit(&self, id: &str) -> String {
        let config = self.settings.config_path(id);
        let log = self.settings.log_path(id);
        format!(
            "[Unit]\n\
             Description=vxtun SOCKS5 proxy for tunnel {id}\n\
             After=network-online.target\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={binary} run -c {config}\n\
             Restart=on-failure\n\
             RestartSec=3\n\
             StandardOutput=append:{log}\n\
             StandardError=append:{log}\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            id = id,
            binary = self.settings.binary.display(),
            config = config.display(),
            log = log.display(),
        )
    }

    async fn daemon_reload(&self) -> TunnelResult<()> {
        self.runner
            .run_checked(&format!("{} daemon-reload", SYSTEMCTL_CMD))
            .await
            .map(|_| ())
    }

    async fn is_active(&self, id: &str) -> TunnelResult<(bool, String)> {
        let result = self
            .runner
            .run(&systemctl("is-active", &self.unit_name(id)))
            .await?;
        let state = result.stdout.trim().to_string();
        Ok((state == "active", state))
    }

    async fn main_pid(&self, id: &str) -> TunnelResult<Option<u32>> {
        let output = self
            .runner
            .run_checked(&format!(
                "{} show -p MainPID --value {}",
                SYSTEMCTL_CMD,
                shellquote(&self.unit_name(id))
            ))
            .await?;
        Ok(output.trim().parse::<u32>().ok().filter(|pid| *pid != 0))
    }

    fn id_from_unit(unit: &str) -> Option<String> {
        unit.strip_prefix(SERVICE_PREFIX)
            .and_then(|rest| rest.strip_suffix(UNIT_SUFFIX))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    async fn deploy(&self, tunnel: &Tunnel) -> TunnelResult<()> {
        ensure_port_free(self.runner.as_ref(), tunnel.proxy_port).await?;
        write_config(&self.settings, tunnel).await?;

        let unit_path = self.unit_path(&tunnel.id);
        tokio::fs::create_dir_all(&self.settings.unit_dir)
            .await
            .map_err(|e| {
                TunnelError::storage(
                    format!("create {}", self.settings.unit_dir.display()),
                    e.to_string(),
                )
            })?;
        tokio::fs::write(&unit_path, self.render_unit(&tunnel.id))
            .await
            .map_err(|e| {
                TunnelError::storage(format!("write {}", unit_path.display()), e.to_string())
            })?;

        self.daemon_reload().await?;
        info!(tunnel = %tunnel.id, unit = %self.unit_name(&tunnel.id), "Proxy unit deployed");
        Ok(())
    }

    async fn start(&self, id: &str) -> TunnelResult<()> {
        let unit = self.unit_name(id);
        self.runner
            .run_checked(&systemctl("start", &unit))
            .await
            .map_err(|e| TunnelError::service_start(&unit, e.to_string()))?;

        tokio::time::sleep(self.settings.start_wait).await;

        let (active, state) = self.is_active(id).await?;
        if active {
            info!(unit = %unit, "Proxy unit running");
            return Ok(());
        }

        let status = self
            .runner
            .run(&format!(
                "{} status --no-pager -l {}",
                SYSTEMCTL_CMD,
                shellquote(&unit)
            ))
            .await?;
        let detail = match status.combined_output() {
            output if output.is_empty() => format!("unit is {}", state),
            output => output,
        };
        Err(TunnelError::service_start(unit, detail))
    }

    async fn stop(&self, id: &str) -> TunnelResult<()> {
        let unit = self.unit_name(id);
        let (active, state) = self.is_active(id).await?;
        if !active {
            debug!(unit = %unit, state = %state, "Proxy unit not running");
            return Ok(());
        }
        self.runner
            .run_checked(&systemctl("stop", &unit))
            .await
            .map_err(|e| TunnelError::teardown(STOP_STEP, e.to_string()))?;
        info!(unit = %unit, "Proxy unit stopped");
        Ok(())
    }

    async fn remove(&self, id: &str) -> TunnelResult<()> {
        if let Err(e) = self.stop(id).await {
            warn!(tunnel = %id, error = %e, "Stopping proxy before removal failed");
        }
        let unit = self.unit_name(id);
        if let Err(e) = self.runner.run_checked(&systemctl("disable", &unit)).await {
            debug!(unit = %unit, error = %e, "Unit was not enabled");
        }

        remove_file_if_exists(&self.unit_path(id)).await?;
        remove_file_if_exists(&self.settings.config_path(id)).await?;
        remove_file_if_exists(&self.settings.log_path(id)).await?;

        if let Err(e) = self.daemon_reload().await {
            warn!(error = %e, "daemon-reload after unit removal failed");
        }
        info!(unit = %unit, "Proxy unit removed");
        Ok(())
    }

    async fn status(&self, id: &str) -> TunnelResult<ServiceStatus> {
        let (running, state) = self.is_active(id).await?;
        Ok(ServiceStatus {
            id: id.to_string(),
            running,
            detail: if state.is_empty() { "unknown".to_string() } else { state },
        })
    }

    async fn list(&self) -> TunnelResult<Vec<String>> {
        let mut ids = BTreeSet::new();

        let listing = self
            .runner
            .run_checked(&format!(
                "{} list-units --all --plain --no-legend --type=service {}",
                SYSTEMCTL_CMD,
                shellquote(&format!("{}*", SERVICE_PREFIX))
            ))
            .await?;
        for line in listing.lines() {
            if let Some(id) = line.split_whitespace().next().and_then(Self::id_from_unit) {
                ids.insert(id);
            }
        }

        // Unit files that systemd has not loaded still count as deployed
        if let Ok(mut entries) = tokio::fs::read_dir(&self.settings.unit_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Some(id) = entry.file_name().to_str().and_then(Self::id_from_unit) {
                    ids.insert(id);
                }
            }
        }

        Ok(ids.into_iter().collect())
    }

    async fn logs(&self, id: &str, lines: usize) -> TunnelResult<String> {
        let journal = self
            .runner
            .run(&format!(
                "{} -u {} -n {} --no-pager",
                JOURNALCTL_CMD,
                shellquote(&self.unit_name(id)),
                lines
            ))
            .await?;
        if journal.success() && !journal.stdout.trim().is_empty() {
            return Ok(journal.stdout);
        }
        tail_file(self.runner.as_ref(), &self.settings.log_path(id), lines).await
    }

    async fn usage(&self, id: &str) -> TunnelResult<ServiceUsage> {
        match self.main_pid(id).await? {
            Some(pid) => process_usage(self.runner.as_ref(), id, pid).await,
            None => Ok(ServiceUsage::stopped(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::relay_tunnel;
    use std::time::Duration;
    use vxtun_common::ExecResult;
    use vxtun_test::{host_fixtures, service_fixtures, MockRunner};

    fn manager(runner: Arc<MockRunner>, dir: &std::path::Path) -> SystemdServiceManager {
        SystemdServiceManager::new(
            runner,
            ProxySettings {
                config_dir: dir.join("etc"),
                log_dir: dir.join("log"),
                unit_dir: dir.join("units"),
                start_wait: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_deploy_writes_config_and_unit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let mgr = manager(runner.clone(), dir.path());

        mgr.deploy(&relay_tunnel("a", 10001)).await.unwrap();

        let unit = std::fs::read_to_string(dir.path().join("units/vxtun-proxy-a.service")).unwrap();
        assert!(unit.contains("ExecStart=/usr/local/bin/xray run -c "));
        assert!(unit.contains("proxy-a.json"));
        assert!(dir.path().join("etc/proxy-a.json").exists());

        let verifier = runner.verifier();
        verifier.assert_ordered("sport = :1080", "daemon-reload").unwrap();
    }

    #[tokio::test]
    async fn test_deploy_port_conflict_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        host_fixtures::with_port_in_use(&runner, 1080);
        let mgr = manager(runner.clone(), dir.path());

        let err = mgr.deploy(&relay_tunnel("a", 10001)).await.unwrap_err();
        assert!(matches!(err, TunnelError::ResourceConflict { .. }));
        assert!(!dir.path().join("etc/proxy-a.json").exists());
        assert!(!dir.path().join("units").exists());
    }

    #[tokio::test]
    async fn test_start_confirms_active() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        service_fixtures::with_active_units(&runner);
        let mgr = manager(runner.clone(), dir.path());

        mgr.start("a").await.unwrap();
        runner
            .verifier()
            .assert_ordered("start \"vxtun-proxy-a.service\"", "is-active")
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_failure_carries_status_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        service_fixtures::with_failing_units(&runner, "bind: address already in use");
        let mgr = manager(runner.clone(), dir.path());

        match mgr.start("a").await {
            Err(TunnelError::ServiceStart { service, detail }) => {
                assert_eq!(service, "vxtun-proxy-a.service");
                assert!(detail.contains("address already in use"));
            }
            other => panic!("Expected ServiceStart, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_inactive_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.respond("is-active", ExecResult::failed(3, "inactive"));
        let mgr = manager(runner.clone(), dir.path());

        mgr.stop("a").await.unwrap();
        runner.verifier().assert_command_not_executed(" stop ").unwrap();
    }

    #[tokio::test]
    async fn test_remove_deletes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        service_fixtures::with_active_units(&runner);
        let mgr = manager(runner.clone(), dir.path());
        mgr.deploy(&relay_tunnel("a", 10001)).await.unwrap();

        mgr.remove("a").await.unwrap();

        assert!(!dir.path().join("units/vxtun-proxy-a.service").exists());
        assert!(!dir.path().join("etc/proxy-a.json").exists());
        let verifier = runner.verifier();
        verifier.assert_ordered(" stop ", " disable ").unwrap();
    }

    #[tokio::test]
    async fn test_list_merges_loaded_units_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        service_fixtures::with_units(&runner, &["vxtun-proxy-a.service", "vxtun-proxy-b.service"]);
        let mgr = manager(runner.clone(), dir.path());
        std::fs::create_dir_all(dir.path().join("units")).unwrap();
        std::fs::write(dir.path().join("units/vxtun-proxy-c.service"), "").unwrap();
        std::fs::write(dir.path().join("units/unrelated.service"), "").unwrap();

        assert_eq!(mgr.list().await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_logs_fall_back_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.respond("journalctl", ExecResult::ok("line 1\nline 2"));
        let mgr = manager(runner.clone(), dir.path());
        assert_eq!(mgr.logs("a", 50).await.unwrap(), "line 1\nline 2");

        runner.respond("journalctl", ExecResult::failed(1, "No journal files"));
        runner.respond("tail -n 50", ExecResult::ok("from file"));
        assert_eq!(mgr.logs("a", 50).await.unwrap(), "from file");
    }

    #[tokio::test]
    async fn test_usage_via_main_pid() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.respond("MainPID", ExecResult::ok("4242"));
        runner.respond("-p 4242", ExecResult::ok("0.3 10240"));
        let mgr = manager(runner.clone(), dir.path());

        let usage = mgr.usage("a").await.unwrap();
        assert_eq!(usage.pid, Some(4242));
        assert_eq!(usage.memory_kb, Some(10240));

        runner.respond("MainPID", ExecResult::ok("0"));
        assert!(!mgr.usage("a").await.unwrap().running);
    }
}
