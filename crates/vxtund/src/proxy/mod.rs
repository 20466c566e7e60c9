//! Proxy Service Manager
//!
//! One SOCKS5 proxy daemon runs per active tunnel. [`ServiceManager`] hides
//! how it is supervised: as a systemd unit ([`SystemdServiceManager`]) or as
//! a detached process tracked by a pid file ([`ProcessServiceManager`]).

mod config;
mod process;
mod systemd;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vxtun_common::shell::{shellquote, PS_CMD, TAIL_CMD};
use vxtun_common::{CommandRunner, TunnelError, TunnelResult};

use crate::commands::build_port_check_cmd;
use crate::strategy::strategy_for;
use crate::types::Tunnel;

pub use config::ProxyConfig;
pub use process::ProcessServiceManager;
pub use systemd::SystemdServiceManager;

/// Prefix shared by every proxy service name
pub const SERVICE_PREFIX: &str = "vxtun-proxy-";

/// Step label for proxy shutdown failures
pub const STOP_STEP: &str = "stop-proxy";

/// Supervisor used for proxy daemons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Supervisor {
    #[default]
    Systemd,
    Process,
}

/// Where proxy artifacts live and how the daemon is launched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub binary: PathBuf,
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
    pub unit_dir: PathBuf,
    pub run_dir: PathBuf,
    pub supervisor: Supervisor,
    /// Public listen address of the origin inbound
    pub listen_address: Ipv4Addr,
    /// Wait between launching the daemon and checking it is alive
    #[serde(with = "crate::config::duration_ms")]
    pub start_wait: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/local/bin/xray"),
            config_dir: PathBuf::from("/etc/vxtun"),
            log_dir: PathBuf::from("/var/log/vxtun"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            run_dir: PathBuf::from("/run/vxtun"),
            supervisor: Supervisor::Systemd,
            listen_address: Ipv4Addr::UNSPECIFIED,
            start_wait: Duration::from_secs(2),
        }
    }
}

impl ProxySettings {
    pub fn service_name(&self, id: &str) -> String {
        format!("{}{}", SERVICE_PREFIX, id)
    }

    pub fn config_path(&self, id: &str) -> PathBuf {
        self.config_dir.join(format!("proxy-{}.json", id))
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.log_dir.join(format!("proxy-{}.log", id))
    }

    pub fn pid_path(&self, id: &str) -> PathBuf {
        self.run_dir.join(format!("proxy-{}.pid", id))
    }

    /// Render the role-specific daemon configuration for `tunnel`
    pub fn render(&self, tunnel: &Tunnel) -> ProxyConfig {
        strategy_for(tunnel.role).proxy_config(tunnel, self.listen_address, &self.log_path(&tunnel.id))
    }
}

/// Liveness of one proxy service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: String,
    pub running: bool,
    pub detail: String,
}

/// Process resource usage of one proxy service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUsage {
    pub id: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub cpu_percent: Option<f64>,
    pub memory_kb: Option<u64>,
}

impl ServiceUsage {
    pub fn stopped(id: &str) -> Self {
        Self {
            id: id.to_string(),
            running: false,
            pid: None,
            cpu_percent: None,
            memory_kb: None,
        }
    }
}

/// Install and supervise per-tunnel proxy daemons
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Write the daemon configuration (and unit) for `tunnel`
    ///
    /// Fails with `ResourceConflict` before writing anything if the proxy
    /// port is already bound.
    async fn deploy(&self, tunnel: &Tunnel) -> TunnelResult<()>;

    /// Launch the daemon and confirm it stayed up
    async fn start(&self, id: &str) -> TunnelResult<()>;

    /// Stop the daemon; stopping a non-running service succeeds
    async fn stop(&self, id: &str) -> TunnelResult<()>;

    /// Stop and delete every artifact of the service
    async fn remove(&self, id: &str) -> TunnelResult<()>;

    async fn status(&self, id: &str) -> TunnelResult<ServiceStatus>;

    /// Tunnel ids of every deployed service
    async fn list(&self) -> TunnelResult<Vec<String>>;

    async fn logs(&self, id: &str, lines: usize) -> TunnelResult<String>;

    async fn usage(&self, id: &str) -> TunnelResult<ServiceUsage>;
}

/// Fail with `ResourceConflict` if anything listens on `port`
pub(crate) async fn ensure_port_free(runner: &dyn CommandRunner, port: u16) -> TunnelResult<()> {
    let listeners = runner.run_checked(&build_port_check_cmd(port)).await?;
    if listeners.trim().is_empty() {
        Ok(())
    } else {
        Err(TunnelError::conflict(
            "Proxy port",
            format!("{} is already bound: {}", port, listeners.lines().next().unwrap_or_default()),
        ))
    }
}

/// Write the rendered configuration, creating directories as needed
pub(crate) async fn write_config(settings: &ProxySettings, tunnel: &Tunnel) -> TunnelResult<PathBuf> {
    let body = settings.render(tunnel).to_json()?;
    let path = settings.config_path(&tunnel.id);
    for dir in [&settings.config_dir, &settings.log_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| TunnelError::storage(format!("create {}", dir.display()), e.to_string()))?;
    }
    tokio::fs::write(&path, body)
        .await
        .map_err(|e| TunnelError::storage(format!("write {}", path.display()), e.to_string()))?;
    debug!(path = %path.display(), "Proxy configuration written");
    Ok(path)
}

/// Delete `path`, treating absence as success
pub(crate) async fn remove_file_if_exists(path: &Path) -> TunnelResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TunnelError::storage(
            format!("remove {}", path.display()),
            e.to_string(),
        )),
    }
}

/// Last `lines` lines of a log file
pub(crate) async fn tail_file(runner: &dyn CommandRunner, path: &Path, lines: usize) -> TunnelResult<String> {
    runner
        .run_checked(&format!(
            "{} -n {} {}",
            TAIL_CMD,
            lines,
            shellquote(&path.display().to_string())
        ))
        .await
}

/// CPU and resident memory of `pid`, if the process exists
pub(crate) async fn process_usage(
    runner: &dyn CommandRunner,
    id: &str,
    pid: u32,
) -> TunnelResult<ServiceUsage> {
    let result = runner
        .run(&format!("{} -o %cpu=,rss= -p {}", PS_CMD, pid))
        .await?;
    if !result.success() || result.stdout.trim().is_empty() {
        return Ok(ServiceUsage::stopped(id));
    }

    let mut fields = result.stdout.split_whitespace();
    let cpu_percent = fields.next().and_then(|v| v.parse::<f64>().ok());
    let memory_kb = fields.next().and_then(|v| v.parse::<u64>().ok());

    Ok(ServiceUsage {
        id: id.to_string(),
        running: true,
        pid: Some(pid),
        cpu_percent,
        memory_kb,
    })
}
