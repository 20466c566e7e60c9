//! Host identity: platform and privilege checks.
//!
//! Provisioning refuses to touch the host unless it runs on Linux with an
//! effective uid of 0. The checks are behind [`HostIdentity`] so tests can
//! simulate unprivileged or non-Linux hosts.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::error::{TunnelError, TunnelResult};
use crate::shell::{CommandRunner, ID_CMD};

/// Platform name required for provisioning.
pub const LINUX: &str = "linux";

/// Answers "where am I running and as whom".
#[async_trait]
pub trait HostIdentity: Send + Sync {
    /// Returns the platform name (`std::env::consts::OS` style).
    fn platform(&self) -> &str;

    /// Returns true if the process runs with root privileges.
    async fn is_privileged(&self) -> TunnelResult<bool>;

    /// Returns true if the platform is Linux.
    fn is_linux(&self) -> bool {
        self.platform() == LINUX
    }
}

/// Fails with `PlatformUnsupported` or `PrivilegeRequired` unless the host
/// can run `operation`.
pub async fn ensure_privileged_linux(
    host: &dyn HostIdentity,
    operation: &str,
) -> TunnelResult<()> {
    if !host.is_linux() {
        return Err(TunnelError::platform_unsupported(operation, host.platform()));
    }
    if !host.is_privileged().await? {
        return Err(TunnelError::privilege_required(operation));
    }
    Ok(())
}

/// Fails with `PlatformUnsupported` unless the host is Linux.
pub fn ensure_linux(host: &dyn HostIdentity, operation: &str) -> TunnelResult<()> {
    if host.is_linux() {
        Ok(())
    } else {
        Err(TunnelError::platform_unsupported(operation, host.platform()))
    }
}

/// The machine this process runs on.
///
/// The privilege check runs `id -u` once and caches the answer.
pub struct LocalHost {
    runner: Arc<dyn CommandRunner>,
    privileged: OnceCell<bool>,
}

impl LocalHost {
    /// Creates a host identity that queries through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            privileged: OnceCell::new(),
        }
    }
}

#[async_trait]
impl HostIdentity for LocalHost {
    fn platform(&self) -> &str {
        std::env::consts::OS
    }

    async fn is_privileged(&self) -> TunnelResult<bool> {
        if !self.is_linux() {
            return Ok(false);
        }
        let privileged = self
            .privileged
            .get_or_try_init(|| async {
                let result = self.runner.run(&format!("{} -u", ID_CMD)).await?;
                Ok::<_, TunnelError>(result.success() && result.stdout.trim() == "0")
            })
            .await?;
        Ok(*privileged)
    }
}
