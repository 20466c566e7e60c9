//! Daemon configuration
//!
//! Loaded from an optional JSON file; every field has a default so a
//! partial document (or none at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vxtun_common::{TunnelError, TunnelResult};

use crate::allocator::{
    Allocator, DEFAULT_RANDOM_ATTEMPTS, DEFAULT_VNI_RANGE_END, DEFAULT_VNI_RANGE_START,
};
use crate::provisioner::ProvisionerSettings;
use crate::proxy::ProxySettings;

/// Default location of the registry document
pub const DEFAULT_REGISTRY_PATH: &str = "/var/lib/vxtun/tunnels.json";

/// Default echo endpoint for connectivity tests
pub const DEFAULT_CONNECTIVITY_ENDPOINT: &str = "http://httpbin.org/ip";

/// Serialize a [`Duration`] as integer milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorSettings {
    pub range_start: u32,
    pub range_end: u32,
    pub random_attempts: u32,
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        Self {
            range_start: DEFAULT_VNI_RANGE_START,
            range_end: DEFAULT_VNI_RANGE_END,
            random_attempts: DEFAULT_RANDOM_ATTEMPTS,
        }
    }
}

/// Delays and timeouts, all in milliseconds on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Pause after interface creation and removal
    #[serde(with = "duration_ms")]
    pub settle_delay: Duration,
    /// Peer proxy reachability probe bound; zero disables the probe
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
    /// Bound on one connectivity test request
    #[serde(with = "duration_ms")]
    pub connectivity_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
            connectivity_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub registry_path: PathBuf,
    pub proxy: ProxySettings,
    pub allocator: AllocatorSettings,
    pub timings: Timings,
    pub connectivity_endpoint: String,
    /// Fail origin start when the relay proxy does not answer the probe
    pub require_peer_reachable: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from(DEFAULT_REGISTRY_PATH),
            proxy: ProxySettings::default(),
            allocator: AllocatorSettings::default(),
            timings: Timings::default(),
            connectivity_endpoint: DEFAULT_CONNECTIVITY_ENDPOINT.to_string(),
            require_peer_reachable: false,
        }
    }
}

impl DaemonConfig {
    /// Load from `path`, or use defaults when no path is given
    pub async fn load(path: Option<&Path>) -> TunnelResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            TunnelError::storage(format!("read {}", path.display()), e.to_string())
        })?;
        let config = Self::from_json(&contents)?;
        tracing::debug!(path = %path.display(), "Loaded daemon configuration");
        Ok(config)
    }

    pub fn from_json(contents: &str) -> TunnelResult<Self> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| TunnelError::validation("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TunnelResult<()> {
        self.allocator()?;
        if self.connectivity_endpoint.trim().is_empty() {
            return Err(TunnelError::validation(
                "connectivity_endpoint",
                "must not be empty",
            ));
        }
        if self.timings.connectivity_timeout.is_zero() {
            return Err(TunnelError::validation(
                "connectivity_timeout",
                "must be positive",
            ));
        }
        Ok(())
    }

    pub fn allocator(&self) -> TunnelResult<Allocator> {
        Allocator::new(
            self.allocator.range_start,
            self.allocator.range_end,
            self.allocator.random_attempts,
        )
    }

    pub fn provisioner_settings(&self) -> ProvisionerSettings {
        ProvisionerSettings {
            settle_delay: self.timings.settle_delay,
            probe_timeout: Some(self.timings.probe_timeout).filter(|t| !t.is_zero()),
            require_peer_reachable: self.require_peer_reachable,
        }
    }
}
