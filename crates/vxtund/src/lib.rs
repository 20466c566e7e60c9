//! vxtund - VXLAN overlay tunnel lifecycle orchestrator
//!
//! vxtund links two hosts (an origin and a relay) with a point-to-point
//! VXLAN overlay and runs a SOCKS5 proxy on each end, handling:
//! - VNI and overlay address allocation
//! - Persistent tunnel registry with atomic writes
//! - Overlay interface, NAT and client route provisioning
//! - Per-tunnel proxy services under systemd or as plain processes
//! - Transfer descriptors for configuring the origin from the relay
//! - Fleet health checks, orphan cleanup and bulk restart

pub mod allocator;
pub mod commands;
pub mod config;
pub mod connectivity;
pub mod descriptor;
pub mod fleet;
pub mod orchestrator;
pub mod provisioner;
pub mod proxy;
pub mod registry;
pub mod strategy;
pub mod types;

#[cfg(test)]
mod fakes;

pub use allocator::{Allocation, Allocator};
pub use config::DaemonConfig;
pub use connectivity::{ConnectivityProbe, ConnectivityReport, HttpConnectivityProbe};
pub use descriptor::TransferDescriptor;
pub use fleet::Fleet;
pub use orchestrator::Orchestrator;
pub use provisioner::{LinuxProvisioner, NetworkProvisioner};
pub use proxy::{ProcessServiceManager, ServiceManager, SystemdServiceManager};
pub use registry::TunnelRegistry;
pub use types::{Role, Tunnel, TunnelStatus};
