//! Test fixtures for common provisioning scenarios
//!
//! Provides reusable host setups and endpoint parameters

use std::net::Ipv4Addr;

use vxtun_common::ExecResult;

use crate::MockRunner;

/// Routable address of the relay host used across scenarios
pub const RELAY_ADDRESS: Ipv4Addr = Ipv4Addr::new(5, 6, 7, 8);

/// Routable address of the origin host used across scenarios
pub const ORIGIN_ADDRESS: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

/// Host egress interface reported by the scripted routing table
pub const EGRESS_IFACE: &str = "eth0";

/// Host routing and socket fixtures
pub mod host_fixtures {
    use super::*;

    /// Script a host whose default route leaves through [`EGRESS_IFACE`]
    pub fn with_default_route(runner: &MockRunner) {
        runner.respond(
            "route show default",
            ExecResult::ok(format!("default via 192.168.1.1 dev {} proto dhcp", EGRESS_IFACE)),
        );
        runner.respond(
            "route get",
            ExecResult::ok(format!(
                "5.6.7.8 via 192.168.1.1 dev {} src 192.168.1.20 uid 0",
                EGRESS_IFACE
            )),
        );
    }

    /// Script a host where the given VXLAN interface does not exist yet
    ///
    /// Only the next existence check fails; later checks see the interface.
    pub fn with_absent_interface(runner: &MockRunner, ifname: &str) {
        runner.fail_once(
            format!("link show dev \"{}\"", ifname),
            format!("Device \"{}\" does not exist.", ifname),
        );
    }

    /// Script a host where the given VXLAN interface never exists
    pub fn without_interface(runner: &MockRunner, ifname: &str) {
        runner.fail(
            format!("link show dev \"{}\"", ifname),
            format!("Device \"{}\" does not exist.", ifname),
        );
    }

    /// Script a host with a listener already bound on `port`
    pub fn with_port_in_use(runner: &MockRunner, port: u16) {
        runner.respond(
            format!("sport = :{}", port),
            ExecResult::ok(format!("LISTEN 0 4096 0.0.0.0:{} 0.0.0.0:*", port)),
        );
    }
}

/// Proxy supervisor fixtures
pub mod service_fixtures {
    use super::*;

    /// Script systemd so every unit reports active after start
    pub fn with_active_units(runner: &MockRunner) {
        runner.respond("is-active", ExecResult::ok("active"));
    }

    /// Script systemd so every unit reports failed after start
    pub fn with_failing_units(runner: &MockRunner, detail: &str) {
        runner.respond(
            "is-active",
            ExecResult {
                exit_code: 3,
                stdout: "failed".to_string(),
                stderr: String::new(),
            },
        );
        runner.respond("status", ExecResult::failed(3, detail.to_string()));
    }

    /// Script the deployed unit list
    pub fn with_units(runner: &MockRunner, unit_names: &[&str]) {
        let listing = unit_names
            .iter()
            .map(|name| format!("{} loaded active running vxtun proxy", name))
            .collect::<Vec<_>>()
            .join("\n");
        runner.respond("list-units", ExecResult::ok(listing));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vxtun_common::CommandRunner;

    #[tokio::test]
    async fn test_default_route_fixture() {
        let runner = MockRunner::new();
        host_fixtures::with_default_route(&runner);

        let out = runner
            .run_checked("/sbin/ip route show default")
            .await
            .unwrap();
        assert!(out.contains("dev eth0"));
    }

    #[tokio::test]
    async fn test_absent_interface_fixture() {
        let runner = MockRunner::new();
        host_fixtures::with_absent_interface(&runner, "vxlan10001");

        let cmd = "/sbin/ip link show dev \"vxlan10001\"";
        assert!(!runner.run(cmd).await.unwrap().success());
        assert!(runner.run(cmd).await.unwrap().success());
    }
}
