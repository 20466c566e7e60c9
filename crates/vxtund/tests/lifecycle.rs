//! End-to-end lifecycle tests
//!
//! Drive the Linux provisioner and systemd service manager against a
//! scripted command runner, with the registry and proxy artifacts in a
//! temporary directory.

use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};
use vxtun_common::{ExecResult, TunnelError};
use vxtun_test::{
    host_fixtures, service_fixtures, FakeHost, MockRunner, ORIGIN_ADDRESS, RELAY_ADDRESS,
};
use vxtund::provisioner::ProvisionerSettings;
use vxtund::proxy::ProxySettings;
use vxtund::types::{ManualOrigin, OriginRequest, OriginSource, RelayRequest};
use vxtund::{
    Allocator, LinuxProvisioner, Orchestrator, SystemdServiceManager, TunnelRegistry, TunnelStatus,
};

struct Env {
    runner: Arc<MockRunner>,
    orchestrator: Arc<Orchestrator>,
    dir: tempfile::TempDir,
}

impl Env {
    fn registry_path(dir: &Path) -> std::path::PathBuf {
        dir.join("tunnels.json")
    }

    async fn new(settings: ProvisionerSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        host_fixtures::with_default_route(&runner);

        let registry = TunnelRegistry::open(Self::registry_path(dir.path()))
            .await
            .unwrap();
        let provisioner = LinuxProvisioner::new(
            runner.clone(),
            Arc::new(FakeHost::linux_root()),
            settings,
        );
        let services = SystemdServiceManager::new(
            runner.clone(),
            ProxySettings {
                config_dir: dir.path().join("etc"),
                log_dir: dir.path().join("log"),
                unit_dir: dir.path().join("units"),
                start_wait: Duration::ZERO,
                ..Default::default()
            },
        );
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(registry),
            Allocator::default(),
            Arc::new(provisioner),
            Arc::new(services),
        ));
        Self {
            runner,
            orchestrator,
            dir,
        }
    }

    async fn standard() -> Self {
        Self::new(ProvisionerSettings {
            settle_delay: Duration::ZERO,
            probe_timeout: None,
            require_peer_reachable: false,
        })
        .await
    }
}

fn relay_request() -> RelayRequest {
    RelayRequest {
        name: "fra-1".to_string(),
        relay_address: RELAY_ADDRESS,
        origin_address: ORIGIN_ADDRESS,
        tunnel_port: None,
        proxy_port: None,
    }
}

#[tokio::test]
async fn test_relay_full_lifecycle() {
    let env = Env::standard().await;
    service_fixtures::with_active_units(&env.runner);
    env.runner.fail(" -C ", "iptables: Bad rule (does a matching rule exist in that chain?).");

    let tunnel = env.orchestrator.create_relay(relay_request()).await.unwrap();
    let ifname = format!("vxlan{}", tunnel.vni);
    host_fixtures::with_absent_interface(&env.runner, &ifname);

    let started = env.orchestrator.start(&tunnel.id).await.unwrap();
    assert_eq!(started.status, TunnelStatus::Active);

    let verifier = env.runner.verifier();
    assert_ok!(verifier.assert_command_executed(&format!(
        "/sbin/ip link add \"{}\" type vxlan id {} remote \"1.2.3.4\" dstport 4789 dev \"eth0\"",
        ifname, tunnel.vni
    )));
    assert_ok!(verifier.assert_command_executed(&format!(
        "/sbin/ip addr add \"{}/30\" dev \"{}\"",
        tunnel.relay_overlay_address, ifname
    )));
    assert_ok!(verifier.assert_ordered("link add", "daemon-reload"));
    assert_ok!(verifier.assert_ordered("is-active", "net.ipv4.ip_forward=1"));
    assert_eq!(verifier.count_matching("iptables -t nat -A POSTROUTING"), 1);
    assert_eq!(verifier.count_matching("iptables -t filter -A FORWARD"), 2);

    let config = std::fs::read_to_string(
        env.dir.path().join(format!("etc/proxy-{}.json", tunnel.id)),
    )
    .unwrap();
    assert!(config.contains(&tunnel.relay_overlay_address.to_string()));

    env.runner.clear_commands();
    let stopped = env.orchestrator.stop(&tunnel.id).await.unwrap();
    assert_eq!(stopped.status, TunnelStatus::Inactive);
    let verifier = env.runner.verifier();
    assert_ok!(verifier.assert_ordered(" stop ", "link del"));
    assert_ok!(verifier.assert_command_executed(&format!("/sbin/ip link del dev \"{}\"", ifname)));

    env.orchestrator.delete(&tunnel.id).await.unwrap();
    assert!(!env
        .dir
        .path()
        .join(format!("units/vxtun-proxy-{}.service", tunnel.id))
        .exists());

    let reopened = TunnelRegistry::open(Env::registry_path(env.dir.path()))
        .await
        .unwrap();
    assert!(reopened.list().await.is_empty());
}

#[tokio::test]
async fn test_registry_survives_reopen() {
    let env = Env::standard().await;
    let tunnel = env.orchestrator.create_relay(relay_request()).await.unwrap();

    let reopened = TunnelRegistry::open(Env::registry_path(env.dir.path()))
        .await
        .unwrap();
    assert_eq!(reopened.get(&tunnel.id).await.unwrap(), tunnel);
}

#[tokio::test]
async fn test_service_start_failure_removes_interface() {
    let env = Env::standard().await;
    service_fixtures::with_failing_units(&env.runner, "xray: bind: address already in use");

    let tunnel = env.orchestrator.create_relay(relay_request()).await.unwrap();
    let ifname = format!("vxlan{}", tunnel.vni);
    host_fixtures::with_absent_interface(&env.runner, &ifname);

    let err = assert_err!(env.orchestrator.start(&tunnel.id).await);
    assert!(matches!(err, TunnelError::ServiceStart { .. }));

    let verifier = env.runner.verifier();
    assert_ok!(verifier.assert_ordered("systemctl start", "link del"));
    assert_ok!(verifier.assert_command_not_executed("net.ipv4.ip_forward"));

    let record = env.orchestrator.get(&tunnel.id).await.unwrap();
    assert_eq!(record.status, TunnelStatus::Error);
    let message = record.error_message.unwrap();
    assert!(message.starts_with("start-proxy failed"));
    assert!(message.contains("address already in use"));
}

#[tokio::test]
async fn test_existing_interface_is_a_conflict() {
    let env = Env::standard().await;
    let tunnel = env.orchestrator.create_relay(relay_request()).await.unwrap();

    // Every link query succeeds: the interface already exists
    let err = assert_err!(env.orchestrator.start(&tunnel.id).await);
    assert!(matches!(err, TunnelError::ResourceConflict { .. }));
    assert_ok!(env.runner.verifier().assert_command_not_executed("link add"));
    assert_ok!(env.runner.verifier().assert_command_not_executed("link del"));
}

#[tokio::test]
async fn test_unprivileged_host_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let orchestrator = Orchestrator::new(
        Arc::new(TunnelRegistry::in_memory()),
        Allocator::default(),
        Arc::new(LinuxProvisioner::new(
            runner.clone(),
            Arc::new(FakeHost::linux_user()),
            ProvisionerSettings::default(),
        )),
        Arc::new(SystemdServiceManager::new(
            runner.clone(),
            ProxySettings {
                config_dir: dir.path().join("etc"),
                unit_dir: dir.path().join("units"),
                ..Default::default()
            },
        )),
    );

    let tunnel = orchestrator.create_relay(relay_request()).await.unwrap();
    let err = assert_err!(orchestrator.start(&tunnel.id).await);
    assert!(matches!(err, TunnelError::PrivilegeRequired { .. }));
    assert!(runner.commands().is_empty());
    assert_eq!(
        orchestrator.get(&tunnel.id).await.unwrap().status,
        TunnelStatus::Inactive
    );
}

#[tokio::test]
async fn test_origin_from_descriptor_lifecycle() {
    let relay_env = Env::standard().await;
    let relay = relay_env
        .orchestrator
        .create_relay(relay_request())
        .await
        .unwrap();
    let code = relay_env.orchestrator.descriptor(&relay.id).await.unwrap();

    let env = Env::standard().await;
    service_fixtures::with_active_units(&env.runner);
    let origin = env
        .orchestrator
        .create_origin(OriginRequest {
            name: None,
            source: OriginSource::Descriptor(code),
        })
        .await
        .unwrap();
    assert_eq!(origin.vni, relay.vni);

    let ifname = format!("vxlan{}", origin.vni);
    host_fixtures::with_absent_interface(&env.runner, &ifname);
    env.orchestrator.start(&origin.id).await.unwrap();

    let verifier = env.runner.verifier();
    assert_ok!(verifier.assert_command_executed(&format!(
        "remote \"{}\" dstport 4789",
        RELAY_ADDRESS
    )));
    assert_ok!(verifier.assert_command_executed(&format!(
        "/sbin/ip route replace \"{}/32\" dev \"{}\"",
        origin.relay_overlay_address, ifname
    )));
    assert_ok!(verifier.assert_command_not_executed("iptables"));
}

#[tokio::test]
async fn test_strict_probe_failure_rolls_back_origin() {
    let env = Env::new(ProvisionerSettings {
        settle_delay: Duration::ZERO,
        probe_timeout: Some(Duration::from_millis(500)),
        require_peer_reachable: true,
    })
    .await;
    service_fixtures::with_active_units(&env.runner);

    // A loopback port nobody listens on stands in for an unreachable relay proxy
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let origin = env
        .orchestrator
        .create_origin(OriginRequest {
            name: Some("unreachable".to_string()),
            source: OriginSource::Manual(ManualOrigin {
                relay_address: Some(RELAY_ADDRESS),
                proxy_port: Some(closed_port),
                vni: Some(10001),
                relay_overlay_address: Some(Ipv4Addr::new(127, 0, 0, 1)),
                origin_overlay_address: Some(Ipv4Addr::new(127, 0, 0, 2)),
                ..Default::default()
            }),
        })
        .await
        .unwrap();
    host_fixtures::with_absent_interface(&env.runner, "vxlan10001");

    let err = assert_err!(env.orchestrator.start(&origin.id).await);
    assert!(matches!(err, TunnelError::Provisioning { .. }));

    let record = env.orchestrator.get(&origin.id).await.unwrap();
    assert_eq!(record.status, TunnelStatus::Error);
    assert!(record.error_message.unwrap().starts_with("client-route failed"));

    let verifier = env.runner.verifier();
    assert_ok!(verifier.assert_ordered("route replace \"127.0.0.1/32\"", " stop "));
    assert_ok!(verifier.assert_command_executed("/sbin/ip link del dev \"vxlan10001\""));
}

#[tokio::test]
async fn test_concurrent_creates_persist_distinct_vnis() {
    let env = Env::standard().await;
    let mut handles = Vec::new();
    for i in 0..10 {
        let orchestrator = env.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            let mut request = relay_request();
            request.name = format!("relay-{}", i);
            orchestrator.create_relay(request).await
        }));
    }
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    let reopened = TunnelRegistry::open(Env::registry_path(env.dir.path()))
        .await
        .unwrap();
    let tunnels = reopened.list().await;
    assert_eq!(tunnels.len(), 10);

    let mut vnis: Vec<_> = tunnels.iter().map(|t| t.vni).collect();
    vnis.sort_unstable();
    vnis.dedup();
    assert_eq!(vnis.len(), 10);
}

#[tokio::test]
async fn test_port_in_use_fails_before_writing_config() {
    let env = Env::standard().await;
    let tunnel = env.orchestrator.create_relay(relay_request()).await.unwrap();
    host_fixtures::with_absent_interface(&env.runner, &format!("vxlan{}", tunnel.vni));
    host_fixtures::with_port_in_use(&env.runner, 1080);

    let err = assert_err!(env.orchestrator.start(&tunnel.id).await);
    assert!(matches!(err, TunnelError::ResourceConflict { .. }));
    assert!(!env
        .dir
        .path()
        .join(format!("etc/proxy-{}.json", tunnel.id))
        .exists());

    let record = env.orchestrator.get(&tunnel.id).await.unwrap();
    assert!(record.error_message.unwrap().starts_with("deploy-proxy failed"));
    assert_ok!(env.runner.verifier().assert_command_executed("link del"));

    // Rollback already removed the interface
    env.runner
        .respond("link show", ExecResult::failed(1, "Device does not exist."));
    assert_ok!(env.orchestrator.stop(&tunnel.id).await);
}
