//! vxtund command line entry point

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, error};
use vxtun_common::{CommandRunner, HostIdentity, LocalHost, ShellRunner};
use vxtund::proxy::Supervisor;
use vxtund::types::{ManualOrigin, OriginRequest, OriginSource, RelayRequest, TunnelPatch};
use vxtund::{
    DaemonConfig, Fleet, HttpConnectivityProbe, LinuxProvisioner, Orchestrator,
    ProcessServiceManager, ServiceManager, SystemdServiceManager, TunnelRegistry,
};

/// VXLAN overlay tunnel orchestrator
#[derive(Parser, Debug)]
#[command(name = "vxtund")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Registry document, overriding the configuration
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a relay tunnel and print its transfer descriptor
    CreateRelay {
        #[arg(long)]
        name: String,
        /// This host's routable address
        #[arg(long)]
        relay_address: Ipv4Addr,
        /// Routable address of the origin host
        #[arg(long)]
        origin_address: Ipv4Addr,
        #[arg(long)]
        tunnel_port: Option<u16>,
        #[arg(long)]
        proxy_port: Option<u16>,
    },
    /// Create an origin tunnel from a descriptor or explicit parameters
    CreateOrigin(CreateOriginArgs),
    /// List all tunnels
    List,
    /// Show one tunnel
    Get { id: String },
    /// Edit a tunnel's name, addresses or ports
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        origin_address: Option<Ipv4Addr>,
        #[arg(long)]
        relay_address: Option<Ipv4Addr>,
        #[arg(long)]
        tunnel_port: Option<u16>,
        #[arg(long)]
        proxy_port: Option<u16>,
    },
    /// Delete a tunnel, stopping it first if active
    Delete { id: String },
    /// Print the transfer descriptor of a relay tunnel
    Descriptor { id: String },
    Start { id: String },
    Stop { id: String },
    Restart { id: String },
    /// Test connectivity through an active origin tunnel
    Test { id: String },
    /// List deployed proxy services
    Services,
    /// Remove proxy services that no tunnel owns
    CleanupOrphans,
    /// Restart every active or errored tunnel
    RestartAll,
    /// Check interfaces and proxies of every tunnel
    HealthCheck,
    /// CPU and memory of every proxy service
    ResourceUsage,
    /// Show recent proxy log lines
    Logs {
        id: String,
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
    },
}

#[derive(ClapArgs, Debug)]
struct CreateOriginArgs {
    #[arg(long)]
    name: Option<String>,
    /// Encoded transfer descriptor exported by the relay
    #[arg(long, conflicts_with_all = ["relay_address", "vni", "origin_overlay_address", "relay_overlay_address"])]
    descriptor: Option<String>,
    #[arg(long)]
    relay_address: Option<Ipv4Addr>,
    #[arg(long)]
    origin_address: Option<Ipv4Addr>,
    #[arg(long)]
    tunnel_port: Option<u16>,
    #[arg(long)]
    proxy_port: Option<u16>,
    #[arg(long)]
    vni: Option<u32>,
    #[arg(long)]
    origin_overlay_address: Option<Ipv4Addr>,
    #[arg(long)]
    relay_overlay_address: Option<Ipv4Addr>,
}

impl From<CreateOriginArgs> for OriginRequest {
    fn from(args: CreateOriginArgs) -> Self {
        let source = match args.descriptor {
            Some(code) => OriginSource::Descriptor(code),
            None => OriginSource::Manual(ManualOrigin {
                relay_address: args.relay_address,
                origin_address: args.origin_address,
                tunnel_port: args.tunnel_port,
                proxy_port: args.proxy_port,
                vni: args.vni,
                origin_overlay_address: args.origin_overlay_address,
                relay_overlay_address: args.relay_overlay_address,
            }),
        };
        OriginRequest {
            name: args.name,
            source,
        }
    }
}

#[derive(Serialize)]
struct CreatedRelay<'a> {
    tunnel: &'a vxtund::Tunnel,
    descriptor: String,
}

fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("failed to encode output")?);
    Ok(())
}

async fn build_fleet(args: &Args) -> Result<Fleet> {
    let mut config = DaemonConfig::load(args.config.as_deref())
        .await
        .context("failed to load configuration")?;
    if let Some(path) = &args.registry {
        config.registry_path = path.clone();
    }
    debug!(registry = %config.registry_path.display(), supervisor = ?config.proxy.supervisor, "Configuration loaded");

    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
    let host: Arc<dyn HostIdentity> = Arc::new(LocalHost::new(runner.clone()));

    let registry = TunnelRegistry::open(&config.registry_path)
        .await
        .with_context(|| format!("failed to open registry {}", config.registry_path.display()))?;
    let provisioner = LinuxProvisioner::new(runner.clone(), host, config.provisioner_settings());
    let services: Arc<dyn ServiceManager> = match config.proxy.supervisor {
        Supervisor::Systemd => Arc::new(SystemdServiceManager::new(runner, config.proxy.clone())),
        Supervisor::Process => Arc::new(ProcessServiceManager::new(runner, config.proxy.clone())),
    };

    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        config.allocator()?,
        Arc::new(provisioner),
        services,
    );
    let probe = HttpConnectivityProbe::new(
        config.connectivity_endpoint.clone(),
        config.timings.connectivity_timeout,
    );
    Ok(Fleet::new(
        Arc::new(orchestrator),
        Arc::new(probe),
        config.proxy.listen_address,
    ))
}

async fn run(args: Args) -> Result<ExitCode> {
    let fleet = build_fleet(&args).await?;
    let tunnels = fleet.orchestrator();

    match args.command {
        Command::CreateRelay {
            name,
            relay_address,
            origin_address,
            tunnel_port,
            proxy_port,
        } => {
            let tunnel = tunnels
                .create_relay(RelayRequest {
                    name,
                    relay_address,
                    origin_address,
                    tunnel_port,
                    proxy_port,
                })
                .await
                .context("failed to create relay tunnel")?;
            let descriptor = tunnels.descriptor(&tunnel.id).await?;
            print_json(&CreatedRelay {
                tunnel: &tunnel,
                descriptor,
            })?;
        }
        Command::CreateOrigin(origin) => {
            let tunnel = tunnels
                .create_origin(origin.into())
                .await
                .context("failed to create origin tunnel")?;
            print_json(&tunnel)?;
        }
        Command::List => print_json(&tunnels.list().await)?,
        Command::Get { id } => print_json(&tunnels.get(&id).await?)?,
        Command::Update {
            id,
            name,
            origin_address,
            relay_address,
            tunnel_port,
            proxy_port,
        } => {
            let patch = TunnelPatch {
                name,
                origin_address,
                relay_address,
                tunnel_port,
                proxy_port,
            };
            let tunnel = tunnels
                .update(&id, patch)
                .await
                .with_context(|| format!("failed to update tunnel {}", id))?;
            print_json(&tunnel)?;
        }
        Command::Delete { id } => {
            let tunnel = tunnels
                .delete(&id)
                .await
                .with_context(|| format!("failed to delete tunnel {}", id))?;
            print_json(&tunnel)?;
        }
        Command::Descriptor { id } => println!("{}", tunnels.descriptor(&id).await?),
        Command::Start { id } => {
            let tunnel = tunnels
                .start(&id)
                .await
                .with_context(|| format!("failed to start tunnel {}", id))?;
            print_json(&tunnel)?;
        }
        Command::Stop { id } => {
            let tunnel = tunnels
                .stop(&id)
                .await
                .with_context(|| format!("failed to stop tunnel {}", id))?;
            print_json(&tunnel)?;
        }
        Command::Restart { id } => {
            let tunnel = tunnels
                .restart(&id)
                .await
                .with_context(|| format!("failed to restart tunnel {}", id))?;
            print_json(&tunnel)?;
        }
        Command::Test { id } => {
            let report = fleet.test_connectivity(&id).await?;
            print_json(&report)?;
            if !report.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Services => print_json(&fleet.list_services().await?)?,
        Command::CleanupOrphans => {
            let report = fleet.cleanup_orphans().await?;
            print_json(&report)?;
            if !report.failed.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::RestartAll => {
            let report = fleet.restart_all().await;
            print_json(&report)?;
            if !report.failed.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::HealthCheck => {
            let entries = fleet.health_check().await;
            print_json(&entries)?;
            if entries.iter().any(|e| !e.healthy) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::ResourceUsage => print_json(&fleet.resource_usage().await)?,
        Command::Logs { id, lines } => println!("{}", fleet.logs(&id, lines).await?),
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
