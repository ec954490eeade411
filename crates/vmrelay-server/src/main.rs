//! VM relay controller
//!
//! This binary provisions lightweight VMs on the local host and exposes them
//! to the internet through a reverse tunnel client, serving a management API
//! over HTTP.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmrelay_api::{ApiServer, ApiServerConfig};
use vmrelay_core::{
    AllocationCoordinator, BackgroundRunner, ControllerConfig, SecurityGroupClient,
    TunnelSupervisor, VagrantProvisioner,
};
use vmrelay_core::reconciler::ConfigReconciler;
use vmrelay_db::VmStore;

/// VM relay controller - provisions VMs and exposes them through a reverse tunnel
#[derive(Parser, Debug)]
#[command(name = "vmrelay")]
#[command(about = "Run the VM provisioning and tunnel relay controller", long_about = None)]
#[command(version)]
struct Cli {
    /// API server bind address
    #[arg(long, env = "VMRELAY_BIND_ADDR", default_value = "127.0.0.1:8000")]
    bind_addr: SocketAddr,

    /// Database URL
    /// SQLite file: "sqlite://./vmrelay.db?mode=rwc"
    /// In-memory SQLite: "sqlite::memory:" (data lost on restart)
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./vmrelay.db?mode=rwc")]
    database_url: String,

    /// Path to the reverse tunnel client executable
    #[arg(long, env = "VMRELAY_TUNNEL_CLIENT", default_value = "/usr/local/bin/frpc")]
    tunnel_client: PathBuf,

    /// Path to the tunnel client configuration file
    #[arg(long, env = "VMRELAY_TUNNEL_CONFIG", default_value = "./frpc.toml")]
    tunnel_config: PathBuf,

    /// Directory holding one subdirectory per VM
    #[arg(long, env = "VMRELAY_VMS_DIR", default_value = "./vms")]
    vms_dir: PathBuf,

    /// Directory holding SSH keypairs
    #[arg(long, env = "VMRELAY_SSH_DIR", default_value = "./ssh")]
    ssh_dir: PathBuf,

    /// Public hostname clients connect to (the tunnel server's address)
    #[arg(long, env = "VMRELAY_PUBLIC_HOST", default_value = "127.0.0.1")]
    public_host: String,

    /// Base URL of the firewall API
    #[arg(long, env = "VMRELAY_FIREWALL_ENDPOINT")]
    firewall_endpoint: Option<String>,

    /// Security group ID for firewall rules
    #[arg(long, env = "VMRELAY_FIREWALL_GROUP", default_value = "default")]
    firewall_group: String,

    /// Bearer token for the firewall API
    #[arg(long, env = "VMRELAY_FIREWALL_TOKEN")]
    firewall_token: Option<String>,

    /// Private IP pool prefix
    #[arg(long, env = "VMRELAY_IP_BASE", default_value = "192.168.56.")]
    ip_base: String,

    /// First host suffix of the private IP pool
    #[arg(long, env = "VMRELAY_IP_START", default_value = "11")]
    ip_start: u32,

    /// Last host suffix of the private IP pool (inclusive)
    #[arg(long, env = "VMRELAY_IP_END", default_value = "250")]
    ip_end: u32,

    /// First public tunnel port
    #[arg(long, env = "VMRELAY_PORT_START", default_value = "2222")]
    port_start: u16,

    /// Last public tunnel port (inclusive)
    #[arg(long, env = "VMRELAY_PORT_END", default_value = "2999")]
    port_end: u16,

    /// Delay in milliseconds before a scheduled tunnel reload
    #[arg(long, env = "VMRELAY_RELOAD_DELAY_MS", default_value = "1000")]
    reload_delay_ms: u64,

    /// Timeout in seconds for provisioning tool invocations (0 disables)
    #[arg(long, env = "VMRELAY_PROVISION_TIMEOUT", default_value = "600")]
    provision_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    info!("Starting VM relay controller");
    info!("API endpoint: {}", cli.bind_addr);
    info!("Public host: {}", cli.public_host);

    if !cli.tunnel_client.exists() {
        anyhow::bail!(
            "tunnel client executable not found at {}",
            cli.tunnel_client.display()
        );
    }
    if !cli.tunnel_config.exists() {
        anyhow::bail!(
            "tunnel config not found at {}",
            cli.tunnel_config.display()
        );
    }

    tokio::fs::create_dir_all(&cli.vms_dir).await?;
    tokio::fs::create_dir_all(&cli.ssh_dir).await?;

    info!("Connecting to database: {}", cli.database_url);
    let db = vmrelay_db::connect(&cli.database_url).await?;
    vmrelay_db::migrate(&db)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run database migrations: {}", e))?;

    // Launch the tunnel client under our supervision
    let supervisor = Arc::new(TunnelSupervisor::new(&cli.tunnel_client, &cli.tunnel_config));
    supervisor.start().await?;
    info!("Tunnel client started: {}", cli.tunnel_client.display());

    let firewall = {
        let endpoint = cli
            .firewall_endpoint
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:9000".to_string());
        let mut client = SecurityGroupClient::new(endpoint, cli.firewall_group.clone());
        if let Some(token) = cli.firewall_token.clone() {
            client = client.with_api_token(token);
        }
        Arc::new(client)
    };

    let mut provisioner = VagrantProvisioner::new();
    if cli.provision_timeout > 0 {
        provisioner = provisioner.with_timeout(Duration::from_secs(cli.provision_timeout));
    }

    let config = ControllerConfig {
        vms_dir: cli.vms_dir.clone(),
        ssh_dir: cli.ssh_dir.clone(),
        public_host: cli.public_host.clone(),
        ip_base: cli.ip_base.clone(),
        ip_start: cli.ip_start,
        ip_end: cli.ip_end,
        port_start: cli.port_start,
        port_end: cli.port_end,
        reload_delay: Duration::from_millis(cli.reload_delay_ms),
    };

    let coordinator = AllocationCoordinator::new(
        config,
        VmStore::new(db),
        ConfigReconciler::new(&cli.tunnel_config),
        firewall,
        supervisor.clone(),
        Arc::new(provisioner),
        BackgroundRunner::spawning(),
    );
    info!(
        "Coordinator ready (IPs {}{}-{}{}, ports {}-{})",
        cli.ip_base, cli.ip_start, cli.ip_base, cli.ip_end, cli.port_start, cli.port_end
    );

    let api_server = ApiServer::new(
        ApiServerConfig {
            bind_addr: cli.bind_addr,
            enable_cors: true,
        },
        coordinator,
    );

    let api_handle = tokio::spawn(async move {
        if let Err(err) = api_server.start().await {
            error!("API server error: {}", err);
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    api_handle.abort();
    supervisor.stop().await?;
    info!("VM relay controller stopped");

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
