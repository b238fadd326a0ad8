//! wgkube agent entry point

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use ipnet::Ipv4Net;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wgkube::inventory::KubeNodeInventory;
use wgkube::kernel::{NetlinkHandle, WireguardControl};
use wgkube::key::KeyStore;
use wgkube::reconciler::{
    self, CniConfigReconciler, IdentityReconciler, InterfaceReconciler, KeyReconciler,
    RouteReconciler, RECONCILE_INTERVAL,
};
use wgkube::{metrics, telemetry};

/// wgkube - WireGuard mesh overlay for Kubernetes nodes
#[derive(Parser, Debug)]
#[command(name = "wgkube", version, about, long_about = None)]
struct Cli {
    /// Name of the WireGuard link to use
    #[arg(long, default_value = wgkube::DEFAULT_INTERFACE)]
    interface: String,

    /// Name of the node this agent is running on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Path to the private key for WireGuard
    #[arg(long, default_value = "/etc/wireguard/wg-kube-key")]
    private_key: PathBuf,

    /// Directory the rendered CNI configs are written to
    #[arg(long, default_value = "/etc/cni/net.d/")]
    cni_config_path: PathBuf,

    /// Directory the CNI config templates are read from
    #[arg(long, default_value = "/cni-tpl/")]
    cni_tpl_path: PathBuf,

    /// Cluster-wide pod CIDR
    #[arg(long)]
    pod_cidr: Ipv4Net,

    /// WireGuard listening port
    #[arg(long, default_value_t = wgkube::DEFAULT_WIREGUARD_PORT)]
    wireguard_port: u16,

    /// Listen address for the telemetry http server
    #[arg(long, default_value = "127.0.0.1:8080")]
    telemetry_listen_address: SocketAddr,

    /// Log filter directive (e.g. "info" or "wgkube=debug")
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::try_new(&cli.log_level)
                .with_context(|| format!("invalid log level '{}'", cli.log_level))?,
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        interface = %cli.interface,
        node_name = %cli.node_name,
        "Starting wgkube"
    );

    let client = kube::Client::try_default()
        .await
        .context("unable to create a Kubernetes client")?;
    let inventory = Arc::new(KubeNodeInventory::new(client));
    let store = Arc::new(KeyStore::new());
    let links = Arc::new(NetlinkHandle::connect().context("unable to open a netlink connection")?);
    let wireguard = Arc::new(WireguardControl::new());

    let mut registry = prometheus_client::registry::Registry::default();
    metrics::register(&mut registry);
    let registry = Arc::new(registry);

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    {
        let registry = Arc::clone(&registry);
        let shutdown = shutdown.clone();
        let addr = cli.telemetry_listen_address;
        tasks.spawn(async move {
            if let Err(e) = telemetry::serve(addr, registry, shutdown).await {
                error!(error = %e, "Telemetry server failed");
            }
        });
    }

    let reconcilers: Vec<Arc<dyn reconciler::Reconciler>> = vec![
        Arc::new(KeyReconciler::new(cli.private_key.clone(), store.clone())),
        Arc::new(IdentityReconciler::new(
            inventory.clone(),
            store.clone(),
            cli.node_name.clone(),
            cli.wireguard_port,
        )),
        Arc::new(InterfaceReconciler::new(
            inventory.clone(),
            links.clone(),
            wireguard.clone(),
            store.clone(),
            cli.interface.clone(),
            cli.node_name.clone(),
            cli.wireguard_port,
        )),
        Arc::new(RouteReconciler::new(
            inventory.clone(),
            links.clone(),
            cli.interface.clone(),
            cli.node_name.clone(),
        )),
        Arc::new(CniConfigReconciler::new(
            inventory.clone(),
            links.clone(),
            cli.interface.clone(),
            cli.node_name.clone(),
            cli.pod_cidr,
            cli.cni_tpl_path.clone(),
            cli.cni_config_path.clone(),
        )),
    ];

    for r in reconcilers {
        tasks.spawn(reconciler::run(r, RECONCILE_INTERVAL, shutdown.clone()));
    }

    wait_for_signal().await;
    info!("Received shutdown signal, draining reconcilers");
    shutdown.cancel();

    while tasks.join_next().await.is_some() {}
    info!("Shutdown complete");

    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "Unable to install SIGTERM handler, falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
