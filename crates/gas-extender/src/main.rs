//! GPU-aware scheduler extender - card and tile placement for GPU pods

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gas_extender::cache::{KubeCache, KubePodPatcher};
use gas_extender::server::extender_router;
use gas_extender::{ExtenderConfig, GasExtender};

/// GPU-aware scheduling extender for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "gas-extender", version, about, long_about = None)]
struct Cli {
    /// Address to serve the extender endpoints on
    #[arg(long, default_value = "0.0.0.0:9001")]
    addr: SocketAddr,

    /// Resource name (without the gpu.intel.com/ prefix) to balance card
    /// selection by; empty disables balancing
    #[arg(long, default_value = "")]
    balanced_resource: String,

    /// Allow re-binding a pod that already carries a card assignment
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    allow_duplicates: bool,

    /// Namespace this extender runs in, used when binding args omit the
    /// pod namespace
    #[arg(long, default_value = "default")]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let config = ExtenderConfig {
        balanced_resource: cli.balanced_resource,
        allow_duplicates: cli.allow_duplicates,
        own_namespace: cli.namespace,
    };

    let cache = Arc::new(KubeCache::new(client.clone()));
    let patcher = Arc::new(KubePodPatcher::new(client));
    let extender = Arc::new(GasExtender::new(cache, patcher, config));

    let app = extender_router(extender);
    let listener = tokio::net::TcpListener::bind(cli.addr).await?;
    info!(addr = %cli.addr, "extender listening");

    axum::serve(listener, app).await?;

    Ok(())
}
