//! Capstan agent binary.

use anyhow::{Context, Result};
use capstan_agent::{Cluster, ClusterSection};
use capstan_config::{Manager, SectionType};
use capstan_consensus::{MeshNetwork, RaftSection};
use capstan_core::Request;
use capstan_state::StateSection;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Capstan - a pin cluster agent
#[derive(Parser, Debug)]
#[command(name = "capstand")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the cluster configuration file
    #[arg(short, long, env = "CAPSTAND_CONFIG", default_value = "service.json")]
    config: String,

    /// Write a default configuration file and exit
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Capstan v{}", env!("CARGO_PKG_VERSION"));

    // Register every component configuration before loading the document.
    let manager = Manager::new();
    let cluster_section = ClusterSection::new();
    let raft_section = RaftSection::new();
    let state_section = StateSection::new();
    manager.register_component(SectionType::Cluster, cluster_section.clone());
    manager.register_component(SectionType::Consensus, raft_section.clone());
    manager.register_component(SectionType::State, state_section.clone());

    let config_path = Path::new(&args.config);

    if args.init {
        manager
            .set_defaults()
            .context("failed to generate default configuration")?;
        manager
            .save(Some(config_path))
            .context("failed to write configuration")?;
        tracing::info!(path = %config_path.display(), "default configuration written");
        return Ok(());
    }

    if !config_path.exists() {
        anyhow::bail!(
            "no configuration at {}.\n\n\
             Create one with: capstand --init --config {}\n\
             Set CAPSTAND_CONFIG to change the default path.",
            config_path.display(),
            config_path.display()
        );
    }

    tracing::info!(path = %config_path.display(), "loading configuration");
    manager
        .load_from_file_and_env(config_path)
        .await
        .context("failed to load configuration")?;

    let cluster_config = cluster_section.current();
    let raft_config = raft_section.current();
    let state = capstan_state::from_config(&state_section.current());

    // In-process transport. A networked deployment swaps in a transport
    // speaking the cluster's secure channel; the consensus engine only sees
    // the PeerTransport contract.
    let network = MeshNetwork::new();
    let (transport, inbound) = network.join(cluster_config.id);

    let cluster = Arc::new(
        Cluster::new(
            &cluster_config,
            &raft_config,
            state,
            Arc::new(transport),
            inbound,
            Some(manager.clone()),
        )
        .context("failed to start cluster agent")?,
    );
    tracing::info!(
        peer = %cluster.id(),
        listen = %cluster_config.listen_address,
        peers = cluster_config.peers.len(),
        "cluster agent ready"
    );

    // The pin tracker and IPFS connector are external collaborators; the
    // bare agent drains the request stream and reports it.
    let mut requests = cluster
        .requests()
        .context("request stream already taken")?;
    let consumer = tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            match &request {
                Request::Track(cid) => tracing::info!(cid = %cid, "track requested"),
                Request::Untrack(cid) => tracing::info!(cid = %cid, "untrack requested"),
                Request::LocalSync => tracing::info!("local sync requested"),
                other => tracing::debug!(kind = other.tag(), "request observed"),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    cluster.shutdown().await.context("shutdown failed")?;
    consumer.abort();
    Ok(())
}
