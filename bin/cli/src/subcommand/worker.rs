use std::sync::Arc;

use clap::Parser;
use config::Config;
use error_stack::{IntoReport, Result, ResultExt};
use net::{Node, NodeAddress};
use rmi::{BlockManager, ExecutorService, TaskRegistry};

use crate::error::CliError;

/// Arguments specific to the `worker` subcommand.
#[derive(Debug, Parser)]
pub struct WorkerArgs {
    /// The name this node advertises to its peers. Defaults to a random identifier.
    #[arg(long, env = "BNDL_NODE_NAME")]
    pub name: Option<String>,
}

/// Starts a node that listens, seeds into the mesh, and serves blocks and demo tasks to the rest
/// of the fabric, running until interrupted.
pub async fn worker(config: Config, args: WorkerArgs) -> Result<(), CliError> {
    let name = args.name.unwrap_or_else(random_node_name);
    let listen_addresses = parse_addresses(&config.listen_addresses)?;
    let seeds = parse_addresses(&config.seeds)?;

    let config = Arc::new(config);
    let node = Node::new(name.clone(), "worker", config, seeds, Vec::new());

    let block_manager = BlockManager::new(Arc::downgrade(&node));
    node.register_service(block_manager).await;
    node.register_service(ExecutorService::new(TaskRegistry::builtin()))
        .await;

    node.start(&listen_addresses)
        .await
        .change_context(CliError)
        .attach_printable("could not start worker node")?;

    tracing::info!(%name, addresses = ?node.addresses().await, "worker node started");

    tokio::signal::ctrl_c()
        .await
        .into_report()
        .change_context(CliError)
        .attach_printable("could not await ctrl-c")?;

    tracing::info!("shutting down worker node");
    node.stop().await;
    Ok(())
}

fn parse_addresses(raw: &[String]) -> Result<Vec<NodeAddress>, CliError> {
    raw.iter()
        .map(|s| s.parse::<NodeAddress>().change_context(CliError))
        .collect()
}

fn random_node_name() -> String {
    format!("worker-{}", std::process::id())
}
