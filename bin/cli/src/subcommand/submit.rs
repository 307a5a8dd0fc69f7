use std::sync::Arc;

use clap::Parser;
use config::Config;
use error_stack::{Report, Result, ResultExt};
use execute::{Job, Task, Worker, WorkerPool};
use net::{Node, NodeAddress};
use rmi::RemoteWorker;

use crate::error::CliError;

/// Arguments specific to the `submit` subcommand.
#[derive(Debug, Parser)]
pub struct SubmitArgs {
    /// The name this driver node advertises while connected to the mesh.
    #[arg(long, env = "BNDL_NODE_NAME")]
    pub name: Option<String>,

    /// How many tasks the demo job's single stage dispatches.
    #[arg(long, default_value_t = 10)]
    pub tasks: usize,

    /// Which built-in worker method the demo job's tasks call (`echo` or `inc`).
    #[arg(long, default_value = "inc")]
    pub method: String,
}

/// Connects to the worker mesh named by `--seed`, discovers its worker peers, and runs a small
/// single-stage demo job against them, printing each task's result and the job's final
/// accumulator totals.
pub async fn submit(config: Config, args: SubmitArgs) -> Result<(), CliError> {
    let seeds = parse_addresses(&config.seeds)?;
    if seeds.is_empty() {
        return Err(Report::new(CliError)
            .attach_printable("submit requires at least one --seed pointing at a running worker"));
    }
    let attempts = config.attempts.max(1);
    let name = args.name.unwrap_or_else(random_driver_name);
    let driver = Node::new(name.clone(), "driver", Arc::new(config), Vec::new(), Vec::new());
    driver
        .start(&[NodeAddress::tcp("0.0.0.0", 0)])
        .await
        .change_context(CliError)
        .attach_printable("could not start driver node")?;

    for seed in &seeds {
        driver
            .connect(seed)
            .await
            .change_context(CliError)
            .attach_printable_lazy(|| format!("could not connect to seed {seed}"))?;
    }
    // Give gossip a moment to fan out the rest of the mesh beyond the directly-seeded peers.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let peers = driver.peers_by_type(Some("worker")).await;
    if peers.is_empty() {
        return Err(Report::new(CliError).attach_printable("no worker peers discovered"));
    }
    tracing::info!(workers = peers.len(), "discovered worker peers");

    let workers = peers
        .iter()
        .map(|peer| Arc::new(RemoteWorker::new(driver.clone(), peer)) as Arc<dyn Worker>)
        .collect();
    let pool = Arc::new(WorkerPool::new(workers));

    let job = Job::new(Some("cli-submit".to_owned()));
    let method = args.method.clone();
    let task_count = args.tasks;
    job.add_stage(move |stage_id| {
        (0..task_count as u64)
            .map(|i| Task::new(i, stage_id, method.clone(), serde_json::json!(i), Vec::new(), Vec::new()))
            .collect()
    })
    .await;

    let mut rx = job.execute(pool, attempts, true);
    let mut completed = 0usize;
    while let Some(result) = rx.recv().await {
        match result {
            Ok(result) => {
                tracing::info!(task_id = result.task_id, value = %result.value, "task completed");
                completed += 1;
            }
            Err(err) => {
                driver.stop().await;
                return Err(Report::new(CliError).attach_printable(format!("job failed: {err:?}")));
            }
        }
    }

    let accumulators = job.accumulators().await;
    println!(
        "completed {completed} task(s); accumulator[count] = {}",
        accumulators.get("count")
    );

    driver.stop().await;
    Ok(())
}

fn parse_addresses(raw: &[String]) -> Result<Vec<NodeAddress>, CliError> {
    raw.iter()
        .map(|s| s.parse::<NodeAddress>().change_context(CliError))
        .collect()
}

fn random_driver_name() -> String {
    format!("driver-{}", std::process::id())
}
