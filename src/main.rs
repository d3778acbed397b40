use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swarm::cli::Cli;
use swarm::config;
use swarm::error::ConfigError;
use swarm::gate::GateChain;
use swarm::pool::TaskPool;
use swarm::state_machine::{FixedDelay, RetryingStateMachine};
use swarm::swarm::Swarm;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = config::load(&cli.service_config, &cli.test_plan)?;
    let planned = config.plan.planned_clusters();

    // The agent pool must hold at least one full batch or an admitted batch
    // could deadlock it.
    let largest_batch = config.plan.largest_batch();
    if cli.agent_workers < largest_batch {
        return Err(ConfigError::AgentPoolTooSmall {
            capacity: cli.agent_workers,
            batch: largest_batch,
        }
        .into());
    }

    let pacing = Duration::from_secs(cli.pacing_secs);
    let cluster_pool = TaskPool::new("clusters", cli.cluster_workers);
    let agent_pool = TaskPool::new("agents", cli.agent_workers);

    let mut machine =
        RetryingStateMachine::new(Swarm::new(&config)?).with_pacing(FixedDelay(pacing));
    machine.run().await?;
    let swarm = Arc::new(machine.into_inner());

    let mut chain = GateChain::new();
    for (index, planned_cluster) in planned.into_iter().enumerate() {
        let gate = chain.issue(format!("cluster-{index}"));
        let swarm = swarm.clone();
        let agent_pool = agent_pool.clone();
        cluster_pool.submit(format!("cluster-{index}"), async move {
            swarm
                .launch_cluster(index, planned_cluster, agent_pool, gate, pacing)
                .await
        });
    }

    cluster_pool.wait_all().await?;
    info!("all clusters finished, exiting");
    swarm.finalize().await;

    Ok(())
}
