//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// Drives fleets of simulated hosts through cluster bring-up to load-test an
/// assisted-installer service.
#[derive(Debug, Parser)]
#[command(name = "swarm", version, about)]
pub struct Cli {
    /// Test plan file describing the clusters to create. See
    /// testplan.example.yaml.
    pub test_plan: PathBuf,

    /// Service config file describing the target service. See
    /// service_config.example.yaml.
    pub service_config: PathBuf,

    /// Max concurrent cluster workflows.
    #[arg(long, default_value_t = 4)]
    pub cluster_workers: usize,

    /// Max concurrent agent workflows. Must hold at least the largest
    /// planned cluster's full agent batch.
    #[arg(long, default_value_t = 24)]
    pub agent_workers: usize,

    /// Seconds between retries of a non-advancing workflow state.
    #[arg(long, default_value_t = 5)]
    pub pacing_secs: u64,

    /// Enable verbose output.
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_positional_paths() {
        let cli = Cli::parse_from(["swarm", "plan.yaml", "service.yaml"]);
        assert_eq!(cli.test_plan, PathBuf::from("plan.yaml"));
        assert_eq!(cli.service_config, PathBuf::from("service.yaml"));
        assert_eq!(cli.cluster_workers, 4);
        assert_eq!(cli.agent_workers, 24);
        assert_eq!(cli.pacing_secs, 5);
        assert!(!cli.verbose);
    }

    #[test]
    fn cli_parses_pool_flags() {
        let cli = Cli::parse_from([
            "swarm",
            "plan.yaml",
            "service.yaml",
            "--cluster-workers",
            "2",
            "--agent-workers",
            "3",
            "--verbose",
        ]);
        assert_eq!(cli.cluster_workers, 2);
        assert_eq!(cli.agent_workers, 3);
        assert!(cli.verbose);
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
