use std::path::PathBuf;

use thiserror::Error;

/// Structural misconfiguration. Detected eagerly, before any workflow
/// starts; never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("pull secret is not valid JSON: {0}")]
    PullSecretJson(#[from] serde_json::Error),

    #[error("pull secret must have an 'auths' field")]
    PullSecretMissingAuths,

    #[error("test plan group {group}: cannot have single node with workers")]
    SingleNodeWithWorkers { group: usize },

    #[error("cluster {index} has {agents} agents, larger than the supported {max}")]
    TooManyAgents {
        index: usize,
        agents: usize,
        max: usize,
    },

    #[error("cluster index {index} does not fit in a MAC address prefix")]
    ClusterIndexTooLarge { index: usize },

    #[error(
        "agent pool of size {capacity} cannot hold the largest cluster batch \
         ({batch} agents); raise --agent-workers"
    )]
    AgentPoolTooSmall { capacity: usize, batch: usize },
}
