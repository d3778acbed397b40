//! Test-plan and service-config loading.
//!
//! Both files are YAML; the pull secret they reference is JSON. All
//! structural validation happens here, before any workflow starts.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::ConfigError;

/// Details about the target installation service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub service_endpoint: String,
    pub pull_secret_file: PathBuf,
    pub ssh_pub_key: String,
    pub release_image: String,
}

/// The fleet to create, as groups of identically shaped clusters.
#[derive(Debug, Clone, Deserialize)]
pub struct TestPlan {
    pub clusters: Vec<ClusterGroup>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ClusterGroup {
    pub single_node: bool,
    pub num_workers: usize,
    pub amount: usize,
}

/// One concrete cluster flattened out of the plan.
#[derive(Debug, Clone, Copy)]
pub struct PlannedCluster {
    pub single_node: bool,
    pub num_workers: usize,
}

impl PlannedCluster {
    pub fn control_plane_count(&self) -> usize {
        if self.single_node { 1 } else { 3 }
    }

    pub fn total_agents(&self) -> usize {
        self.control_plane_count() + self.num_workers
    }
}

impl TestPlan {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (group, cluster) in self.clusters.iter().enumerate() {
            if cluster.single_node && cluster.num_workers > 0 {
                return Err(ConfigError::SingleNodeWithWorkers { group });
            }
        }
        Ok(())
    }

    /// One entry per cluster to create, in launch order.
    pub fn planned_clusters(&self) -> Vec<PlannedCluster> {
        self.clusters
            .iter()
            .flat_map(|group| {
                std::iter::repeat_n(
                    PlannedCluster {
                        single_node: group.single_node,
                        num_workers: group.num_workers,
                    },
                    group.amount,
                )
            })
            .collect()
    }

    /// Agent count of the largest planned cluster. The agent pool must hold
    /// at least one full batch or admitted batches could deadlock it.
    pub fn largest_batch(&self) -> usize {
        self.planned_clusters()
            .iter()
            .map(PlannedCluster::total_agents)
            .max()
            .unwrap_or(0)
    }
}

/// Everything loaded and validated from the two config files.
pub struct Config {
    pub service: ServiceConfig,
    pub plan: TestPlan,
    pub pull_secret: String,
}

pub fn load(service_config_path: &Path, test_plan_path: &Path) -> Result<Config, ConfigError> {
    let service: ServiceConfig = read_yaml(service_config_path)?;
    let plan: TestPlan = read_yaml(test_plan_path)?;
    plan.validate()?;
    let pull_secret = load_pull_secret(&service.pull_secret_file)?;

    Ok(Config {
        service,
        plan,
        pull_secret,
    })
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_pull_secret(path: &Path) -> Result<String, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    if parsed.get("auths").is_none() {
        return Err(ConfigError::PullSecretMissingAuths);
    }

    // Re-serialize compactly so the secret passes cleanly through HTTP
    // headers.
    Ok(serde_json::to_string(&parsed)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(yaml: &str) -> TestPlan {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn planned_clusters_flatten_groups_in_order() {
        let plan = plan(
            "clusters:\n\
             - {single_node: true, num_workers: 0, amount: 1}\n\
             - {single_node: false, num_workers: 2, amount: 2}\n",
        );
        let planned = plan.planned_clusters();
        assert_eq!(planned.len(), 3);
        assert!(planned[0].single_node);
        assert_eq!(planned[0].total_agents(), 1);
        assert_eq!(planned[1].total_agents(), 5);
        assert_eq!(planned[2].total_agents(), 5);
        assert_eq!(plan.largest_batch(), 5);
    }

    #[test]
    fn single_node_with_workers_is_rejected() {
        let plan = plan("clusters:\n- {single_node: true, num_workers: 1, amount: 1}\n");
        assert!(matches!(
            plan.validate(),
            Err(ConfigError::SingleNodeWithWorkers { group: 0 })
        ));
    }

    #[test]
    fn multi_node_gets_three_control_plane_nodes() {
        let planned = PlannedCluster {
            single_node: false,
            num_workers: 0,
        };
        assert_eq!(planned.control_plane_count(), 3);
        assert_eq!(planned.total_agents(), 3);
    }

    #[test]
    fn pull_secret_is_validated_and_compacted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pull-secret.json");
        std::fs::write(&path, "{\n  \"auths\": {\n    \"quay.io\": {}\n  }\n}\n").unwrap();

        let compacted = load_pull_secret(&path).unwrap();
        assert_eq!(compacted, r#"{"auths":{"quay.io":{}}}"#);
    }

    #[test]
    fn pull_secret_without_auths_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pull-secret.json");
        std::fs::write(&path, r#"{"tokens": {}}"#).unwrap();

        assert!(matches!(
            load_pull_secret(&path),
            Err(ConfigError::PullSecretMissingAuths)
        ));
    }

    #[test]
    fn service_config_requires_all_fields() {
        let incomplete = "service_endpoint: https://service.example.com\n";
        assert!(serde_yaml::from_str::<ServiceConfig>(incomplete).is_err());

        let complete = "service_endpoint: https://service.example.com\n\
                        pull_secret_file: /tmp/pull-secret.json\n\
                        ssh_pub_key: ssh-rsa AAAA\n\
                        release_image: quay.io/openshift-release-dev/ocp-release:4.9.7-x86_64\n";
        let config: ServiceConfig = serde_yaml::from_str(complete).unwrap();
        assert_eq!(config.release_image.split(':').count(), 2);
    }
}
