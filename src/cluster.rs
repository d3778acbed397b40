//! A single simulated cluster.
//!
//! The cluster renders and applies the installation manifests for itself and
//! its hosts, admits its agents onto the shared agent pool behind the
//! admission gate chain, then runs the installer controller once the service
//! has assigned the cluster an infra ID.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tracing::{error, info};

use crate::agent::{Agent, AgentSharedConfig, ClusterAgentConfig};
use crate::cache::KubeCache;
use crate::config::PlannedCluster;
use crate::container_config::ContainerConfigSet;
use crate::error::ConfigError;
use crate::executor::Executor;
use crate::gate::AdmissionGate;
use crate::manifests::ManifestRenderer;
use crate::pool::{Submission, TaskPool};
use crate::state_machine::{FixedDelay, RetryingStateMachine, StateSpec, Workflow};

/// All simulated hosts share one machine network.
pub const MACHINE_NETWORK: &str = "10.123.0.0/16";
const API_VIP: &str = "10.123.255.253";
const INGRESS_VIP: &str = "10.123.255.254";

/// Agent IPs are allocated from the machine network; the top addresses are
/// reserved for the VIPs.
const MAX_AGENTS_PER_CLUSTER: usize = (1 << 16) - 4;

/// Each half of the MAC address holds one index.
const MAX_MAC_INDEX: usize = 1 << 24;

/// Environment variables podman must pass through to the controller.
const CONTROLLER_ENV_PASSTHROUGH: [&str; 10] = [
    "CONTAINERS_CONF",
    "CONTAINERS_STORAGE_CONF",
    "DRY_ENABLE",
    "DRY_HOST_ID",
    "DRY_FORCED_MAC_ADDRESS",
    "PULL_SECRET_TOKEN",
    "DRY_FORCED_HOSTNAME",
    "DRY_FORCED_HOST_IPV4",
    "DRY_FAKE_REBOOT_MARKER_PATH",
    "DRY_CLUSTER_HOSTS_PATH",
];

const PER_CLUSTER_MANIFESTS: [&str; 6] = [
    "namespace",
    "agentclusterinstall",
    "clusterdeployment",
    "clusterimageset",
    "infraenv",
    "secret_pull",
];

const PER_AGENT_MANIFESTS: [&str; 2] = ["baremetalhost", "secret_bmh"];

pub struct ClusterConfig {
    pub index: usize,
    pub planned: PlannedCluster,
    pub swarm_identifier: String,
    pub storage_dir: PathBuf,
    pub service_url: String,
    pub release_image: String,
    pub ssh_pub_key: String,
    pub pull_secret: String,
    pub controller_image: String,
    pub num_locks: u32,
    pub shared_graphroot: PathBuf,
    pub pacing: Duration,
    pub executor: Arc<Executor>,
    pub cache: Arc<KubeCache>,
    pub renderer: Arc<ManifestRenderer>,
    pub agent_pool: Arc<TaskPool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Initializing,
    GeneratingManifests,
    ApplyingManifests,
    LaunchingAgents,
    WaitingForInfraId,
    GeneratingContainerConfigs,
    RunningController,
    WaitingForAgents,
    Done,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterState::Initializing => "Initializing",
            ClusterState::GeneratingManifests => "Generating manifests",
            ClusterState::ApplyingManifests => "Applying manifests",
            ClusterState::LaunchingAgents => "Launching agents",
            ClusterState::WaitingForInfraId => {
                "Waiting for AgentClusterInstall clusterMetadata infraID"
            }
            ClusterState::GeneratingContainerConfigs => "Generating container configurations",
            ClusterState::RunningController => "Running controller",
            ClusterState::WaitingForAgents => "Wait for agents to complete",
            ClusterState::Done => "Done",
        };
        f.write_str(name)
    }
}

const CLUSTER_STATES: [ClusterState; 9] = [
    ClusterState::Initializing,
    ClusterState::GeneratingManifests,
    ClusterState::ApplyingManifests,
    ClusterState::LaunchingAgents,
    ClusterState::WaitingForInfraId,
    ClusterState::GeneratingContainerConfigs,
    ClusterState::RunningController,
    ClusterState::WaitingForAgents,
    ClusterState::Done,
];

pub struct Cluster {
    config: ClusterConfig,
    agent_shared: Arc<AgentSharedConfig>,
    gate: AdmissionGate,
    name: String,
    identifier: String,
    cluster_dir: PathBuf,
    manifest_dir: PathBuf,
    personal_graphroot: PathBuf,
    controller_stdout_path: PathBuf,
    controller_stderr_path: PathBuf,
    num_control_plane: usize,
    total_agents: usize,
    manifests: Option<String>,
    infra_id: Option<String>,
    first_reboot_marker: Option<PathBuf>,
    agent_tasks: Vec<Submission>,
    container_configs: Option<ContainerConfigSet>,
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        agent_shared: Arc<AgentSharedConfig>,
        gate: AdmissionGate,
    ) -> Result<Self, ConfigError> {
        if config.planned.single_node && config.planned.num_workers > 0 {
            return Err(ConfigError::SingleNodeWithWorkers {
                group: config.index,
            });
        }

        let total_agents = config.planned.total_agents();
        if total_agents > MAX_AGENTS_PER_CLUSTER {
            return Err(ConfigError::TooManyAgents {
                index: config.index,
                agents: total_agents,
                max: MAX_AGENTS_PER_CLUSTER,
            });
        }
        if config.index >= MAX_MAC_INDEX {
            return Err(ConfigError::ClusterIndexTooLarge {
                index: config.index,
            });
        }

        let identifier = format!("{}-{}", config.swarm_identifier, config.index);
        let cluster_dir = config.storage_dir.join(&identifier);

        Ok(Self {
            name: format!("Cluster {}", config.index),
            manifest_dir: cluster_dir.join("manifests"),
            personal_graphroot: cluster_dir.join("graphroot"),
            controller_stdout_path: cluster_dir.join("controller.stdout.logs"),
            controller_stderr_path: cluster_dir.join("controller.stderr.logs"),
            num_control_plane: config.planned.control_plane_count(),
            total_agents,
            identifier,
            cluster_dir,
            config,
            agent_shared,
            gate,
            manifests: None,
            infra_id: None,
            first_reboot_marker: None,
            agent_tasks: Vec::new(),
            container_configs: None,
        })
    }

    /// Agent IPs counted up from the bottom of the machine network.
    fn agent_ips(&self) -> Vec<String> {
        (1..=self.total_agents)
            .map(|host| format!("10.123.{}.{}/16", host >> 8, host & 0xff))
            .collect()
    }

    fn hostnames(&self) -> Vec<String> {
        (0..self.total_agents)
            .map(|agent_index| format!("{}-{}", self.identifier, agent_index))
            .collect()
    }

    fn initialize(&mut self, next: ClusterState) -> Result<ClusterState> {
        for dir in [&self.cluster_dir, &self.manifest_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(next)
    }

    fn generate_manifests(&mut self, next: ClusterState) -> Result<ClusterState> {
        let cluster_params = json!({
            "release_image": self.config.release_image,
            "machine_network": MACHINE_NETWORK,
            "ssh_pub_key": self.config.ssh_pub_key,
            "pull_secret_b64": BASE64.encode(&self.config.pull_secret),
            "num_control_plane": self.num_control_plane,
            "num_workers": self.config.planned.num_workers,
            "cluster_identifier": self.identifier,
            "single_node": self.config.planned.single_node,
            "api_vip": API_VIP,
            "ingress_vip": INGRESS_VIP,
        });

        let mut rendered = Vec::new();
        for manifest in PER_CLUSTER_MANIFESTS {
            rendered.push(self.config.renderer.render(manifest, &cluster_params)?);
        }

        for agent_index in 0..self.total_agents {
            let mut agent_params = cluster_params.clone();
            if let Some(params) = agent_params.as_object_mut() {
                params.insert(
                    "mac_address".to_string(),
                    Value::String(make_mac(self.config.index, agent_index)),
                );
                params.insert(
                    "agent_identifier".to_string(),
                    Value::String(format!("{}-{}", self.identifier, agent_index)),
                );
                let role = if agent_index < self.num_control_plane {
                    "master"
                } else {
                    "worker"
                };
                params.insert("role".to_string(), Value::String(role.to_string()));
            }
            for manifest in PER_AGENT_MANIFESTS {
                rendered.push(self.config.renderer.render(manifest, &agent_params)?);
            }
        }

        let manifests = rendered.join("\n---\n");
        std::fs::write(self.manifest_dir.join("manifests.yaml"), &manifests)
            .context("writing manifests.yaml")?;
        self.manifests = Some(manifests);
        Ok(next)
    }

    async fn apply_manifests(&mut self, next: ClusterState) -> Result<ClusterState> {
        let manifests = self.manifests.as_ref().context("manifests not generated")?;
        self.config
            .executor
            .check_call_with_input(
                &["oc", "apply", "-f", "-"],
                &std::collections::HashMap::new(),
                manifests.as_bytes(),
            )
            .await?;
        Ok(next)
    }

    /// The admission moment: wait for this cluster's turn in the chain,
    /// enqueue every agent workflow, then release the next cluster.
    async fn launch_agents(&mut self, next: ClusterState) -> Result<ClusterState> {
        self.gate.wait_turn().await;

        for agent_index in 0..self.total_agents {
            let agent = Agent::new(
                self.agent_shared.clone(),
                ClusterAgentConfig {
                    identifier: format!("{}-{}", self.identifier, agent_index),
                    cluster_identifier: self.identifier.clone(),
                    cluster_dir: self.cluster_dir.clone(),
                    mac_address: make_mac(self.config.index, agent_index),
                },
            );

            if agent_index == 0 {
                self.first_reboot_marker = Some(agent.fake_reboot_marker_path().to_path_buf());
            }

            info!(cluster = %self.name, "launching agent {agent_index}");
            let pacing = self.config.pacing;
            let label = agent.name().to_string();
            let submission = self.config.agent_pool.submit(label, async move {
                RetryingStateMachine::new(agent)
                    .with_pacing(FixedDelay(pacing))
                    .run()
                    .await
            });
            self.agent_tasks.push(submission);
        }

        self.gate.finish_admitting();
        Ok(next)
    }

    fn wait_for_infra_id(&mut self, next: ClusterState) -> Result<ClusterState> {
        let Some(install) = self
            .config
            .cache
            .get_agent_cluster_install(&self.identifier, &self.identifier)
        else {
            info!(
                "waiting for agent cluster install {}/{} to be created",
                self.identifier, self.identifier
            );
            return Ok(ClusterState::WaitingForInfraId);
        };

        let infra_id = install
            .pointer("/spec/clusterMetadata/infraID")
            .and_then(Value::as_str)
            .unwrap_or("");
        if infra_id.is_empty() {
            return Ok(ClusterState::WaitingForInfraId);
        }

        self.infra_id = Some(infra_id.to_string());
        Ok(next)
    }

    fn create_container_configs(&mut self, next: ClusterState) -> Result<ClusterState> {
        self.container_configs = Some(ContainerConfigSet::provision(
            &self.personal_graphroot,
            &self.config.shared_graphroot,
            &self.cluster_dir,
            &CONTROLLER_ENV_PASSTHROUGH,
            self.config.num_locks,
        )?);
        Ok(next)
    }

    async fn run_controller(&mut self, next: ClusterState) -> Result<ClusterState> {
        let configs = self
            .container_configs
            .as_ref()
            .context("container configs not provisioned")?;
        let infra_id = self.infra_id.as_ref().context("infra ID not resolved")?;
        let reboot_marker = self
            .first_reboot_marker
            .as_ref()
            .context("agents not launched")?;

        let podman_env = configs.podman_env();
        let storage_dir = self.config.storage_dir.display();
        let controller_env = [
            ("CLUSTER_ID", infra_id.clone()),
            ("DRY_ENABLE", "true".to_string()),
            ("INVENTORY_URL", self.config.service_url.clone()),
            ("PULL_SECRET_TOKEN", self.config.pull_secret.clone()),
            ("OPENSHIFT_VERSION", "4.9".to_string()),
            (
                "DRY_FAKE_REBOOT_MARKER_PATH",
                reboot_marker.display().to_string(),
            ),
            ("SKIP_CERT_VERIFICATION", "true".to_string()),
            ("HIGH_AVAILABILITY_MODE", "false".to_string()),
            ("CHECK_CLUSTER_VERSION", "true".to_string()),
            ("DRY_HOSTNAMES", self.hostnames().join(",")),
            (
                "DRY_MCS_ACCESS_IPS",
                self.agent_ips()
                    .iter()
                    .filter_map(|ip| ip.split('/').next())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        ];

        let mut command = vec![
            "podman".to_string(),
            "run".to_string(),
            "--net=host".to_string(),
            "-it".to_string(),
        ];
        command.extend(
            controller_env
                .iter()
                .map(|(var, value)| format!("-e={var}={value}")),
        );
        command.push(format!("-v={storage_dir}:{storage_dir}"));
        command.push(self.config.controller_image.clone());

        let status = self
            .config
            .executor
            .run_redirected(
                &Executor::sudo_command(&command, &podman_env),
                &podman_env,
                &self.controller_stdout_path,
                &self.controller_stderr_path,
            )
            .await?;

        if !status.success() {
            error!(cluster = %self.name, "controller exited with {status}");
            return Ok(ClusterState::RunningController);
        }
        Ok(next)
    }

    async fn wait_for_agents(&mut self, next: ClusterState) -> Result<ClusterState> {
        while let Some(task) = self.agent_tasks.pop() {
            task.wait().await?;
        }
        Ok(next)
    }
}

#[async_trait]
impl Workflow for Cluster {
    type State = ClusterState;

    fn spec(&self) -> StateSpec<ClusterState> {
        StateSpec::new(
            &CLUSTER_STATES,
            ClusterState::Initializing,
            ClusterState::Done,
        )
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn step(
        &mut self,
        state: ClusterState,
        recommended: Option<ClusterState>,
    ) -> Result<ClusterState> {
        let next = recommended.unwrap_or(state);
        match state {
            ClusterState::Initializing => self.initialize(next),
            ClusterState::GeneratingManifests => self.generate_manifests(next),
            ClusterState::ApplyingManifests => self.apply_manifests(next).await,
            ClusterState::LaunchingAgents => self.launch_agents(next).await,
            ClusterState::WaitingForInfraId => self.wait_for_infra_id(next),
            ClusterState::GeneratingContainerConfigs => self.create_container_configs(next),
            ClusterState::RunningController => self.run_controller(next).await,
            ClusterState::WaitingForAgents => self.wait_for_agents(next).await,
            ClusterState::Done => Ok(state),
        }
    }
}

/// Pack the cluster and agent indices into the six MAC octets. Indices are
/// bounded by [`MAX_MAC_INDEX`], validated at cluster construction.
pub fn make_mac(cluster_index: usize, agent_index: usize) -> String {
    let octets = [
        (cluster_index >> 16) & 0xff,
        (cluster_index >> 8) & 0xff,
        cluster_index & 0xff,
        (agent_index >> 16) & 0xff,
        (agent_index >> 8) & 0xff,
        agent_index & 0xff,
    ];
    octets
        .map(|octet| format!("{octet:02x}"))
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateChain;
    use std::path::Path;

    fn agent_shared() -> Arc<AgentSharedConfig> {
        Arc::new(AgentSharedConfig {
            agent_binary: PathBuf::from("/tmp/swarm-test/bin/agent"),
            agent_image: "quay.io/edge-infrastructure/assisted-installer-agent:latest".into(),
            service_url: "https://service.example.com".into(),
            pull_secret: r#"{"auths":{}}"#.into(),
            ca_cert_path: PathBuf::from("/tmp/swarm-test/ca.crt"),
            token: "sa-token".into(),
            k8s_api_server_url: "https://api.example.com:6443".into(),
            kube_client: reqwest::Client::new(),
            shared_graphroot: PathBuf::from("/tmp/swarm-test/shared_graphroot"),
            num_locks: 9000,
            pacing: Duration::from_millis(1),
            executor: Arc::new(Executor::new()),
            cache: KubeCache::new(),
        })
    }

    fn cluster(
        index: usize,
        planned: PlannedCluster,
        storage_dir: &Path,
    ) -> Result<Cluster, ConfigError> {
        let config = ClusterConfig {
            index,
            planned,
            swarm_identifier: "swarm-1".into(),
            storage_dir: storage_dir.to_path_buf(),
            service_url: "https://service.example.com".into(),
            release_image: "quay.io/openshift-release-dev/ocp-release:4.9.7-x86_64".into(),
            ssh_pub_key: "ssh-rsa AAAA".into(),
            pull_secret: r#"{"auths":{}}"#.into(),
            controller_image: "quay.io/edge-infrastructure/assisted-installer-controller:latest"
                .into(),
            num_locks: 9000,
            shared_graphroot: PathBuf::from("/tmp/swarm-test/shared_graphroot"),
            pacing: Duration::from_millis(1),
            executor: Arc::new(Executor::new()),
            cache: KubeCache::new(),
            renderer: Arc::new(ManifestRenderer::new(Path::new("manifests"))),
            agent_pool: TaskPool::new("agents", 4),
        };
        Cluster::new(config, agent_shared(), GateChain::new().issue("cluster"))
    }

    fn multi_node(num_workers: usize) -> PlannedCluster {
        PlannedCluster {
            single_node: false,
            num_workers,
        }
    }

    #[test]
    fn mac_packs_both_indices() {
        assert_eq!(make_mac(0, 0), "00:00:00:00:00:00");
        assert_eq!(make_mac(1, 2), "00:00:01:00:00:02");
        assert_eq!(make_mac(0x123456, 0xabcdef), "12:34:56:ab:cd:ef");
    }

    #[tokio::test]
    async fn identifier_and_derivations_follow_the_indices() {
        let cluster = cluster(2, multi_node(2), Path::new("/tmp/swarm-test")).unwrap();

        assert_eq!(cluster.identifier, "swarm-1-2");
        assert_eq!(cluster.total_agents, 5);
        assert_eq!(cluster.num_control_plane, 3);

        let ips = cluster.agent_ips();
        assert_eq!(ips[0], "10.123.0.1/16");
        assert_eq!(ips[4], "10.123.0.5/16");

        let hostnames = cluster.hostnames();
        assert_eq!(hostnames[0], "swarm-1-2-0");
        assert_eq!(hostnames[4], "swarm-1-2-4");
    }

    #[tokio::test]
    async fn ip_allocation_rolls_into_the_next_octet() {
        let cluster = cluster(0, multi_node(300), Path::new("/tmp/swarm-test")).unwrap();
        let ips = cluster.agent_ips();
        assert_eq!(ips[255], "10.123.1.0/16");
        assert_eq!(ips[299], "10.123.1.44/16");
    }

    #[tokio::test]
    async fn single_node_with_workers_is_a_construction_error() {
        let planned = PlannedCluster {
            single_node: true,
            num_workers: 1,
        };
        assert!(matches!(
            cluster(0, planned, Path::new("/tmp/swarm-test")),
            Err(ConfigError::SingleNodeWithWorkers { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_cluster_is_a_construction_error() {
        assert!(matches!(
            cluster(0, multi_node(1 << 16), Path::new("/tmp/swarm-test")),
            Err(ConfigError::TooManyAgents { .. })
        ));
    }

    #[tokio::test]
    async fn manifests_render_per_cluster_and_per_agent_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster(0, multi_node(1), dir.path()).unwrap();

        cluster.initialize(ClusterState::GeneratingManifests).unwrap();
        cluster
            .generate_manifests(ClusterState::ApplyingManifests)
            .unwrap();

        let manifests = cluster.manifests.as_ref().unwrap();
        // 6 per-cluster documents plus 2 per agent (3 masters + 1 worker).
        assert_eq!(manifests.split("\n---\n").count(), 6 + 2 * 4);
        assert!(manifests.contains("kind: InfraEnv"));
        assert!(manifests.contains("name: swarm-1-0-3"));
        assert!(manifests.contains("bootMACAddress: 00:00:00:00:00:03"));
        assert!(
            dir.path()
                .join("swarm-1-0/manifests/manifests.yaml")
                .exists()
        );
    }
}
