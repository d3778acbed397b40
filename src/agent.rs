//! A single simulated host.
//!
//! Each agent impersonates one bare-metal host of its cluster: it waits for
//! the installation service to publish a discovery ISO, walks the
//! BareMetalHost object through the provisioning states a real
//! baremetal-operator would, then runs the discovery agent binary against
//! the service. Everything it observes about the control plane comes from
//! the shared snapshot cache.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{error, info};
use uuid::Uuid;

use crate::cache::KubeCache;
use crate::container_config::ContainerConfigSet;
use crate::executor::Executor;
use crate::state_machine::{StateSpec, Workflow};

/// Environment variables podman must pass through to the agent process.
const AGENT_ENV_PASSTHROUGH: [&str; 7] = [
    "CONTAINERS_CONF",
    "CONTAINERS_STORAGE_CONF",
    "DRY_ENABLE",
    "DRY_HOST_ID",
    "DRY_MAC_ADDRESS",
    "PULL_SECRET_TOKEN",
    "DRY_FAKE_REBOOT_MARKER_PATH",
];

/// Settings shared by every agent of the swarm, assembled once per cluster
/// launch from the prepared swarm state.
pub struct AgentSharedConfig {
    pub agent_binary: PathBuf,
    pub agent_image: String,
    pub service_url: String,
    pub pull_secret: String,
    pub ca_cert_path: PathBuf,
    pub token: String,
    pub k8s_api_server_url: String,
    pub kube_client: reqwest::Client,
    pub shared_graphroot: PathBuf,
    pub num_locks: u32,
    pub pacing: Duration,
    pub executor: Arc<Executor>,
    pub cache: Arc<KubeCache>,
}

/// Per-agent settings computed by the owning cluster.
pub struct ClusterAgentConfig {
    pub identifier: String,
    pub cluster_identifier: String,
    pub cluster_dir: PathBuf,
    pub mac_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Initializing,
    WaitingForInfraEnvIso,
    MarkingBmhReady,
    WaitingForBmhIso,
    MarkingBmhProvisioned,
    GeneratingContainerConfigs,
    RunningAgent,
    Done,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Initializing => "Initializing",
            AgentState::WaitingForInfraEnvIso => "Waiting for ISO URL on InfraEnv",
            AgentState::MarkingBmhReady => "Setting BMH provisioning state to \"ready\"",
            AgentState::WaitingForBmhIso => "Waiting for ISO URL on BMH",
            AgentState::MarkingBmhProvisioned => {
                "Setting BMH provisioning state to \"provisioned\""
            }
            AgentState::GeneratingContainerConfigs => "Generating container configurations",
            AgentState::RunningAgent => "Running agent",
            AgentState::Done => "Done",
        };
        f.write_str(name)
    }
}

const AGENT_STATES: [AgentState; 8] = [
    AgentState::Initializing,
    AgentState::WaitingForInfraEnvIso,
    AgentState::MarkingBmhReady,
    AgentState::WaitingForBmhIso,
    AgentState::MarkingBmhProvisioned,
    AgentState::GeneratingContainerConfigs,
    AgentState::RunningAgent,
    AgentState::Done,
];

pub struct Agent {
    shared: Arc<AgentSharedConfig>,
    config: ClusterAgentConfig,
    name: String,
    host_id: Uuid,
    agent_dir: PathBuf,
    personal_graphroot: PathBuf,
    fake_reboot_marker_path: PathBuf,
    agent_stdout_path: PathBuf,
    agent_stderr_path: PathBuf,
    infraenv_id: Option<Uuid>,
    container_configs: Option<ContainerConfigSet>,
}

impl Agent {
    pub fn new(shared: Arc<AgentSharedConfig>, config: ClusterAgentConfig) -> Self {
        let agent_dir = config.cluster_dir.join(&config.identifier);
        Self {
            name: format!("Agent {}", config.identifier),
            host_id: Uuid::new_v4(),
            personal_graphroot: agent_dir.join("graphroot"),
            fake_reboot_marker_path: agent_dir.join("fake_reboot_marker"),
            agent_stdout_path: agent_dir.join("agent.stdout.logs"),
            agent_stderr_path: agent_dir.join("agent.stderr.logs"),
            agent_dir,
            shared,
            config,
            infraenv_id: None,
            container_configs: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Touched by the agent binary on its simulated reboot; the cluster
    /// hands the first agent's path to the controller as a start signal.
    pub fn fake_reboot_marker_path(&self) -> &Path {
        &self.fake_reboot_marker_path
    }

    fn initialize(&mut self, next: AgentState) -> Result<AgentState> {
        for dir in [&self.agent_dir, &self.personal_graphroot] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(next)
    }

    fn wait_iso_url_infraenv(&mut self, next: AgentState) -> Result<AgentState> {
        let namespace = &self.config.cluster_identifier;
        let name = &self.config.cluster_identifier;
        let Some(infraenv) = self.shared.cache.get_infraenv(namespace, name) else {
            info!("infraenv {namespace}/{name} not found");
            return Ok(AgentState::WaitingForInfraEnvIso);
        };

        let iso_url = infraenv
            .pointer("/status/isoDownloadURL")
            .and_then(Value::as_str)
            .unwrap_or("");
        if iso_url.is_empty() {
            info!("infraenv .status.isoDownloadURL is empty");
            return Ok(AgentState::WaitingForInfraEnvIso);
        }

        info!("infraenv .status.isoDownloadURL found {iso_url}");
        self.infraenv_id = Some(infraenv_id_from_url(iso_url)?);
        Ok(next)
    }

    fn wait_iso_url_bmh(&mut self, next: AgentState) -> Result<AgentState> {
        let namespace = &self.config.cluster_identifier;
        let name = &self.config.identifier;
        let Some(baremetalhost) = self.shared.cache.get_baremetalhost(namespace, name) else {
            info!("BMH {namespace}/{name} not found");
            return Ok(AgentState::WaitingForBmhIso);
        };

        let iso_url = baremetalhost
            .pointer("/spec/image/url")
            .and_then(Value::as_str)
            .unwrap_or("");
        if iso_url.is_empty() {
            info!("BMH .spec.image.url is empty");
            return Ok(AgentState::WaitingForBmhIso);
        }

        info!("BMH .spec.image.url found {iso_url}");
        Ok(next)
    }

    /// Stand in for the baremetal-operator: report the provisioning state a
    /// real host would have reached by now.
    async fn set_bmh_provisioning_state(&self, provisioning_state: &str) -> Result<bool> {
        let namespace = &self.config.cluster_identifier;
        let name = &self.config.identifier;
        let Some(baremetalhost) = self.shared.cache.get_baremetalhost(namespace, name) else {
            info!("BMH {namespace}/{name} not found");
            return Ok(false);
        };

        let mut document = (*baremetalhost).clone();
        if let Some(object) = document.as_object_mut() {
            object.insert(
                "status".to_string(),
                json!({
                    "errorCount": 0,
                    "errorMessage": "",
                    "goodCredentials": {},
                    "hardwareProfile": "",
                    "operationalStatus": "discovered",
                    "poweredOn": true,
                    "provisioning": {"state": provisioning_state, "ID": "", "image": {"url": ""}},
                }),
            );
        }

        update_bmh_status(
            &self.shared.kube_client,
            &self.shared.k8s_api_server_url,
            &self.shared.token,
            namespace,
            name,
            &document,
        )
        .await?;

        Ok(true)
    }

    fn create_container_configs(&mut self, next: AgentState) -> Result<AgentState> {
        self.container_configs = Some(ContainerConfigSet::provision(
            &self.personal_graphroot,
            &self.shared.shared_graphroot,
            &self.agent_dir,
            &AGENT_ENV_PASSTHROUGH,
            self.shared.num_locks,
        )?);
        Ok(next)
    }

    async fn run_agent(&mut self, next: AgentState) -> Result<AgentState> {
        let configs = self
            .container_configs
            .as_ref()
            .context("container configs not provisioned")?;
        let infraenv_id = self.infraenv_id.context("infra-env id not resolved")?;

        let mut env = configs.podman_env();
        env.insert(
            "PULL_SECRET_TOKEN".to_string(),
            self.shared.pull_secret.clone(),
        );
        env.insert("DRY_ENABLE".to_string(), "true".to_string());
        env.insert("DRY_HOST_ID".to_string(), self.host_id.to_string());
        env.insert(
            "DRY_MAC_ADDRESS".to_string(),
            self.config.mac_address.clone(),
        );
        env.insert(
            "DRY_FAKE_REBOOT_MARKER_PATH".to_string(),
            self.fake_reboot_marker_path.display().to_string(),
        );

        let command = vec![
            self.shared.agent_binary.display().to_string(),
            "--url".to_string(),
            self.shared.service_url.clone(),
            "--infra-env-id".to_string(),
            infraenv_id.to_string(),
            "--agent-version".to_string(),
            self.shared.agent_image.clone(),
            "--insecure=true".to_string(),
            "--cacert".to_string(),
            self.shared.ca_cert_path.display().to_string(),
        ];

        let status = self
            .shared
            .executor
            .run_redirected(
                &Executor::sudo_command(&command, &env),
                &env,
                &self.agent_stdout_path,
                &self.agent_stderr_path,
            )
            .await?;

        if !status.success() {
            error!(agent = %self.name, "agent exited with {status}");
            return Ok(AgentState::RunningAgent);
        }
        Ok(next)
    }
}

#[async_trait]
impl Workflow for Agent {
    type State = AgentState;

    fn spec(&self) -> StateSpec<AgentState> {
        StateSpec::new(&AGENT_STATES, AgentState::Initializing, AgentState::Done)
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn step(
        &mut self,
        state: AgentState,
        recommended: Option<AgentState>,
    ) -> Result<AgentState> {
        let next = recommended.unwrap_or(state);
        match state {
            AgentState::Initializing => self.initialize(next),
            AgentState::WaitingForInfraEnvIso => self.wait_iso_url_infraenv(next),
            AgentState::MarkingBmhReady => {
                if self.set_bmh_provisioning_state("ready").await? {
                    Ok(next)
                } else {
                    Ok(state)
                }
            }
            AgentState::WaitingForBmhIso => self.wait_iso_url_bmh(next),
            AgentState::MarkingBmhProvisioned => {
                if self.set_bmh_provisioning_state("provisioned").await? {
                    Ok(next)
                } else {
                    Ok(state)
                }
            }
            AgentState::GeneratingContainerConfigs => self.create_container_configs(next),
            AgentState::RunningAgent => self.run_agent(next).await,
            AgentState::Done => Ok(state),
        }
    }
}

/// Replace a BareMetalHost's status subresource directly against the
/// cluster API, authenticating with the swarm's service-account token.
pub(crate) async fn update_bmh_status(
    client: &reqwest::Client,
    api_server_url: &str,
    token: &str,
    namespace: &str,
    name: &str,
    document: &Value,
) -> Result<()> {
    let url = format!(
        "{api_server_url}/apis/metal3.io/v1alpha1/namespaces/{namespace}/baremetalhosts/{name}/status"
    );
    client
        .put(&url)
        .bearer_auth(token)
        .json(document)
        .send()
        .await
        .with_context(|| format!("PUT {url}"))?
        .error_for_status()
        .with_context(|| format!("PUT {url}"))?;
    Ok(())
}

/// The installation service embeds the infra-env ID in the ISO download URL.
pub(crate) fn infraenv_id_from_url(url: &str) -> Result<Uuid> {
    url.split(['/', '?', '=', '&'])
        .find_map(|segment| Uuid::parse_str(segment).ok())
        .with_context(|| format!("could not find infra-env ID in url {url}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn infraenv_id_is_extracted_from_iso_url() {
        let id = infraenv_id_from_url(
            "https://service.example.com/images/2c89319c-3cc7-4dcf-97d5-1a2b3c4d5e6f?api_key=abc&arch=x86_64",
        )
        .unwrap();
        assert_eq!(id.to_string(), "2c89319c-3cc7-4dcf-97d5-1a2b3c4d5e6f");
    }

    #[test]
    fn url_without_uuid_is_an_error() {
        assert!(infraenv_id_from_url("https://service.example.com/images/latest").is_err());
    }

    #[tokio::test]
    async fn bmh_status_put_hits_the_status_subresource() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(
                "/apis/metal3.io/v1alpha1/namespaces/swarm-1-0/baremetalhosts/swarm-1-0-2/status",
            ))
            .and(bearer_token("sa-token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        update_bmh_status(
            &reqwest::Client::new(),
            &server.uri(),
            "sa-token",
            "swarm-1-0",
            "swarm-1-0-2",
            &json!({"status": {"provisioning": {"state": "ready"}}}),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn bmh_status_put_surfaces_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let error = update_bmh_status(
            &reqwest::Client::new(),
            &server.uri(),
            "sa-token",
            "ns",
            "bmh",
            &json!({}),
        )
        .await
        .unwrap_err();
        assert!(format!("{error:#}").contains("403"));
    }
}
