//! The top-level swarm.
//!
//! One swarm per invocation: it prepares everything the clusters and agents
//! share (credentials, pre-cached images, the extracted agent binary, the
//! snapshot cache) and then launches cluster workflows on demand. The swarm
//! itself is a state machine like its children.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::AgentSharedConfig;
use crate::cache::{KubeCache, OcResourceStore};
use crate::cluster::{Cluster, ClusterConfig};
use crate::config::{Config, PlannedCluster};
use crate::container_config::{
    BAD_LOCK_EXIT_CODE, NUM_LOCKS, SYSTEM_CONTAINER_CONFIG, SYSTEM_CONTAINER_STORAGE_CONFIG,
    config_with_env_and_num_locks, storage_config_with_graphroot,
};
use crate::executor::Executor;
use crate::gate::AdmissionGate;
use crate::manifests::ManifestRenderer;
use crate::pool::TaskPool;
use crate::state_machine::{FixedDelay, RetryingStateMachine, StateSpec, Workflow};

/// Directory holding manifest templates, relative to the working directory.
const MANIFEST_TEMPLATE_DIR: &str = "manifests";

/// Images every entity runs, pulled once into the shared image store.
const IMAGES_TO_PRECACHE: [&str; 3] = [
    "discovery-agent",
    "assisted-installer",
    "assisted-installer-controller",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmState {
    Initializing,
    CheckingRoot,
    EnsuringSwarmDirectory,
    ValidatingPodmanLockConfig,
    KillingPreviousSwarm,
    DeletingPreviousSwarmStorage,
    CreatingServiceAccount,
    CreatingClusterRoleBinding,
    RetrievingServiceAccountCredentials,
    FetchingImageUrls,
    CreatingTmpfs,
    CreatingSharedImageStorage,
    PrecachingServiceImages,
    RetrievingAgentBinary,
    WritingCaCert,
    DeterminingHostname,
    ReadyToCreateClusters,
}

impl fmt::Display for SwarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwarmState::Initializing => "Initializing",
            SwarmState::CheckingRoot => "Checking root",
            SwarmState::EnsuringSwarmDirectory => "Ensuring swarm directory exists",
            SwarmState::ValidatingPodmanLockConfig => "Validating system podman lock config",
            SwarmState::KillingPreviousSwarm => "Killing previous swarm",
            SwarmState::DeletingPreviousSwarmStorage => "Deleting previous swarm storage",
            SwarmState::CreatingServiceAccount => "Creating service account",
            SwarmState::CreatingClusterRoleBinding => "Creating clusterrolebinding",
            SwarmState::RetrievingServiceAccountCredentials => {
                "Retrieving service account credentials"
            }
            SwarmState::FetchingImageUrls => "Getting image urls from service",
            SwarmState::CreatingTmpfs => "Creating tmpfs",
            SwarmState::CreatingSharedImageStorage => "Creating shared container image storage",
            SwarmState::PrecachingServiceImages => "Pre-caching service images",
            SwarmState::RetrievingAgentBinary => "Retrieving binary",
            SwarmState::WritingCaCert => "Creating CA Cert",
            SwarmState::DeterminingHostname => "Determining hostname",
            SwarmState::ReadyToCreateClusters => "Ready to create clusters",
        };
        f.write_str(name)
    }
}

const SWARM_STATES: [SwarmState; 17] = [
    SwarmState::Initializing,
    SwarmState::CheckingRoot,
    SwarmState::EnsuringSwarmDirectory,
    SwarmState::ValidatingPodmanLockConfig,
    SwarmState::KillingPreviousSwarm,
    SwarmState::DeletingPreviousSwarmStorage,
    SwarmState::CreatingServiceAccount,
    SwarmState::CreatingClusterRoleBinding,
    SwarmState::RetrievingServiceAccountCredentials,
    SwarmState::FetchingImageUrls,
    SwarmState::CreatingTmpfs,
    SwarmState::CreatingSharedImageStorage,
    SwarmState::PrecachingServiceImages,
    SwarmState::RetrievingAgentBinary,
    SwarmState::WritingCaCert,
    SwarmState::DeterminingHostname,
    SwarmState::ReadyToCreateClusters,
];

pub struct Swarm {
    pull_secret: String,
    service_url: String,
    ssh_pub_key: String,
    release_image: String,
    executor: Arc<Executor>,
    http: reqwest::Client,
    renderer: Arc<ManifestRenderer>,
    cache: Arc<KubeCache>,
    cache_shutdown: CancellationToken,
    cache_task: Mutex<Option<JoinHandle<()>>>,
    identifier: String,
    swarm_dir: PathBuf,
    shared_graphroot: Option<PathBuf>,
    token: Option<String>,
    ca_cert: Option<String>,
    ca_cert_path: Option<PathBuf>,
    k8s_api_server_url: Option<String>,
    service_image_urls: Option<HashMap<String, String>>,
    agent_binary: Option<PathBuf>,
    machine_hostname: Option<String>,
}

impl Swarm {
    pub fn new(config: &Config) -> Result<Self> {
        // The service commonly runs with a self-signed certificate.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("building HTTP client")?;

        let identifier = format!("swarm-{}", Utc::now().timestamp());
        let swarm_dir = global_swarm_directory()?.join(&identifier);

        Ok(Self {
            pull_secret: config.pull_secret.clone(),
            service_url: config.service.service_endpoint.clone(),
            ssh_pub_key: config.service.ssh_pub_key.clone(),
            release_image: config.service.release_image.clone(),
            executor: Arc::new(Executor::new()),
            http,
            renderer: Arc::new(ManifestRenderer::new(Path::new(MANIFEST_TEMPLATE_DIR))),
            cache: KubeCache::new(),
            cache_shutdown: CancellationToken::new(),
            cache_task: Mutex::new(None),
            identifier,
            swarm_dir,
            shared_graphroot: None,
            token: None,
            ca_cert: None,
            ca_cert_path: None,
            k8s_api_server_url: None,
            service_image_urls: None,
            agent_binary: None,
            machine_hostname: None,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn cache(&self) -> &Arc<KubeCache> {
        &self.cache
    }

    /// The host this swarm is running on, once determined.
    pub fn machine_hostname(&self) -> Option<&str> {
        self.machine_hostname.as_deref()
    }

    fn initialize(&mut self, next: SwarmState) -> Result<SwarmState> {
        let mut cache_task = self.cache_task.lock();
        if cache_task.is_none() {
            let store = OcResourceStore::new(self.executor.clone());
            *cache_task = Some(tokio::spawn(
                self.cache.clone().monitor(store, self.cache_shutdown.clone()),
            ));
        }
        Ok(next)
    }

    async fn check_root(&mut self, next: SwarmState) -> Result<SwarmState> {
        let output = self
            .executor
            .check_output(&["id", "-u"], &HashMap::new())
            .await?;
        let uid = String::from_utf8_lossy(&output).trim().to_string();
        if uid != "0" {
            anyhow::bail!("must be run as root");
        }
        Ok(next)
    }

    fn ensure_swarm_directory_exists(&mut self, next: SwarmState) -> Result<SwarmState> {
        std::fs::create_dir_all(&self.swarm_dir)
            .with_context(|| format!("creating {}", self.swarm_dir.display()))?;
        Ok(next)
    }

    async fn validate_system_podman_lock_config(&mut self, next: SwarmState) -> Result<SwarmState> {
        let container_config = config_with_env_and_num_locks(
            Path::new(SYSTEM_CONTAINER_CONFIG),
            &[],
            NUM_LOCKS,
            &self.swarm_dir,
            "test_system_podman_config_",
        )?;

        info!("validating system podman lock config");
        let podman_env = HashMap::from([(
            "CONTAINERS_CONF".to_string(),
            container_config.path().display().to_string(),
        )]);
        let command = Executor::sudo_command(&["podman", "run", "alpine"], &podman_env);

        match self.executor.check_call(&command, &podman_env).await {
            Ok(()) => Ok(next),
            Err(error) if error.exit_code() == Some(BAD_LOCK_EXIT_CODE) => {
                info!(
                    "system podman lock config is not valid, please edit \"num_locks\" in \
                     \"{SYSTEM_CONTAINER_CONFIG}\" to have the value {NUM_LOCKS} and then run \
                     \"sudo podman system renumber\". If you get an error, delete \
                     \"/dev/shm/libpod_lock\" and try again"
                );
                Ok(SwarmState::ValidatingPodmanLockConfig)
            }
            Err(error) => Err(error.into()),
        }
    }

    fn kill_previous_swarm(&mut self, next: SwarmState) -> Result<SwarmState> {
        // TODO: Find previous swarm and kill all processes
        Ok(next)
    }

    fn delete_previous_swarm_storage(&mut self, next: SwarmState) -> Result<SwarmState> {
        // TODO: Find previous swarm storage and delete it
        Ok(next)
    }

    async fn create_serviceaccount(&mut self, next: SwarmState) -> Result<SwarmState> {
        info!("creating service account");
        self.executor
            .check_call(
                &[
                    "oc",
                    "create",
                    "serviceaccount",
                    self.identifier.as_str(),
                    "-n",
                    "default",
                ],
                &HashMap::new(),
            )
            .await?;
        Ok(next)
    }

    async fn create_clusterrolebinding(&mut self, next: SwarmState) -> Result<SwarmState> {
        info!("creating clusterrolebinding");
        self.executor
            .check_call(
                &[
                    "oc".to_string(),
                    "create".to_string(),
                    "clusterrolebinding".to_string(),
                    self.identifier.clone(),
                    "--clusterrole=cluster-admin".to_string(),
                    format!("--serviceaccount=default:{}", self.identifier),
                ],
                &HashMap::new(),
            )
            .await?;
        Ok(next)
    }

    async fn retrieve_serviceaccount_credentials(
        &mut self,
        next: SwarmState,
    ) -> Result<SwarmState> {
        info!("retrieving service account credentials");
        let output = self
            .executor
            .check_output(
                &[
                    "kubectl",
                    "get",
                    "sa",
                    "--namespace=default",
                    self.identifier.as_str(),
                    "-ojson",
                ],
                &HashMap::new(),
            )
            .await?;
        let service_account: Value =
            serde_json::from_slice(&output).context("parsing service account")?;

        let token_prefix = format!("{}-token-", self.identifier);
        let Some(secret_name) = service_account
            .get("secrets")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|secret| secret.get("name").and_then(Value::as_str))
            .find(|name| name.starts_with(&token_prefix))
        else {
            info!("service account doesn't list the token secret yet");
            return Ok(SwarmState::RetrievingServiceAccountCredentials);
        };

        let output = self
            .executor
            .check_output(
                &["kubectl", "get", "secret", secret_name, "-ojson"],
                &HashMap::new(),
            )
            .await?;
        let secret: Value = serde_json::from_slice(&output).context("parsing token secret")?;

        self.token = Some(decode_secret_field(&secret, "token")?);
        self.ca_cert = Some(decode_secret_field(&secret, "ca.crt")?);

        let output = self
            .executor
            .check_output(&["oc", "whoami", "--show-server"], &HashMap::new())
            .await?;
        self.k8s_api_server_url = Some(String::from_utf8_lossy(&output).trim().to_string());

        Ok(next)
    }

    async fn get_image_urls_from_service(&mut self, next: SwarmState) -> Result<SwarmState> {
        self.service_image_urls =
            Some(fetch_component_versions(&self.http, &self.service_url).await?);
        Ok(next)
    }

    async fn create_tmpfs(&mut self, next: SwarmState) -> Result<SwarmState> {
        self.executor
            .check_call(
                &[
                    "sudo".to_string(),
                    "mount".to_string(),
                    "-t".to_string(),
                    "tmpfs".to_string(),
                    "-o".to_string(),
                    "size=20G".to_string(),
                    "tmpfs".to_string(),
                    self.swarm_dir.display().to_string(),
                ],
                &HashMap::new(),
            )
            .await?;
        Ok(next)
    }

    fn create_shared_container_image_storage(&mut self, next: SwarmState) -> Result<SwarmState> {
        let shared_graphroot = global_swarm_directory()?.join("shared_graphroot");
        std::fs::create_dir_all(&shared_graphroot)
            .with_context(|| format!("creating {}", shared_graphroot.display()))?;
        self.shared_graphroot = Some(shared_graphroot);
        Ok(next)
    }

    async fn precache_service_images(&mut self, next: SwarmState) -> Result<SwarmState> {
        let shared_graphroot = require(&self.shared_graphroot, "shared graphroot")?.clone();
        let image_urls = require(&self.service_image_urls, "service image urls")?.clone();

        let storage_config = storage_config_with_graphroot(
            Path::new(SYSTEM_CONTAINER_STORAGE_CONFIG),
            &shared_graphroot,
            &self.swarm_dir,
            "precache_container_storage_config_",
        )?;
        let container_config = config_with_env_and_num_locks(
            Path::new(SYSTEM_CONTAINER_CONFIG),
            &[],
            NUM_LOCKS,
            &self.swarm_dir,
            "precache_container_config_",
        )?;

        let pull_env = HashMap::from([
            (
                "CONTAINERS_STORAGE_CONF".to_string(),
                storage_config.path().display().to_string(),
            ),
            (
                "CONTAINERS_CONF".to_string(),
                container_config.path().display().to_string(),
            ),
        ]);

        for image in IMAGES_TO_PRECACHE {
            let Some(url) = image_urls.get(image) else {
                continue;
            };
            info!("pre-caching {image} image");
            let pull_command = ["podman", "pull", url.as_str()];
            self.executor
                .check_call(&Executor::sudo_command(&pull_command, &pull_env), &pull_env)
                .await?;
        }

        Ok(next)
    }

    async fn retrieve_agent_binary(&mut self, next: SwarmState) -> Result<SwarmState> {
        let shared_graphroot = require(&self.shared_graphroot, "shared graphroot")?.clone();
        let image_urls = require(&self.service_image_urls, "service image urls")?;
        let discovery_image = image_urls
            .get("discovery-agent")
            .context("service did not report a discovery-agent image")?
            .clone();

        let agent_binary_dir = self.swarm_dir.join("bin");
        std::fs::create_dir_all(&agent_binary_dir)
            .with_context(|| format!("creating {}", agent_binary_dir.display()))?;

        let storage_config = storage_config_with_graphroot(
            Path::new(SYSTEM_CONTAINER_STORAGE_CONFIG),
            &shared_graphroot,
            &self.swarm_dir,
            "agent_binary_retrieval_container_storage_config_",
        )?;
        let container_config = config_with_env_and_num_locks(
            Path::new(SYSTEM_CONTAINER_CONFIG),
            &[],
            NUM_LOCKS,
            &self.swarm_dir,
            "agent_binary_retrieval_container_config_",
        )?;

        let podman_env = HashMap::from([
            (
                "CONTAINERS_STORAGE_CONF".to_string(),
                storage_config.path().display().to_string(),
            ),
            (
                "CONTAINERS_CONF".to_string(),
                container_config.path().display().to_string(),
            ),
        ]);

        let podman_command = [
            "podman".to_string(),
            "run".to_string(),
            "--privileged".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/hostbin", agent_binary_dir.display()),
            discovery_image,
            "cp".to_string(),
            "/usr/bin/agent".to_string(),
            "/hostbin".to_string(),
        ];

        self.executor
            .check_call(
                &Executor::sudo_command(&podman_command, &podman_env),
                &podman_env,
            )
            .await?;

        self.agent_binary = Some(agent_binary_dir.join("agent"));
        Ok(next)
    }

    fn create_ca_cert(&mut self, next: SwarmState) -> Result<SwarmState> {
        let ca_cert = require(&self.ca_cert, "CA certificate")?;
        let ca_cert_path = self.swarm_dir.join("ca.crt");
        std::fs::write(&ca_cert_path, ca_cert)
            .with_context(|| format!("writing {}", ca_cert_path.display()))?;
        self.ca_cert_path = Some(ca_cert_path);
        Ok(next)
    }

    async fn determine_hostname(&mut self, next: SwarmState) -> Result<SwarmState> {
        info!("determining hostname");
        let output = self
            .executor
            .check_output(&["hostname", "--fqdn"], &HashMap::new())
            .await?;
        self.machine_hostname = Some(String::from_utf8_lossy(&output).trim().to_string());
        Ok(next)
    }

    /// Stop the snapshot-cache monitor and wait for it to exit.
    pub async fn finalize(&self) {
        self.cache_shutdown.cancel();
        let task = self.cache_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Build and run one cluster workflow to completion. Called from a
    /// cluster-pool task once the swarm has reached its terminal state.
    pub async fn launch_cluster(
        &self,
        index: usize,
        planned: PlannedCluster,
        agent_pool: Arc<TaskPool>,
        gate: AdmissionGate,
        pacing: Duration,
    ) -> Result<()> {
        let image_urls = require(&self.service_image_urls, "service image urls")?;
        let ca_cert = require(&self.ca_cert, "CA certificate")?;

        let kube_client = reqwest::Client::builder()
            .add_root_certificate(
                reqwest::Certificate::from_pem(ca_cert.as_bytes())
                    .context("parsing cluster CA certificate")?,
            )
            .build()
            .context("building cluster API client")?;

        let agent_shared = Arc::new(AgentSharedConfig {
            agent_binary: require(&self.agent_binary, "agent binary")?.clone(),
            agent_image: image_urls
                .get("discovery-agent")
                .context("service did not report a discovery-agent image")?
                .clone(),
            service_url: self.service_url.clone(),
            pull_secret: self.pull_secret.clone(),
            ca_cert_path: require(&self.ca_cert_path, "CA certificate path")?.clone(),
            token: require(&self.token, "service account token")?.clone(),
            k8s_api_server_url: require(&self.k8s_api_server_url, "API server url")?.clone(),
            kube_client,
            shared_graphroot: require(&self.shared_graphroot, "shared graphroot")?.clone(),
            num_locks: NUM_LOCKS,
            pacing,
            executor: self.executor.clone(),
            cache: self.cache.clone(),
        });

        let cluster = Cluster::new(
            ClusterConfig {
                index,
                planned,
                swarm_identifier: self.identifier.clone(),
                storage_dir: self.swarm_dir.clone(),
                service_url: self.service_url.clone(),
                release_image: self.release_image.clone(),
                ssh_pub_key: self.ssh_pub_key.clone(),
                pull_secret: self.pull_secret.clone(),
                controller_image: image_urls
                    .get("assisted-installer-controller")
                    .context("service did not report a controller image")?
                    .clone(),
                num_locks: NUM_LOCKS,
                shared_graphroot: require(&self.shared_graphroot, "shared graphroot")?.clone(),
                pacing,
                executor: self.executor.clone(),
                cache: self.cache.clone(),
                renderer: self.renderer.clone(),
                agent_pool,
            },
            agent_shared,
            gate,
        )?;

        info!("launching cluster");
        RetryingStateMachine::new(cluster)
            .with_pacing(FixedDelay(pacing))
            .run()
            .await
    }
}

#[async_trait]
impl Workflow for Swarm {
    type State = SwarmState;

    fn spec(&self) -> StateSpec<SwarmState> {
        StateSpec::new(
            &SWARM_STATES,
            SwarmState::Initializing,
            SwarmState::ReadyToCreateClusters,
        )
    }

    fn name(&self) -> &str {
        "Swarm"
    }

    async fn step(
        &mut self,
        state: SwarmState,
        recommended: Option<SwarmState>,
    ) -> Result<SwarmState> {
        let next = recommended.unwrap_or(state);
        match state {
            SwarmState::Initializing => self.initialize(next),
            SwarmState::CheckingRoot => self.check_root(next).await,
            SwarmState::EnsuringSwarmDirectory => self.ensure_swarm_directory_exists(next),
            SwarmState::ValidatingPodmanLockConfig => {
                self.validate_system_podman_lock_config(next).await
            }
            SwarmState::KillingPreviousSwarm => self.kill_previous_swarm(next),
            SwarmState::DeletingPreviousSwarmStorage => self.delete_previous_swarm_storage(next),
            SwarmState::CreatingServiceAccount => self.create_serviceaccount(next).await,
            SwarmState::CreatingClusterRoleBinding => self.create_clusterrolebinding(next).await,
            SwarmState::RetrievingServiceAccountCredentials => {
                self.retrieve_serviceaccount_credentials(next).await
            }
            SwarmState::FetchingImageUrls => self.get_image_urls_from_service(next).await,
            SwarmState::CreatingTmpfs => self.create_tmpfs(next).await,
            SwarmState::CreatingSharedImageStorage => {
                self.create_shared_container_image_storage(next)
            }
            SwarmState::PrecachingServiceImages => self.precache_service_images(next).await,
            SwarmState::RetrievingAgentBinary => self.retrieve_agent_binary(next).await,
            SwarmState::WritingCaCert => self.create_ca_cert(next),
            SwarmState::DeterminingHostname => self.determine_hostname(next).await,
            SwarmState::ReadyToCreateClusters => Ok(state),
        }
    }
}

fn require<'a, T>(field: &'a Option<T>, what: &str) -> Result<&'a T> {
    field
        .as_ref()
        .with_context(|| format!("{what} not prepared yet"))
}

fn user_cache_dir() -> Result<PathBuf> {
    if let Ok(cache_home) = std::env::var("XDG_CACHE_HOME") {
        return Ok(PathBuf::from(cache_home));
    }
    let home = std::env::var("HOME").context("neither XDG_CACHE_HOME nor HOME is set")?;
    Ok(PathBuf::from(home).join(".cache"))
}

fn global_swarm_directory() -> Result<PathBuf> {
    Ok(user_cache_dir()?.join("swarm"))
}

/// Ask the installation service which component images to use.
pub(crate) async fn fetch_component_versions(
    client: &reqwest::Client,
    service_url: &str,
) -> Result<HashMap<String, String>> {
    let url = format!("{service_url}/api/assisted-install/v2/component-versions");
    let body: Value = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url}"))?
        .json()
        .await
        .context("parsing component-versions response")?;

    let versions = body
        .get("versions")
        .and_then(Value::as_object)
        .context("component-versions response has no versions object")?;

    Ok(versions
        .iter()
        .filter_map(|(component, image)| {
            image
                .as_str()
                .map(|image| (component.clone(), image.to_string()))
        })
        .collect())
}

pub(crate) fn decode_secret_field(secret: &Value, field: &str) -> Result<String> {
    let encoded = secret
        .pointer(&format!("/data/{field}"))
        .and_then(Value::as_str)
        .with_context(|| format!("secret has no data field {field}"))?;
    let decoded = BASE64
        .decode(encoded)
        .with_context(|| format!("decoding secret field {field}"))?;
    String::from_utf8(decoded).with_context(|| format!("secret field {field} is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn component_versions_are_fetched_from_the_service() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/assisted-install/v2/component-versions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "release_tag": "v2.4.0",
                "versions": {
                    "discovery-agent": "quay.io/edge-infrastructure/assisted-installer-agent:latest",
                    "assisted-installer": "quay.io/edge-infrastructure/assisted-installer:latest",
                    "assisted-installer-controller": "quay.io/edge-infrastructure/assisted-installer-controller:latest",
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let versions = fetch_component_versions(&reqwest::Client::new(), &server.uri())
            .await
            .unwrap();
        assert_eq!(versions.len(), 3);
        assert!(
            versions["discovery-agent"].starts_with("quay.io/edge-infrastructure")
        );
    }

    #[tokio::test]
    async fn component_versions_error_surfaces_http_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let error = fetch_component_versions(&reqwest::Client::new(), &server.uri())
            .await
            .unwrap_err();
        assert!(format!("{error:#}").contains("500"));
    }

    #[test]
    fn secret_fields_are_base64_decoded() {
        let secret = json!({
            "data": {
                "token": BASE64.encode("sa-token"),
                "ca.crt": BASE64.encode("-----BEGIN CERTIFICATE-----"),
            }
        });
        assert_eq!(decode_secret_field(&secret, "token").unwrap(), "sa-token");
        assert_eq!(
            decode_secret_field(&secret, "ca.crt").unwrap(),
            "-----BEGIN CERTIFICATE-----"
        );
        assert!(decode_secret_field(&secret, "namespace").is_err());
    }

    #[test]
    fn swarm_directory_is_under_the_user_cache() {
        let dir = global_swarm_directory().unwrap();
        assert!(dir.ends_with("swarm"));
    }
}
