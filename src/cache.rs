//! Periodically fetched snapshot cache of cluster-API objects.
//!
//! Hundreds of concurrently running workflows each need to poll for fields
//! on externally reconciled objects. Letting every workflow query the API
//! server directly multiplies load linearly with fleet size, so one
//! background task bulk-fetches each tracked resource type per cycle and the
//! workflows read from the shared snapshot instead. Reads never wait on a
//! refresh in progress; staleness is bounded by the poll interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::Executor;

/// Resource types kept in the cache.
pub const TRACKED_KINDS: [&str; 3] = ["agentclusterinstalls", "baremetalhosts", "infraenvs"];

/// Seconds between full poll cycles.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Bulk listing of one resource type from the external system.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn bulk_list(&self, kind: &str) -> Result<Vec<Value>>;
}

/// Production store backed by `oc get <kind> -A -ojson`.
pub struct OcResourceStore {
    executor: Arc<Executor>,
}

impl OcResourceStore {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl<S: ResourceStore + ?Sized> ResourceStore for Arc<S> {
    async fn bulk_list(&self, kind: &str) -> Result<Vec<Value>> {
        (**self).bulk_list(kind).await
    }
}

#[async_trait]
impl ResourceStore for OcResourceStore {
    async fn bulk_list(&self, kind: &str) -> Result<Vec<Value>> {
        let output = self
            .executor
            .check_output(&["oc", "get", kind, "-A", "-ojson"], &HashMap::new())
            .await?;
        let listing: Value =
            serde_json::from_slice(&output).with_context(|| format!("parsing {kind} listing"))?;
        let items = listing
            .get("items")
            .and_then(Value::as_array)
            .with_context(|| format!("{kind} listing has no items array"))?;
        Ok(items.to_vec())
    }
}

type Snapshot = Arc<HashMap<String, Arc<Value>>>;

pub struct KubeCache {
    snapshots: RwLock<HashMap<&'static str, Snapshot>>,
}

impl KubeCache {
    pub fn new() -> Arc<Self> {
        let snapshots = TRACKED_KINDS
            .iter()
            .map(|kind| (*kind, Snapshot::default()))
            .collect();
        Arc::new(Self {
            snapshots: RwLock::new(snapshots),
        })
    }

    /// Non-blocking point lookup. Returns the document from the most recent
    /// successfully completed fetch of `kind`, or `None` if that object has
    /// never been observed.
    pub fn get(&self, kind: &str, namespace: &str, name: &str) -> Option<Arc<Value>> {
        let snapshot = self.snapshots.read().get(kind)?.clone();
        snapshot.get(&format!("{namespace}/{name}")).cloned()
    }

    pub fn get_infraenv(&self, namespace: &str, name: &str) -> Option<Arc<Value>> {
        self.get("infraenvs", namespace, name)
    }

    pub fn get_agent_cluster_install(&self, namespace: &str, name: &str) -> Option<Arc<Value>> {
        self.get("agentclusterinstalls", namespace, name)
    }

    pub fn get_baremetalhost(&self, namespace: &str, name: &str) -> Option<Arc<Value>> {
        self.get("baremetalhosts", namespace, name)
    }

    /// Replace one type's snapshot wholesale. Objects without metadata
    /// name/namespace are skipped.
    fn replace(&self, kind: &'static str, items: Vec<Value>) {
        let mut snapshot = HashMap::with_capacity(items.len());
        for object in items {
            let namespace = object
                .pointer("/metadata/namespace")
                .and_then(Value::as_str);
            let name = object.pointer("/metadata/name").and_then(Value::as_str);
            match (namespace, name) {
                (Some(namespace), Some(name)) => {
                    snapshot.insert(format!("{namespace}/{name}"), Arc::new(object));
                }
                _ => debug!(kind, "skipping listed object without metadata"),
            }
        }
        self.snapshots.write().insert(kind, Arc::new(snapshot));
    }

    /// Poll loop: one bulk fetch per tracked type per cycle, until the
    /// shutdown token fires. A failed fetch keeps the previous snapshot for
    /// that type.
    pub async fn monitor<S>(self: Arc<Self>, store: S, shutdown: CancellationToken)
    where
        S: ResourceStore,
    {
        info!("snapshot cache monitor started");
        loop {
            for kind in TRACKED_KINDS {
                match store.bulk_list(kind).await {
                    Ok(items) => self.replace(kind, items),
                    // The API is imperfect; keep the previous snapshot and
                    // try again next cycle.
                    Err(error) => warn!(kind, "bulk list failed: {error:#}"),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(POLL_INTERVAL) => {}
            }
        }
        info!("snapshot cache monitor stopped");
    }
}
