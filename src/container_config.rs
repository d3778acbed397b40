//! Per-entity container-runtime configuration.
//!
//! Every concurrent entity runs podman with its own storage graphroot and an
//! enlarged lock table, so the system configs are copied, adjusted, and
//! written to temporary files: scoped ones clean themselves up on drop,
//! persisted ones live as long as the entity's directory.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempPath;
use toml::Value;
use toml::value::Table;

pub const SYSTEM_CONTAINER_STORAGE_CONFIG: &str = "/etc/containers/storage.conf";
pub const SYSTEM_CONTAINER_CONFIG: &str = "/usr/share/containers/containers.conf";

/// Podman's default lock table (2048) is insufficient for a swarm of this
/// size; the system config must carry this value and be renumbered.
pub const NUM_LOCKS: u32 = 9000;

/// Exit code podman returns when the lock table is smaller than configured.
pub const BAD_LOCK_EXIT_CODE: i32 = 125;

/// A copy of a TOML config file with adjustments applied, written to a
/// temporary file. The file is removed when the value is dropped unless
/// [`AdjustedToml::persist`] is called first.
pub struct AdjustedToml {
    path: TempPath,
}

impl AdjustedToml {
    pub fn create(
        original: &Path,
        dir: &Path,
        prefix: &str,
        adjust: impl FnOnce(&mut Value),
    ) -> Result<Self> {
        let text = std::fs::read_to_string(original)
            .with_context(|| format!("reading {}", original.display()))?;
        let mut config: Value = text
            .parse()
            .with_context(|| format!("parsing {}", original.display()))?;

        adjust(&mut config);

        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".toml")
            .tempfile_in(dir)
            .with_context(|| format!("creating adjusted config in {}", dir.display()))?;
        file.write_all(toml::to_string(&config)?.as_bytes())
            .context("writing adjusted config")?;

        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file on disk past this value's lifetime.
    pub fn persist(self) -> Result<PathBuf> {
        self.path.keep().context("persisting adjusted config")
    }
}

/// Descend into a sub-table, creating (or coercing) it if needed.
fn child_table<'a>(table: &'a mut Table, key: &str) -> &'a mut Table {
    let entry = table
        .entry(key.to_string())
        .or_insert_with(|| Value::Table(Table::new()));
    if !entry.is_table() {
        *entry = Value::Table(Table::new());
    }
    match entry {
        Value::Table(child) => child,
        _ => unreachable!("entry was just coerced to a table"),
    }
}

fn root_table(config: &mut Value) -> &mut Table {
    if !config.is_table() {
        *config = Value::Table(Table::new());
    }
    match config {
        Value::Table(table) => table,
        _ => unreachable!("config was just coerced to a table"),
    }
}

fn array_entry<'a>(table: &'a mut Table, key: &str) -> &'a mut Vec<Value> {
    let entry = table
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !entry.is_array() {
        *entry = Value::Array(Vec::new());
    }
    match entry {
        Value::Array(array) => array,
        _ => unreachable!("entry was just coerced to an array"),
    }
}

/// Storage config whose graphroot points at the entity's own directory.
pub fn storage_config_with_graphroot(
    original: &Path,
    graphroot: &Path,
    dir: &Path,
    prefix: &str,
) -> Result<AdjustedToml> {
    let graphroot = graphroot.display().to_string();
    AdjustedToml::create(original, dir, prefix, move |config| {
        set_graphroot(config, &graphroot);
    })
}

/// Storage config with a personal graphroot plus shared read-only image
/// stores (the swarm-wide pre-cached images).
pub fn storage_config_with_image_stores(
    original: &Path,
    graphroot: &Path,
    additional_image_stores: &[&Path],
    dir: &Path,
    prefix: &str,
) -> Result<AdjustedToml> {
    let graphroot = graphroot.display().to_string();
    let stores: Vec<String> = additional_image_stores
        .iter()
        .map(|store| store.display().to_string())
        .collect();
    AdjustedToml::create(original, dir, prefix, move |config| {
        set_graphroot(config, &graphroot);
        let storage = child_table(root_table(config), "storage");
        let options = child_table(storage, "options");
        array_entry(options, "additionalimagestores")
            .extend(stores.iter().cloned().map(Value::String));
    })
}

/// Container config with the entity's environment passthrough list and the
/// enlarged lock table.
pub fn config_with_env_and_num_locks(
    original: &Path,
    env_passthrough: &[&str],
    num_locks: u32,
    dir: &Path,
    prefix: &str,
) -> Result<AdjustedToml> {
    let passthrough: Vec<String> = env_passthrough.iter().map(|var| var.to_string()).collect();
    AdjustedToml::create(original, dir, prefix, move |config| {
        let root = root_table(config);
        let containers = child_table(root, "containers");
        array_entry(containers, "env")
            .extend(passthrough.iter().cloned().map(Value::String));

        let engine = child_table(root, "engine");
        engine.insert("num_locks".to_string(), Value::Integer(num_locks.into()));
    })
}

/// The persisted storage/container config pair shared by the long-running
/// entity processes (agent and controller). One independent set per
/// concurrent entity.
#[derive(Debug, Clone)]
pub struct ContainerConfigSet {
    pub storage_conf: PathBuf,
    pub container_conf: PathBuf,
}

impl ContainerConfigSet {
    pub fn provision(
        personal_graphroot: &Path,
        shared_graphroot: &Path,
        config_dir: &Path,
        env_passthrough: &[&str],
        num_locks: u32,
    ) -> Result<Self> {
        let storage_conf = storage_config_with_image_stores(
            Path::new(SYSTEM_CONTAINER_STORAGE_CONFIG),
            personal_graphroot,
            &[shared_graphroot],
            config_dir,
            "container_storage_config_",
        )?
        .persist()?;

        let container_conf = config_with_env_and_num_locks(
            Path::new(SYSTEM_CONTAINER_CONFIG),
            env_passthrough,
            num_locks,
            config_dir,
            "container_config_",
        )?
        .persist()?;

        Ok(Self {
            storage_conf,
            container_conf,
        })
    }

    /// CONTAINERS_CONF / CONTAINERS_STORAGE_CONF environment for podman.
    pub fn podman_env(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                "CONTAINERS_CONF".to_string(),
                self.container_conf.display().to_string(),
            ),
            (
                "CONTAINERS_STORAGE_CONF".to_string(),
                self.storage_conf.display().to_string(),
            ),
        ])
    }
}

fn set_graphroot(config: &mut Value, graphroot: &str) {
    let storage = child_table(root_table(config), "storage");
    storage.insert(
        "graphroot".to_string(),
        Value::String(graphroot.to_string()),
    );
}
