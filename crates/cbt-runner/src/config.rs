use crate::nodes::{NodeSet, NodeSpec};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Workload-engine defaults. `null` means "unset": the field is omitted from
/// the descriptor unless overridden.
pub fn workload_defaults() -> Map<String, Value> {
    into_map(json!({
        "cmd_path": "/usr/bin/fio",
        "runtime": null,
        "ramp_time": null,
        "iodepth": 16,
        "end_fsync": 0,
        "mode": "write",
        "rwmixread": 50,
        "log_avg_msec": null,
        "ioengine": "rbd",
        "clientname": "admin",
        "op_size": 4194304,
        "rate_iops": null,
    }))
}

pub fn orchestration_defaults() -> Map<String, Value> {
    into_map(json!({
        "idle_sleep": 60,
        "settle_time": 5,
        "pgs": 2048,
        "vol_size": 65536,
        "vol_order": 22,
        "pool_profile": "default",
        "poolname": "cbt-librbdfio",
        "volumes_per_client": 1,
        "procs_per_volume": 1,
        "random_distribution": null,
        "use_existing_volumes": false,
        "time_based": false,
        "rwmixwrite": null,
        "osd_ra": 128,
        "global": {},
    }))
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Overlays `layers` in order; a key in a later layer replaces the same key
/// from every earlier one.
pub fn merge_layers(layers: &[&Map<String, Value>]) -> Map<String, Value> {
    let mut merged = Map::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Read,
    Write,
    RandRead,
    RandWrite,
    #[serde(alias = "rw")]
    ReadWrite,
    RandRw,
    Trim,
    RandTrim,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Read => "read",
            Mode::Write => "write",
            Mode::RandRead => "randread",
            Mode::RandWrite => "randwrite",
            Mode::ReadWrite => "readwrite",
            Mode::RandRw => "randrw",
            Mode::Trim => "trim",
            Mode::RandTrim => "randtrim",
        }
    }

    pub fn is_mixed(&self) -> bool {
        matches!(self, Mode::ReadWrite | Mode::RandRw)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run's parameters after merging defaults with user overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub cmd_path: String,
    pub runtime: Option<u64>,
    pub ramp_time: Option<u64>,
    pub iodepth: u32,
    pub end_fsync: u32,
    pub mode: Mode,
    pub rwmixread: u32,
    pub rwmixwrite: Option<u32>,
    pub log_avg_msec: Option<u64>,
    pub ioengine: String,
    pub clientname: String,
    pub op_size: u64,
    pub rate_iops: Option<u64>,
    pub idle_sleep: u64,
    pub settle_time: u64,
    pub pgs: u32,
    pub vol_size: u64,
    pub vol_order: u32,
    pub pool_profile: String,
    pub poolname: String,
    pub volumes_per_client: usize,
    pub procs_per_volume: usize,
    pub random_distribution: Option<String>,
    pub use_existing_volumes: bool,
    pub time_based: bool,
    pub osd_ra: u64,
    pub global: BTreeMap<String, Value>,
}

impl EffectiveConfig {
    pub fn resolve(overrides: &Map<String, Value>) -> Result<Self> {
        let workload = workload_defaults();
        let orchestration = orchestration_defaults();
        for key in overrides.keys() {
            if !workload.contains_key(key) && !orchestration.contains_key(key) {
                warn!(key = %key, "ignoring unknown benchmark parameter");
            }
        }
        let merged = merge_layers(&[&workload, &orchestration, overrides]);
        let config: Self = serde_json::from_value(Value::Object(merged))
            .map_err(|e| anyhow!("invalid benchmark parameters: {}", e))?;
        if config.volumes_per_client == 0 {
            return Err(anyhow!("volumes_per_client must be at least 1"));
        }
        if config.procs_per_volume == 0 {
            return Err(anyhow!("procs_per_volume must be at least 1"));
        }
        Ok(config)
    }

    pub fn rwmixwrite(&self) -> u32 {
        self.rwmixwrite
            .unwrap_or_else(|| 100u32.saturating_sub(self.rwmixread))
    }

    pub fn total_procs(&self, client_count: usize) -> usize {
        self.procs_per_volume * self.volumes_per_client * client_count
    }

    /// Name of the workload binary, used by the node-wide kill.
    pub fn process_name(&self) -> &str {
        Path::new(&self.cmd_path)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("fio")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolProfile {
    #[serde(default = "default_pg_size")]
    pub pg_size: u32,
    #[serde(default)]
    pub pgp_size: Option<u32>,
    #[serde(default)]
    pub replication: Option<u32>,
}

fn default_pg_size() -> u32 {
    2048
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryTestSettings {
    #[serde(default)]
    pub osds: Vec<u32>,
    #[serde(default = "default_pre_time")]
    pub pre_time: u64,
    #[serde(default = "default_post_time")]
    pub post_time: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

fn default_pre_time() -> u64 {
    60
}

fn default_post_time() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    1
}

#[derive(Debug, Deserialize)]
struct RawCluster {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    head: NodeSpec,
    #[serde(default)]
    clients: NodeSpec,
    #[serde(default)]
    osds: NodeSpec,
    #[serde(default)]
    mons: NodeSpec,
    tmp_dir: PathBuf,
    #[serde(default)]
    archive_dir: Option<PathBuf>,
    #[serde(default = "default_iterations")]
    iterations: usize,
    #[serde(default)]
    pool_profiles: BTreeMap<String, PoolProfile>,
    #[serde(default)]
    recovery_test: Option<RecoveryTestSettings>,
    #[serde(default = "default_ceph_cmd")]
    ceph_cmd: String,
    #[serde(default = "default_rbd_cmd")]
    rbd_cmd: String,
}

fn default_iterations() -> usize {
    1
}

fn default_ceph_cmd() -> String {
    "/usr/bin/ceph".to_string()
}

fn default_rbd_cmd() -> String {
    "/usr/bin/rbd".to_string()
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub head: NodeSet,
    pub clients: NodeSet,
    pub osds: NodeSet,
    pub mons: NodeSet,
    pub tmp_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub iterations: usize,
    pub pool_profiles: BTreeMap<String, PoolProfile>,
    pub recovery_test: Option<RecoveryTestSettings>,
    pub ceph_cmd: String,
    pub rbd_cmd: String,
}

impl ClusterSettings {
    pub fn all_nodes(&self) -> NodeSet {
        NodeSet::union(&[&self.head, &self.clients, &self.osds, &self.mons])
    }

    /// A recovery test runs only when it names at least one OSD.
    pub fn recovery_test_configured(&self) -> bool {
        self.recovery_test
            .as_ref()
            .map(|r| !r.osds.is_empty())
            .unwrap_or(false)
    }

    pub fn pool_profile(&self, name: &str) -> PoolProfile {
        self.pool_profiles.get(name).cloned().unwrap_or(PoolProfile {
            pg_size: default_pg_size(),
            pgp_size: None,
            replication: None,
        })
    }

    fn from_raw(raw: RawCluster) -> Result<Self> {
        let user = raw.user.as_deref();
        let settings = Self {
            head: raw.head.resolve(user)?,
            clients: raw.clients.resolve(user)?,
            osds: raw.osds.resolve(user)?,
            mons: raw.mons.resolve(user)?,
            tmp_dir: raw.tmp_dir,
            archive_dir: raw.archive_dir,
            iterations: raw.iterations,
            pool_profiles: raw.pool_profiles,
            recovery_test: raw.recovery_test,
            ceph_cmd: raw.ceph_cmd,
            rbd_cmd: raw.rbd_cmd,
        };
        if settings.clients.is_empty() {
            return Err(anyhow!("cluster.clients must name at least one host"));
        }
        if settings.head.is_empty() {
            return Err(anyhow!("cluster.head must name a host"));
        }
        Ok(settings)
    }
}

/// A parsed run file: cluster layout plus the user override layer.
#[derive(Debug, Clone)]
pub struct RunFile {
    pub cluster: ClusterSettings,
    pub overrides: Map<String, Value>,
}

pub fn load_run_file(path: &Path) -> Result<RunFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read run file {}", path.display()))?;
    parse_run_file(&raw).with_context(|| format!("invalid run file {}", path.display()))
}

pub fn parse_run_file(raw_yaml: &str) -> Result<RunFile> {
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(raw_yaml)?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    let cluster_value = json_value
        .get("cluster")
        .cloned()
        .ok_or_else(|| anyhow!("missing /cluster"))?;
    let raw_cluster: RawCluster = serde_json::from_value(cluster_value)
        .map_err(|e| anyhow!("invalid /cluster: {}", e))?;
    let overrides = match json_value.pointer("/benchmarks/librbdfio") {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) => Map::new(),
        Some(_) => return Err(anyhow!("/benchmarks/librbdfio must be a mapping")),
        None => return Err(anyhow!("missing /benchmarks/librbdfio")),
    };
    Ok(RunFile {
        cluster: ClusterSettings::from_raw(raw_cluster)?,
        overrides,
    })
}
