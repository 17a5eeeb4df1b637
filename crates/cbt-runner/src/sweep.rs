use crate::config::{EffectiveConfig, RunFile};
use crate::path_identity::RunIdentity;
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const BENCHMARK_NAME: &str = "librbdfio";

/// One fully resolved run: iteration, parameters, and both directories.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub iteration: usize,
    pub config: EffectiveConfig,
    pub identity: RunIdentity,
    pub run_dir: PathBuf,
    pub archive_dir: PathBuf,
}

/// Expands list-valued parameters into their cartesian product. Keys are
/// visited in sorted order and list values in the order given.
pub fn expand_sweep(overrides: &Map<String, Value>) -> Result<Vec<Map<String, Value>>> {
    let mut combos = vec![Map::new()];
    for (key, value) in overrides.iter() {
        match value {
            Value::Array(options) => {
                if options.is_empty() {
                    return Err(anyhow!("sweep parameter '{}' has no values", key));
                }
                let mut next = Vec::with_capacity(combos.len() * options.len());
                for combo in combos.iter() {
                    for option in options {
                        let mut c = combo.clone();
                        c.insert(key.clone(), option.clone());
                        next.push(c);
                    }
                }
                combos = next;
            }
            other => {
                for combo in combos.iter_mut() {
                    combo.insert(key.clone(), other.clone());
                }
            }
        }
    }
    Ok(combos)
}

pub fn working_root(tmp_dir: &Path, iteration: usize) -> PathBuf {
    tmp_dir
        .join(format!("{:08}", iteration))
        .join(BENCHMARK_NAME)
}

pub fn archive_root(archive_dir: &Path, iteration: usize) -> PathBuf {
    archive_dir
        .join("results")
        .join(format!("{:08}", iteration))
        .join(BENCHMARK_NAME)
}

pub fn plan_runs(file: &RunFile, archive_dir: &Path) -> Result<Vec<RunPlan>> {
    let combos = expand_sweep(&file.overrides)?;
    let clients = file.cluster.clients.len();
    let mut plans = Vec::new();
    for iteration in 0..file.cluster.iterations {
        let mut seen = HashSet::new();
        for combo in combos.iter() {
            let config = EffectiveConfig::resolve(combo)?;
            let identity = RunIdentity::from_config(&config, clients);
            if !seen.insert(identity.clone()) {
                warn!(
                    iteration,
                    path = %identity.path_under(Path::new("")).display(),
                    "sweep combinations share an archive path; later ones will be skipped"
                );
            }
            plans.push(RunPlan {
                iteration,
                run_dir: identity.path_under(&working_root(&file.cluster.tmp_dir, iteration)),
                archive_dir: identity.path_under(&archive_root(archive_dir, iteration)),
                config,
                identity,
            });
        }
    }
    Ok(plans)
}
