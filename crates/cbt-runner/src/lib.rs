pub mod ceph;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod fanout;
pub mod fs_util;
pub mod job_file;
pub mod monitoring;
pub mod nodes;
pub mod path_identity;
pub mod pdsh;
pub mod provision;
pub mod recovery;
pub mod sweep;

#[cfg(test)]
mod testing;

pub use collaborators::Collaborators;
pub use config::{load_run_file, ClusterSettings, EffectiveConfig, Mode, RunFile};
pub use controller::{RunController, RunOutcome, RunReport};
pub use error::RunError;
pub use sweep::{plan_runs, RunPlan};

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Adapters that drive a real cluster over pdsh/pdcp.
pub fn default_collaborators(cluster: &ClusterSettings) -> Collaborators {
    let transport: Arc<dyn collaborators::Transport> = Arc::new(pdsh::PdshTransport::default());
    let all_nodes = cluster.all_nodes();
    Collaborators {
        cluster: Arc::new(ceph::CephCluster::new(transport.clone(), cluster.clone())),
        monitor: Arc::new(monitoring::CollectlMonitor::new(
            transport.clone(),
            all_nodes.clone(),
        )),
        sync: Arc::new(pdsh::RpdcpSync::new(all_nodes)),
        transport,
    }
}

/// Archive root from the command line, falling back to the run file.
pub fn resolve_archive_dir(file: &RunFile, cli_archive: Option<&Path>) -> Result<PathBuf> {
    cli_archive
        .map(Path::to_path_buf)
        .or_else(|| file.cluster.archive_dir.clone())
        .ok_or_else(|| anyhow!("no archive directory: pass --archive or set cluster.archive_dir"))
}

pub fn run_plan(
    plan: &RunPlan,
    cluster: &ClusterSettings,
    collab: &Collaborators,
) -> Result<RunOutcome, RunError> {
    RunController::new(plan, cluster, collab.clone()).execute()
}

/// Executes every planned run in order, stopping at the first failure.
pub fn run_all(
    file: &RunFile,
    archive_dir: &Path,
    collab: &Collaborators,
) -> Result<Vec<RunOutcome>, RunError> {
    let plans = plan_runs(file, archive_dir)?;
    info!(runs = plans.len(), archive_dir = %archive_dir.display(), "planned runs");
    let mut outcomes = Vec::with_capacity(plans.len());
    for plan in plans.iter() {
        outcomes.push(run_plan(plan, &file.cluster, collab)?);
    }
    Ok(outcomes)
}
