use crate::collaborators::{Cluster, Monitor};
use crate::config::EffectiveConfig;
use crate::error::RunError;
use crate::nodes::NodeSet;
use std::path::Path;
use tracing::{info, warn};

pub const VOLUME_PREFIX: &str = "cbt-librbdfio";

pub fn volume_name(host: &str, volume: usize) -> String {
    format!("{}-{}-{}", VOLUME_PREFIX, host, volume)
}

/// Recreates the pool and one volume per client per configured multiplicity,
/// inside its own monitoring bracket. The bracket is closed even when
/// provisioning fails.
pub fn provision(
    cluster: &dyn Cluster,
    monitor: &dyn Monitor,
    config: &EffectiveConfig,
    clients: &NodeSet,
    run_dir: &Path,
) -> Result<usize, RunError> {
    monitor
        .start(&run_dir.join("pool_monitoring"))
        .map_err(|e| RunError::Provisioning(format!("monitor start: {:#}", e)))?;
    let result = create_volumes(cluster, config, clients);
    if let Err(e) = monitor.stop(None) {
        warn!(error = %e, "failed to stop pool monitoring");
    }
    result
}

fn create_volumes(
    cluster: &dyn Cluster,
    config: &EffectiveConfig,
    clients: &NodeSet,
) -> Result<usize, RunError> {
    if config.use_existing_volumes {
        info!(pool = %config.poolname, "reusing existing volumes");
        return Ok(0);
    }
    let fail = |what: String, e: anyhow::Error| RunError::Provisioning(format!("{}: {:#}", what, e));
    cluster
        .remove_pool(&config.poolname, &config.pool_profile)
        .map_err(|e| fail(format!("remove pool {}", config.poolname), e))?;
    cluster
        .make_pool(&config.poolname, &config.pool_profile)
        .map_err(|e| fail(format!("create pool {}", config.poolname), e))?;
    let mut created = 0;
    for node in clients.iter() {
        for volume in 0..config.volumes_per_client {
            let name = volume_name(node.host(), volume);
            cluster
                .make_volume(&name, config.vol_size, &config.poolname, config.vol_order)
                .map_err(|e| fail(format!("create volume {}", name), e))?;
            created += 1;
        }
    }
    info!(pool = %config.poolname, volumes = created, "provisioned volumes");
    Ok(created)
}
