use crate::collaborators::{run_on, Collaborators};
use crate::config::ClusterSettings;
use crate::error::RunError;
use crate::fanout::{dispatch_all, VolumeCommand};
use crate::fs_util::{atomic_write_json_pretty, ensure_dir, shell_quote};
use crate::job_file::{build_job_descriptor, dispatch_command};
use crate::nodes::NodeSet;
use crate::path_identity::exists;
use crate::provision::provision;
use crate::recovery::{node_wide_kill, RecoveryCoordinator};
use crate::sweep::RunPlan;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Existing,
    Clean,
    ScrubCheck,
    IdleMeasure,
    Sync,
    Provision,
    MakeDir,
    StageDescriptors,
    DropCaches,
    DumpClusterConfig,
    MonitorStart,
    Settle,
    Fanout,
    MonitorStop,
    DumpHistoricOps,
    SyncResults,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub archive_dir: PathBuf,
    pub dispatched: usize,
    pub recovery_test: bool,
    pub recovery_aborted: bool,
    pub output_files: usize,
    pub descriptor_files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Skipped { archive_dir: PathBuf },
    Completed(RunReport),
}

pub fn staging_dir(archive_dir: &Path) -> PathBuf {
    let name = archive_dir
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    archive_dir.with_file_name(format!("{}.inprogress", name))
}

/// Marks an abandoned staging directory with the phase it died in.
struct StagingGuard {
    dir: PathBuf,
    phase: Phase,
    done: bool,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = atomic_write_json_pretty(
                &self.dir.join("run_state.json"),
                &json!({
                    "schema_version": "run_state_v1",
                    "status": "failed",
                    "phase": format!("{:?}", self.phase),
                    "updated_at": Utc::now().to_rfc3339(),
                }),
            );
        }
    }
}

struct FanoutResult {
    dispatched: usize,
    aborted: bool,
}

/// Drives one planned run through its lifecycle. State lives only as long as
/// the controller does.
pub struct RunController<'a> {
    plan: &'a RunPlan,
    cluster: &'a ClusterSettings,
    collab: Collaborators,
    phase: Phase,
    staging: Option<StagingGuard>,
}

impl<'a> RunController<'a> {
    pub fn new(plan: &'a RunPlan, cluster: &'a ClusterSettings, collab: Collaborators) -> Self {
        Self {
            plan,
            cluster,
            collab,
            phase: Phase::NotStarted,
            staging: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
        if let Some(guard) = self.staging.as_mut() {
            guard.phase = phase;
        }
    }

    fn remote(&self, nodes: &NodeSet, command: &str) -> Result<(), RunError> {
        run_on(self.collab.transport.as_ref(), nodes, command)?;
        Ok(())
    }

    fn monitored<F>(&self, dir: &Path, f: F) -> Result<(), RunError>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        self.collab.monitor.start(dir)?;
        let result = f();
        let stopped = self.collab.monitor.stop(None);
        result?;
        stopped?;
        Ok(())
    }

    pub fn execute(mut self) -> Result<RunOutcome, RunError> {
        let plan = self.plan;
        let config = &plan.config;
        let run_dir = plan.run_dir.as_path();
        let archive_dir = plan.archive_dir.as_path();

        if exists(archive_dir) {
            self.enter(Phase::Existing);
            return Ok(RunOutcome::Skipped {
                archive_dir: archive_dir.to_path_buf(),
            });
        }

        let started_at = Utc::now();
        let staging = staging_dir(archive_dir);
        if staging.exists() {
            warn!(staging = %staging.display(), "removing staging left by an earlier attempt");
            fs::remove_dir_all(&staging)
                .map_err(|e| anyhow!("failed to remove {}: {}", staging.display(), e))?;
        }
        ensure_dir(&staging)?;
        self.staging = Some(StagingGuard {
            dir: staging.clone(),
            phase: self.phase,
            done: false,
        });

        let all_nodes = self.cluster.all_nodes();
        let clients = self.cluster.clients.clone();
        let recovery_active = self.collab.cluster.recovery_test_configured();
        let run_glob = format!("{}/*", run_dir.display());
        info!(
            mode = %config.mode,
            op_size = config.op_size,
            iodepth = config.iodepth,
            run_dir = %run_dir.display(),
            recovery_active,
            "starting librbdfio run"
        );

        self.enter(Phase::Clean);
        self.remote(
            &all_nodes,
            &format!("rm -rf -- {}", shell_quote(&run_dir.to_string_lossy())),
        )?;

        self.enter(Phase::ScrubCheck);
        info!("running scrub monitoring");
        let cluster = self.collab.cluster.clone();
        self.monitored(&run_dir.join("scrub_monitoring"), || cluster.check_scrub())?;

        self.enter(Phase::IdleMeasure);
        info!(seconds = config.idle_sleep, "pausing for idle monitoring");
        let idle = Duration::from_secs(config.idle_sleep);
        self.monitored(&run_dir.join("idle_monitoring"), || {
            thread::sleep(idle);
            Ok(())
        })?;

        self.enter(Phase::Sync);
        self.collab.sync.sync_tree(&run_glob, &staging)?;

        self.enter(Phase::Provision);
        provision(
            self.collab.cluster.as_ref(),
            self.collab.monitor.as_ref(),
            config,
            &clients,
            run_dir,
        )?;

        self.enter(Phase::MakeDir);
        self.remote(
            &all_nodes,
            &format!("mkdir -p -m0755 -- {}", shell_quote(&run_dir.to_string_lossy())),
        )?;

        self.enter(Phase::StageDescriptors);
        let commands = self.stage_descriptors(&clients, &staging, recovery_active)?;

        self.enter(Phase::DropCaches);
        self.remote(
            &all_nodes,
            "sync; echo 3 | sudo tee /proc/sys/vm/drop_caches > /dev/null",
        )?;

        self.enter(Phase::DumpClusterConfig);
        self.collab.cluster.dump_config(run_dir)?;

        self.enter(Phase::MonitorStart);
        self.collab.monitor.start(run_dir)?;

        self.enter(Phase::Settle);
        thread::sleep(Duration::from_secs(config.settle_time));

        self.enter(Phase::Fanout);
        info!(mode = %config.mode, "running rbd fio test");
        let fanout = self.fan_out(&clients, commands, recovery_active);

        self.enter(Phase::MonitorStop);
        let stopped = self.collab.monitor.stop(Some(run_dir));
        let fanout = match (fanout, stopped) {
            (Ok(f), Ok(())) => f,
            (Ok(_), Err(e)) => return Err(e.into()),
            (Err(e), stopped) => {
                if let Err(stop_err) = stopped {
                    warn!(error = %stop_err, "failed to stop monitoring after failed run");
                }
                return Err(e);
            }
        };

        self.enter(Phase::DumpHistoricOps);
        self.collab.cluster.dump_historic_ops(run_dir)?;

        self.enter(Phase::SyncResults);
        self.collab.sync.sync_tree(&run_glob, &staging)?;
        write_run_info(plan, &clients, &staging, recovery_active, &fanout, started_at)?;
        if let Some(parent) = archive_dir.parent() {
            ensure_dir(parent)?;
        }
        fs::rename(&staging, archive_dir).map_err(|e| {
            anyhow!(
                "failed to move {} to {}: {}",
                staging.display(),
                archive_dir.display(),
                e
            )
        })?;
        if let Some(guard) = self.staging.as_mut() {
            guard.done = true;
        }

        let (output_files, descriptor_files) = archive_inventory(archive_dir);
        self.enter(Phase::Done);
        info!(
            archive_dir = %archive_dir.display(),
            output_files,
            descriptor_files,
            "run archived"
        );
        Ok(RunOutcome::Completed(RunReport {
            archive_dir: archive_dir.to_path_buf(),
            dispatched: fanout.dispatched,
            recovery_test: recovery_active,
            recovery_aborted: fanout.aborted,
            output_files,
            descriptor_files,
        }))
    }

    /// Writes every volume's descriptor locally, then places it on every
    /// client. A client missing its copy fails the run.
    fn stage_descriptors(
        &self,
        clients: &NodeSet,
        staging: &Path,
        recovery_active: bool,
    ) -> Result<Vec<VolumeCommand>, RunError> {
        let config = &self.plan.config;
        let run_dir = self.plan.run_dir.as_path();
        let mut commands = Vec::with_capacity(config.volumes_per_client);
        for volume in 0..config.volumes_per_client {
            let descriptor = build_job_descriptor(config, volume, run_dir, recovery_active);
            let local = descriptor.stage(staging)?;
            self.collab
                .transport
                .copy_file_to_nodes(clients, &local, &descriptor.remote_path(run_dir))
                .map_err(|e| RunError::Dispatch {
                    volume,
                    message: format!("job file distribution: {:#}", e),
                })?;
            commands.push(VolumeCommand {
                volume,
                command: dispatch_command(config, volume, run_dir),
            });
        }
        Ok(commands)
    }

    fn fan_out(
        &self,
        clients: &NodeSet,
        commands: Vec<VolumeCommand>,
        recovery_active: bool,
    ) -> Result<FanoutResult, RunError> {
        let mut coordinator = RecoveryCoordinator::new();
        let mut abort_fired = None;
        if recovery_active {
            let (abort, fired) = node_wide_kill(
                self.collab.transport.clone(),
                clients.clone(),
                self.plan.config.process_name(),
            );
            coordinator.start(self.collab.cluster.as_ref(), &self.plan.run_dir, abort)?;
            abort_fired = Some(fired);
        }

        let report = dispatch_all(self.collab.transport.as_ref(), clients, &commands)
            .map(|fanout| fanout.join_all());
        let aborted = abort_fired
            .as_ref()
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false);
        let workload = report.and_then(|mut report| {
            if aborted {
                let killed = report.excuse_killed();
                if killed > 0 {
                    warn!(
                        killed,
                        total = report.dispatched,
                        "workload processes ended by recovery abort"
                    );
                }
            }
            report.into_result()
        });

        let recovery = coordinator.wait();
        match (workload, recovery) {
            (Ok(dispatched), Ok(())) => Ok(FanoutResult {
                dispatched,
                aborted,
            }),
            (Err(w), Ok(())) => Err(w),
            (Ok(_), Err(r)) => Err(r),
            (Err(w), Err(r)) => Err(RunError::WorkloadAndRecovery {
                workload: Box::new(w),
                recovery: r.to_string(),
            }),
        }
    }
}

fn write_run_info(
    plan: &RunPlan,
    clients: &NodeSet,
    staging: &Path,
    recovery_active: bool,
    fanout: &FanoutResult,
    started_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    let config_value = serde_json::to_value(&plan.config)?;
    let digest = hex::encode(Sha256::digest(serde_json::to_vec(&config_value)?));
    let info = json!({
        "schema_version": "run_info_v1",
        "benchmark": crate::sweep::BENCHMARK_NAME,
        "iteration": plan.iteration,
        "identity": plan.identity,
        "run_dir": plan.run_dir.display().to_string(),
        "archive_dir": plan.archive_dir.display().to_string(),
        "clients": clients.hosts(),
        "volumes_dispatched": fanout.dispatched,
        "recovery_test": recovery_active,
        "recovery_aborted": fanout.aborted,
        "effective_config": config_value,
        "config_digest": format!("sha256:{}", digest),
        "started_at": started_at.to_rfc3339(),
        "finished_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&staging.join("run_info.json"), &info)
}

/// Counts workload outputs and descriptor copies under `dir`.
pub fn archive_inventory(dir: &Path) -> (usize, usize) {
    let mut outputs = 0;
    let mut descriptors = 0;
    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with("output.") {
            outputs += 1;
        } else if name.starts_with("fio_job_file.") {
            descriptors += 1;
        }
    }
    (outputs, descriptors)
}
