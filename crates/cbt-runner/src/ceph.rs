//! Cluster adapter that drives the `ceph` and `rbd` command-line tools on
//! the head and OSD hosts.

use crate::collaborators::{run_on, AbortCallback, Cluster, RecoveryHandle, Transport};
use crate::config::{ClusterSettings, RecoveryTestSettings};
use crate::fs_util::shell_quote;
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

const SCRUB_POLL: Duration = Duration::from_secs(10);

pub struct CephCluster {
    transport: Arc<dyn Transport>,
    settings: Arc<ClusterSettings>,
    scrub_poll: Duration,
}

impl CephCluster {
    pub fn new(transport: Arc<dyn Transport>, settings: ClusterSettings) -> Self {
        Self {
            transport,
            settings: Arc::new(settings),
            scrub_poll: SCRUB_POLL,
        }
    }

    fn on_head(&self, command: &str) -> Result<String> {
        Ok(run_on(self.transport.as_ref(), &self.settings.head, command)?.stdout)
    }

    fn on_osds(&self, command: &str) -> Result<()> {
        if self.settings.osds.is_empty() {
            debug!(command, "no osd hosts configured, skipping");
            return Ok(());
        }
        run_on(self.transport.as_ref(), &self.settings.osds, command)?;
        Ok(())
    }

    fn scrub_count_command(&self) -> String {
        format!(
            "{} pg dump pgs_brief 2>/dev/null | grep -c scrub || true",
            self.settings.ceph_cmd
        )
    }

    /// Runs `subcommand` against every OSD admin socket on each OSD host,
    /// one output file per daemon.
    fn admin_socket_dump(&self, subcommand: &str, prefix: &str, dir: &Path) -> String {
        let dir = shell_quote(&dir.display().to_string());
        format!(
            "for s in /var/run/ceph/ceph-osd.*.asok; do [ -e \"$s\" ] || continue; \
             sudo {} --admin-daemon \"$s\" {} > {}/{}.$(basename \"$s\" .asok).json; done",
            self.settings.ceph_cmd, subcommand, dir, prefix
        )
    }

    pub fn make_pool_command(&self, name: &str, profile: &str) -> String {
        let p = self.settings.pool_profile(profile);
        let ceph = &self.settings.ceph_cmd;
        let mut command = format!(
            "sudo {} osd pool create {} {} {}",
            ceph,
            name,
            p.pg_size,
            p.pgp_size.unwrap_or(p.pg_size)
        );
        if let Some(size) = p.replication {
            command.push_str(&format!(" && sudo {} osd pool set {} size {}", ceph, name, size));
        }
        command.push_str(&format!(
            " && sudo {} osd pool application enable {} rbd",
            ceph, name
        ));
        command
    }
}

/// Sums the per-host counts pdsh prints as `host: N`.
fn parse_scrub_count(stdout: &str) -> u64 {
    stdout
        .lines()
        .filter_map(|l| l.split_whitespace().last())
        .filter_map(|n| n.parse::<u64>().ok())
        .sum()
}

impl Cluster for CephCluster {
    fn check_scrub(&self) -> Result<()> {
        let command = self.scrub_count_command();
        loop {
            let scrubbing = parse_scrub_count(&self.on_head(&command)?);
            if scrubbing == 0 {
                return Ok(());
            }
            info!(scrubbing, "waiting for scrub to finish");
            thread::sleep(self.scrub_poll);
        }
    }

    fn dump_config(&self, dir: &Path) -> Result<()> {
        self.on_osds(&self.admin_socket_dump("config show", "ceph_settings", dir))
            .context("dumping osd configuration")
    }

    fn dump_historic_ops(&self, dir: &Path) -> Result<()> {
        self.on_osds(&self.admin_socket_dump("dump_historic_ops", "historic_ops", dir))
            .context("dumping historic ops")
    }

    fn remove_pool(&self, name: &str, _profile: &str) -> Result<()> {
        self.on_head(&format!(
            "sudo {} osd pool delete {} {} --yes-i-really-really-mean-it",
            self.settings.ceph_cmd, name, name
        ))
        .with_context(|| format!("removing pool {}", name))?;
        Ok(())
    }

    fn make_pool(&self, name: &str, profile: &str) -> Result<()> {
        self.on_head(&self.make_pool_command(name, profile))
            .with_context(|| format!("creating pool {}", name))?;
        Ok(())
    }

    fn make_volume(&self, name: &str, size_mb: u64, pool: &str, order: u32) -> Result<()> {
        self.on_head(&format!(
            "sudo {} create {} --size {} --pool {} --order {}",
            self.settings.rbd_cmd, name, size_mb, pool, order
        ))
        .with_context(|| format!("creating volume {}/{}", pool, name))?;
        Ok(())
    }

    fn recovery_test_configured(&self) -> bool {
        self.settings.recovery_test_configured()
    }

    fn start_recovery_test(
        &self,
        dir: &Path,
        abort: AbortCallback,
    ) -> Result<Box<dyn RecoveryHandle>> {
        let test = self
            .settings
            .recovery_test
            .clone()
            .ok_or_else(|| anyhow!("cluster.recovery_test is not configured"))?;
        let runner = RecoveryRun {
            transport: self.transport.clone(),
            settings: self.settings.clone(),
            test,
        };
        info!(dir = %dir.display(), osds = ?runner.test.osds, "starting recovery test");
        let thread = thread::Builder::new()
            .name("recovery-test".to_string())
            .spawn(move || runner.run(abort))
            .context("spawning recovery test thread")?;
        Ok(Box::new(CephRecovery { thread }))
    }
}

struct RecoveryRun {
    transport: Arc<dyn Transport>,
    settings: Arc<ClusterSettings>,
    test: RecoveryTestSettings,
}

impl RecoveryRun {
    fn ceph(&self, args: &str) -> Result<String> {
        let command = format!("{} {}", self.settings.ceph_cmd, args);
        Ok(run_on(self.transport.as_ref(), &self.settings.head, &command)?.stdout)
    }

    fn wait_healthy(&self) -> Result<()> {
        loop {
            if self.ceph("health")?.contains("HEALTH_OK") {
                return Ok(());
            }
            thread::sleep(Duration::from_secs(self.test.poll_interval));
        }
    }

    fn set_osds(&self, state: &str) -> Result<()> {
        let ids: Vec<String> = self.test.osds.iter().map(|id| id.to_string()).collect();
        info!(state, osds = %ids.join(","), "marking osds");
        self.ceph(&format!("osd {} {}", state, ids.join(" ")))?;
        Ok(())
    }

    fn run(self, abort: AbortCallback) -> Result<()> {
        thread::sleep(Duration::from_secs(self.test.pre_time));
        let result = self
            .set_osds("out")
            .and_then(|_| self.wait_healthy())
            .and_then(|_| self.set_osds("in"))
            .and_then(|_| self.wait_healthy())
            .map(|_| thread::sleep(Duration::from_secs(self.test.post_time)));
        // The workload is time-bounded only by this callback, so it fires
        // whether or not recovery itself went cleanly.
        abort();
        result
    }
}

struct CephRecovery {
    thread: JoinHandle<Result<()>>,
}

impl RecoveryHandle for CephRecovery {
    fn wait(self: Box<Self>) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| anyhow!("recovery test thread panicked"))?
    }
}
