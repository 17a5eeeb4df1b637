//! Recording fakes for the collaborator traits.

use crate::collaborators::{
    AbortCallback, Cluster, Collaborators, CommandFailed, CommandOutput, DispatchHandle,
    Monitor, RecoveryHandle, TreeSync, Transport, SIGKILL_EXIT,
};
use crate::fs_util::ensure_dir;
use crate::nodes::NodeSet;
use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct Inner {
    calls: Mutex<Vec<String>>,
    fail_prefixes: Mutex<Vec<String>>,
    fail_joins: Mutex<Vec<String>>,
    sync_files: Mutex<Vec<String>>,
    sync_dirs: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, String)>>,
    hold_workload: AtomicBool,
    recovery_configured: AtomicBool,
    recovery_aborts: AtomicBool,
    killed: Mutex<bool>,
    kill_cv: Condvar,
}

impl Inner {
    fn record(&self, call: String) -> Result<()> {
        let fail = self
            .fail_prefixes
            .lock()
            .expect("fail lock")
            .iter()
            .any(|p| call.starts_with(p.as_str()));
        self.calls.lock().expect("calls lock").push(call.clone());
        if fail {
            return Err(anyhow!("injected failure: {}", call));
        }
        Ok(())
    }

    fn join_fails(&self, command: &str) -> bool {
        self.fail_joins
            .lock()
            .expect("fail lock")
            .iter()
            .any(|n| command.contains(n.as_str()))
    }

    fn kill(&self) {
        *self.killed.lock().expect("kill lock") = true;
        self.kill_cv.notify_all();
    }

    fn wait_killed(&self) {
        let mut killed = self.killed.lock().expect("kill lock");
        while !*killed {
            killed = self.kill_cv.wait(killed).expect("kill wait");
        }
    }
}

#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<Inner>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().expect("calls lock").clone()
    }

    /// Any recorded call starting with `prefix` fails after being recorded.
    pub fn fail_on(&self, prefix: &str) {
        self.inner
            .fail_prefixes
            .lock()
            .expect("fail lock")
            .push(prefix.to_string());
    }

    /// Joining a dispatch whose command contains `needle` fails.
    pub fn fail_join_on(&self, needle: &str) {
        self.inner
            .fail_joins
            .lock()
            .expect("fail lock")
            .push(needle.to_string());
    }

    /// Workload dispatches stay running until a kill command is dispatched,
    /// then fail with the SIGKILL exit status. Dispatches marked with
    /// `fail_join_on` are not held and fail at once.
    pub fn hold_workload(&self) {
        self.inner.hold_workload.store(true, Ordering::SeqCst);
    }

    /// Joining a dispatch whose command contains `needle` yields `stdout`.
    pub fn respond(&self, needle: &str, stdout: &str) {
        self.inner
            .responses
            .lock()
            .expect("response lock")
            .push((needle.to_string(), stdout.to_string()));
    }

    pub fn configure_recovery(&self, aborts: bool) {
        self.inner.recovery_configured.store(true, Ordering::SeqCst);
        self.inner.recovery_aborts.store(aborts, Ordering::SeqCst);
    }

    /// Files the fake sync drops into its destination, standing in for
    /// results pulled from the fleet.
    pub fn materialize_on_sync(&self, files: &[&str]) {
        let mut list = self.inner.sync_files.lock().expect("sync lock");
        list.extend(files.iter().map(|f| f.to_string()));
    }

    /// Directories the fake sync creates in its destination.
    pub fn materialize_dirs_on_sync(&self, dirs: &[&str]) {
        let mut list = self.inner.sync_dirs.lock().expect("sync lock");
        list.extend(dirs.iter().map(|d| d.to_string()));
    }

    pub fn cluster(&self) -> FakeCluster {
        FakeCluster {
            inner: self.inner.clone(),
        }
    }

    pub fn monitor(&self) -> FakeMonitor {
        FakeMonitor {
            inner: self.inner.clone(),
        }
    }

    pub fn transport(&self) -> FakeTransport {
        FakeTransport {
            inner: self.inner.clone(),
        }
    }

    pub fn transport_arc(&self) -> Arc<dyn Transport> {
        Arc::new(self.transport())
    }

    pub fn sync(&self) -> FakeSync {
        FakeSync {
            inner: self.inner.clone(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            cluster: Arc::new(self.cluster()),
            transport: self.transport_arc(),
            monitor: Arc::new(self.monitor()),
            sync: Arc::new(self.sync()),
        }
    }
}

pub struct FakeTransport {
    inner: Arc<Inner>,
}

struct FakeHandle {
    inner: Arc<Inner>,
    command: String,
    held: bool,
}

impl DispatchHandle for FakeHandle {
    fn join(self: Box<Self>) -> Result<CommandOutput> {
        if self.held {
            self.inner.wait_killed();
        }
        self.inner.record(format!("transport.join {}", self.command))?;
        if self.held {
            return Err(CommandFailed {
                command: self.command.clone(),
                status: Some(SIGKILL_EXIT),
                stderr_tail: "Killed".to_string(),
            }
            .into());
        }
        if self.inner.join_fails(&self.command) {
            return Err(CommandFailed {
                command: self.command.clone(),
                status: Some(1),
                stderr_tail: "remote exit status 1".to_string(),
            }
            .into());
        }
        let stdout = self
            .inner
            .responses
            .lock()
            .expect("response lock")
            .iter()
            .find(|(n, _)| self.command.contains(n.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
        })
    }
}

impl Transport for FakeTransport {
    fn dispatch(&self, nodes: &NodeSet, command: &str) -> Result<Box<dyn DispatchHandle>> {
        self.inner.record(format!(
            "transport.dispatch {} {}",
            nodes.target_list(),
            command
        ))?;
        if command.contains("killall") {
            self.inner.kill();
        }
        let held = self.inner.hold_workload.load(Ordering::SeqCst)
            && command.contains("fio_job_file")
            && !self.inner.join_fails(command);
        Ok(Box::new(FakeHandle {
            inner: self.inner.clone(),
            command: command.to_string(),
            held,
        }))
    }

    fn copy_file_to_nodes(&self, nodes: &NodeSet, local: &Path, remote: &Path) -> Result<()> {
        self.inner.record(format!(
            "transport.copy {} {} {}",
            nodes.target_list(),
            local.display(),
            remote.display()
        ))
    }
}

pub struct FakeCluster {
    inner: Arc<Inner>,
}

struct FakeRecovery {
    inner: Arc<Inner>,
    thread: thread::JoinHandle<()>,
}

impl RecoveryHandle for FakeRecovery {
    fn wait(self: Box<Self>) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| anyhow!("recovery thread panicked"))?;
        self.inner.record("cluster.recovery_done".to_string())
    }
}

impl Cluster for FakeCluster {
    fn check_scrub(&self) -> Result<()> {
        self.inner.record("cluster.check_scrub".to_string())
    }

    fn dump_config(&self, dir: &Path) -> Result<()> {
        self.inner
            .record(format!("cluster.dump_config {}", dir.display()))
    }

    fn dump_historic_ops(&self, dir: &Path) -> Result<()> {
        self.inner
            .record(format!("cluster.dump_historic_ops {}", dir.display()))
    }

    fn remove_pool(&self, name: &str, profile: &str) -> Result<()> {
        self.inner
            .record(format!("cluster.remove_pool {} {}", name, profile))
    }

    fn make_pool(&self, name: &str, profile: &str) -> Result<()> {
        self.inner
            .record(format!("cluster.make_pool {} {}", name, profile))
    }

    fn make_volume(&self, name: &str, size_mb: u64, pool: &str, order: u32) -> Result<()> {
        self.inner.record(format!(
            "cluster.make_volume {} {} {} {}",
            name, size_mb, pool, order
        ))
    }

    fn recovery_test_configured(&self) -> bool {
        self.inner.recovery_configured.load(Ordering::SeqCst)
    }

    fn start_recovery_test(
        &self,
        dir: &Path,
        abort: AbortCallback,
    ) -> Result<Box<dyn RecoveryHandle>> {
        self.inner
            .record(format!("cluster.start_recovery_test {}", dir.display()))?;
        let aborts = self.inner.recovery_aborts.load(Ordering::SeqCst);
        let thread = thread::spawn(move || {
            if aborts {
                thread::sleep(Duration::from_millis(50));
                abort();
            }
        });
        Ok(Box::new(FakeRecovery {
            inner: self.inner.clone(),
            thread,
        }))
    }
}

pub struct FakeMonitor {
    inner: Arc<Inner>,
}

impl Monitor for FakeMonitor {
    fn start(&self, dir: &Path) -> Result<()> {
        self.inner
            .record(format!("monitor.start {}", dir.display()))
    }

    fn stop(&self, dir: Option<&Path>) -> Result<()> {
        let dir = dir
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        self.inner.record(format!("monitor.stop {}", dir))
    }
}

pub struct FakeSync {
    inner: Arc<Inner>,
}

impl TreeSync for FakeSync {
    fn sync_tree(&self, source_glob: &str, dest: &Path) -> Result<()> {
        self.inner
            .record(format!("sync.sync_tree {} {}", source_glob, dest.display()))?;
        ensure_dir(dest)?;
        let files = self.inner.sync_files.lock().expect("sync lock").clone();
        for file in files {
            std::fs::write(dest.join(file), b"synced")?;
        }
        let dirs = self.inner.sync_dirs.lock().expect("sync lock").clone();
        for dir in dirs {
            ensure_dir(&dest.join(dir))?;
        }
        Ok(())
    }
}
