//! Narrow interfaces to the systems the orchestrator drives but does not own:
//! the storage cluster, the remote-execution transport, resource monitoring,
//! and result collection.

use crate::nodes::NodeSet;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Exit status shells report for a process ended by SIGKILL.
pub const SIGKILL_EXIT: i32 = 128 + 9;

/// A remote command that finished unsuccessfully. `status` is `None` when
/// the local transport process itself was ended by a signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{command} failed ({}): {stderr_tail}", describe_status(*.status))]
pub struct CommandFailed {
    pub command: String,
    pub status: Option<i32>,
    pub stderr_tail: String,
}

fn describe_status(status: Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl CommandFailed {
    pub fn killed(&self) -> bool {
        self.status == Some(SIGKILL_EXIT)
    }
}

/// True when `err` is a remote command that died from SIGKILL rather than
/// failing on its own.
pub fn killed_by_sigkill(err: &anyhow::Error) -> bool {
    err.downcast_ref::<CommandFailed>()
        .map(CommandFailed::killed)
        .unwrap_or(false)
}

/// A dispatched remote command. Joining blocks until every addressed host has
/// finished; a non-zero exit on any host is an error.
pub trait DispatchHandle: Send {
    fn join(self: Box<Self>) -> Result<CommandOutput>;
}

pub trait Transport: Send + Sync {
    /// Issues `command` on every node in `nodes` without waiting for it.
    fn dispatch(&self, nodes: &NodeSet, command: &str) -> Result<Box<dyn DispatchHandle>>;

    /// Places `local` at `remote` on every node. Failure on any node fails
    /// the whole copy.
    fn copy_file_to_nodes(&self, nodes: &NodeSet, local: &Path, remote: &Path) -> Result<()>;
}

pub fn run_on(transport: &dyn Transport, nodes: &NodeSet, command: &str) -> Result<CommandOutput> {
    transport.dispatch(nodes, command)?.join()
}

/// Forcibly ends every in-flight workload process on every client.
pub type AbortCallback = Arc<dyn Fn() + Send + Sync>;

pub trait RecoveryHandle: Send {
    /// Blocks until the recovery test reports completion.
    fn wait(self: Box<Self>) -> Result<()>;
}

pub trait Cluster: Send + Sync {
    fn check_scrub(&self) -> Result<()>;
    fn dump_config(&self, dir: &Path) -> Result<()>;
    fn dump_historic_ops(&self, dir: &Path) -> Result<()>;
    fn remove_pool(&self, name: &str, profile: &str) -> Result<()>;
    fn make_pool(&self, name: &str, profile: &str) -> Result<()>;
    fn make_volume(&self, name: &str, size_mb: u64, pool: &str, order: u32) -> Result<()>;
    fn recovery_test_configured(&self) -> bool;
    fn start_recovery_test(
        &self,
        dir: &Path,
        abort: AbortCallback,
    ) -> Result<Box<dyn RecoveryHandle>>;
}

pub trait Monitor: Send + Sync {
    fn start(&self, dir: &Path) -> Result<()>;
    fn stop(&self, dir: Option<&Path>) -> Result<()>;
}

pub trait TreeSync: Send + Sync {
    /// Collects everything matching `source_glob` from the fleet into `dest`.
    fn sync_tree(&self, source_glob: &str, dest: &Path) -> Result<()>;
}

/// The full set of collaborators one run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn Cluster>,
    pub transport: Arc<dyn Transport>,
    pub monitor: Arc<dyn Monitor>,
    pub sync: Arc<dyn TreeSync>,
}
