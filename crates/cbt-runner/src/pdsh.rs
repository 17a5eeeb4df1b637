//! Remote execution and file movement over pdsh, pdcp and rpdcp.

use crate::collaborators::{CommandFailed, CommandOutput, DispatchHandle, Transport, TreeSync};
use crate::fs_util::ensure_dir;
use crate::nodes::NodeSet;
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PdshTransport {
    pub pdsh: String,
    pub pdcp: String,
    pub rcmd: String,
}

impl Default for PdshTransport {
    fn default() -> Self {
        Self {
            pdsh: "pdsh".to_string(),
            pdcp: "pdcp".to_string(),
            rcmd: "ssh".to_string(),
        }
    }
}

fn fanout(nodes: &NodeSet) -> String {
    nodes.len().max(1).to_string()
}

fn stderr_tail(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no stderr")
        .trim()
        .to_string()
}

fn check_status(what: &str, output: Output) -> Result<CommandOutput> {
    if !output.status.success() {
        return Err(CommandFailed {
            command: what.to_string(),
            status: output.status.code(),
            stderr_tail: stderr_tail(&output),
        }
        .into());
    }
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

impl PdshTransport {
    pub fn pdsh_args(&self, nodes: &NodeSet, command: &str) -> Vec<String> {
        vec![
            "-S".to_string(),
            "-f".to_string(),
            fanout(nodes),
            "-R".to_string(),
            self.rcmd.clone(),
            "-w".to_string(),
            nodes.target_list(),
            command.to_string(),
        ]
    }

    pub fn pdcp_args(&self, nodes: &NodeSet, local: &Path, remote: &Path) -> Vec<String> {
        vec![
            "-f".to_string(),
            fanout(nodes),
            "-R".to_string(),
            self.rcmd.clone(),
            "-w".to_string(),
            nodes.target_list(),
            local.display().to_string(),
            remote.display().to_string(),
        ]
    }
}

struct PdshHandle {
    child: Child,
    command: String,
}

impl DispatchHandle for PdshHandle {
    fn join(self: Box<Self>) -> Result<CommandOutput> {
        let output = self
            .child
            .wait_with_output()
            .with_context(|| format!("waiting for `{}`", self.command))?;
        check_status(&format!("`{}`", self.command), output)
    }
}

impl Transport for PdshTransport {
    fn dispatch(&self, nodes: &NodeSet, command: &str) -> Result<Box<dyn DispatchHandle>> {
        if nodes.is_empty() {
            return Err(anyhow!("no nodes to run `{}` on", command));
        }
        debug!(nodes = %nodes.target_list(), command, "pdsh");
        let child = Command::new(&self.pdsh)
            .args(self.pdsh_args(nodes, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", self.pdsh))?;
        Ok(Box::new(PdshHandle {
            child,
            command: command.to_string(),
        }))
    }

    fn copy_file_to_nodes(&self, nodes: &NodeSet, local: &Path, remote: &Path) -> Result<()> {
        if nodes.is_empty() {
            return Err(anyhow!("no nodes to copy {} to", local.display()));
        }
        debug!(nodes = %nodes.target_list(), local = %local.display(), remote = %remote.display(), "pdcp");
        let output = Command::new(&self.pdcp)
            .args(self.pdcp_args(nodes, local, remote))
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawning {}", self.pdcp))?;
        check_status(&format!("copy of {}", local.display()), output)?;
        Ok(())
    }
}

/// Pulls remote trees back to the controller with `rpdcp -r`.
#[derive(Debug, Clone)]
pub struct RpdcpSync {
    pub rpdcp: String,
    pub rcmd: String,
    nodes: NodeSet,
}

impl RpdcpSync {
    pub fn new(nodes: NodeSet) -> Self {
        Self {
            rpdcp: "rpdcp".to_string(),
            rcmd: "ssh".to_string(),
            nodes,
        }
    }

    pub fn rpdcp_args(&self, source_glob: &str, dest: &Path) -> Vec<String> {
        vec![
            "-f".to_string(),
            fanout(&self.nodes),
            "-r".to_string(),
            "-R".to_string(),
            self.rcmd.clone(),
            "-w".to_string(),
            self.nodes.target_list(),
            source_glob.to_string(),
            dest.display().to_string(),
        ]
    }
}

impl TreeSync for RpdcpSync {
    /// Hosts that have nothing under `source_glob` make rpdcp exit non-zero;
    /// that is logged rather than failing the run, since not every host
    /// produces every kind of file.
    fn sync_tree(&self, source_glob: &str, dest: &Path) -> Result<()> {
        ensure_dir(dest)?;
        let output = Command::new(&self.rpdcp)
            .args(self.rpdcp_args(source_glob, dest))
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawning {}", self.rpdcp))?;
        if let Err(e) = check_status(&format!("rpdcp of {}", source_glob), output) {
            warn!(error = %e, dest = %dest.display(), "partial result collection");
        }
        Ok(())
    }
}
