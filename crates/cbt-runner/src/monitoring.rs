use crate::collaborators::{run_on, Monitor, Transport};
use crate::fs_util::shell_quote;
use crate::nodes::NodeSet;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Resource monitoring with `collectl` on every node of the cluster.
pub struct CollectlMonitor {
    transport: Arc<dyn Transport>,
    nodes: NodeSet,
}

impl CollectlMonitor {
    pub fn new(transport: Arc<dyn Transport>, nodes: NodeSet) -> Self {
        Self { transport, nodes }
    }

    pub fn start_command(dir: &Path) -> String {
        let dir = shell_quote(&dir.display().to_string());
        format!(
            "mkdir -p -m0755 -- {dir} && nohup collectl -s+mYZ -i 1:10 -F0 -f {dir} > /dev/null 2>&1 &",
            dir = dir
        )
    }

    pub fn stop_command(dir: Option<&Path>) -> String {
        let mut command = "sudo pkill -SIGINT -f collectl || true".to_string();
        if let Some(dir) = dir {
            command.push_str(&format!(
                "; sudo chmod -R a+rX -- {} || true",
                shell_quote(&dir.display().to_string())
            ));
        }
        command
    }
}

impl Monitor for CollectlMonitor {
    fn start(&self, dir: &Path) -> Result<()> {
        debug!(dir = %dir.display(), "starting collectl");
        run_on(self.transport.as_ref(), &self.nodes, &Self::start_command(dir))
            .context("starting collectl")?;
        Ok(())
    }

    fn stop(&self, dir: Option<&Path>) -> Result<()> {
        debug!(dir = ?dir, "stopping collectl");
        run_on(self.transport.as_ref(), &self.nodes, &Self::stop_command(dir))
            .context("stopping collectl")?;
        Ok(())
    }
}
