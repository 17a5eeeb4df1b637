use crate::collaborators::{run_on, AbortCallback, Cluster, RecoveryHandle, Transport};
use crate::error::RunError;
use crate::nodes::NodeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    NotStarted,
    Running,
    Completed,
}

/// Builds the abort callback handed to the recovery test.
///
/// This is a node-wide kill: every process named `process_name` on every
/// client dies, including ones that do not belong to this run. Remote
/// process identities are not tracked, so nothing narrower is possible.
/// The returned flag records whether the callback has fired.
pub fn node_wide_kill(
    transport: Arc<dyn Transport>,
    clients: NodeSet,
    process_name: &str,
) -> (AbortCallback, Arc<AtomicBool>) {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let command = format!("sudo killall -9 {}", process_name);
    let callback: AbortCallback = Arc::new(move || {
        flag.store(true, Ordering::SeqCst);
        warn!(command = %command, nodes = %clients.target_list(), "aborting workload on all clients");
        if let Err(e) = run_on(transport.as_ref(), &clients, &command) {
            warn!(error = %e, "workload kill reported failure");
        }
    });
    (callback, fired)
}

pub struct RecoveryCoordinator {
    state: RecoveryState,
    handle: Option<Box<dyn RecoveryHandle>>,
}

impl Default for RecoveryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryCoordinator {
    pub fn new() -> Self {
        Self {
            state: RecoveryState::NotStarted,
            handle: None,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn start(
        &mut self,
        cluster: &dyn Cluster,
        dir: &Path,
        abort: AbortCallback,
    ) -> Result<(), RunError> {
        if self.state != RecoveryState::NotStarted {
            return Err(RunError::Recovery(format!(
                "recovery test already {:?}",
                self.state
            )));
        }
        let handle = cluster
            .start_recovery_test(dir, abort)
            .map_err(|e| RunError::Recovery(format!("start: {:#}", e)))?;
        info!(dir = %dir.display(), "recovery test started");
        self.handle = Some(handle);
        self.state = RecoveryState::Running;
        Ok(())
    }

    /// Blocks until the recovery test finishes. A coordinator that never
    /// started completes immediately.
    pub fn wait(&mut self) -> Result<(), RunError> {
        let result = match self.handle.take() {
            Some(handle) => handle
                .wait()
                .map_err(|e| RunError::Recovery(format!("{:#}", e))),
            None => Ok(()),
        };
        if self.state == RecoveryState::Running {
            info!(ok = result.is_ok(), "recovery test finished");
        }
        self.state = RecoveryState::Completed;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Recorder;

    #[test]
    fn start_then_wait_walks_the_states() {
        let rec = Recorder::default();
        let mut coord = RecoveryCoordinator::new();
        assert_eq!(coord.state(), RecoveryState::NotStarted);
        let (abort, _) = node_wide_kill(rec.transport_arc(), NodeSet::default(), "fio");
        coord
            .start(&rec.cluster(), Path::new("/r"), abort)
            .expect("start");
        assert_eq!(coord.state(), RecoveryState::Running);
        coord.wait().expect("wait");
        assert_eq!(coord.state(), RecoveryState::Completed);
        assert_eq!(
            rec.calls(),
            vec!["cluster.start_recovery_test /r", "cluster.recovery_done"]
        );
    }

    #[test]
    fn failed_recovery_is_reported_on_wait() {
        let rec = Recorder::default();
        rec.fail_on("cluster.recovery_done");
        let mut coord = RecoveryCoordinator::new();
        let (abort, _) = node_wide_kill(rec.transport_arc(), NodeSet::default(), "fio");
        coord
            .start(&rec.cluster(), Path::new("/r"), abort)
            .expect("start");
        let err = coord.wait().expect_err("recovery fails");
        assert!(matches!(err, RunError::Recovery(_)));
        assert_eq!(coord.state(), RecoveryState::Completed);
    }

    #[test]
    fn cannot_start_twice() {
        let rec = Recorder::default();
        let mut coord = RecoveryCoordinator::new();
        let (abort, _) = node_wide_kill(rec.transport_arc(), NodeSet::default(), "fio");
        coord
            .start(&rec.cluster(), Path::new("/r"), abort.clone())
            .expect("start");
        assert!(coord.start(&rec.cluster(), Path::new("/r"), abort).is_err());
        coord.wait().expect("wait");
    }

    #[test]
    fn wait_without_start_is_a_no_op() {
        let mut coord = RecoveryCoordinator::new();
        coord.wait().expect("nothing to wait for");
        assert_eq!(coord.state(), RecoveryState::Completed);
    }

    #[test]
    fn abort_kills_workload_on_every_client() {
        let rec = Recorder::default();
        let clients = NodeSet::parse(&["cbt@c1,cbt@c2"], None).expect("clients");
        let (abort, fired) = node_wide_kill(rec.transport_arc(), clients, "fio");
        assert!(!fired.load(Ordering::SeqCst));
        abort();
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(
            rec.calls(),
            vec![
                "transport.dispatch cbt@c1,cbt@c2 sudo killall -9 fio",
                "transport.join sudo killall -9 fio",
            ]
        );
    }
}
