//! Per-volume workload dispatch with a join barrier.
//!
//! Every command is issued to the whole client set before any completion is
//! awaited. Joining waits on every handle, with no timeout, even after one
//! of them has failed.

use crate::collaborators::{killed_by_sigkill, DispatchHandle, Transport};
use crate::error::{JoinFailure, RunError};
use crate::nodes::NodeSet;
use tracing::{debug, info, warn};

pub struct VolumeCommand {
    pub volume: usize,
    pub command: String,
}

/// Issued dispatches, one per volume, not yet joined.
pub struct FanOut {
    handles: Vec<(usize, Box<dyn DispatchHandle>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutReport {
    pub dispatched: usize,
    pub acked: usize,
    pub failures: Vec<JoinFailure>,
}

impl FanOutReport {
    /// Drops failures caused by a deliberate SIGKILL of the workload and
    /// returns how many were dropped. Volumes that failed on their own stay.
    pub fn excuse_killed(&mut self) -> usize {
        let before = self.failures.len();
        self.failures.retain(|f| !f.killed);
        before - self.failures.len()
    }

    pub fn into_result(self) -> Result<usize, RunError> {
        if self.failures.is_empty() {
            Ok(self.dispatched)
        } else {
            Err(RunError::Join {
                total: self.dispatched,
                failures: self.failures,
            })
        }
    }
}

fn summarize(failures: &[JoinFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("volume {}: {}", f.volume, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn dispatch_all(
    transport: &dyn Transport,
    nodes: &NodeSet,
    commands: &[VolumeCommand],
) -> Result<FanOut, RunError> {
    let mut handles = Vec::with_capacity(commands.len());
    for cmd in commands {
        debug!(volume = cmd.volume, command = %cmd.command, "dispatching");
        match transport.dispatch(nodes, &cmd.command) {
            Ok(handle) => handles.push((cmd.volume, handle)),
            Err(e) => {
                let issued = FanOut { handles };
                warn!(
                    volume = cmd.volume,
                    outstanding = issued.len(),
                    "dispatch failed; joining already issued volumes"
                );
                let report = issued.join_all();
                let mut message = format!("{:#}", e);
                if !report.failures.is_empty() {
                    warn!(
                        failed = report.failures.len(),
                        issued = report.dispatched,
                        "already issued volumes also failed"
                    );
                    message.push_str(&format!(
                        " (already issued volumes failed: {})",
                        summarize(&report.failures)
                    ));
                }
                return Err(RunError::Dispatch {
                    volume: cmd.volume,
                    message,
                });
            }
        }
    }
    info!(dispatched = handles.len(), nodes = nodes.len(), "workload fan-out issued");
    Ok(FanOut { handles })
}

impl FanOut {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn join_all(self) -> FanOutReport {
        let dispatched = self.handles.len();
        let mut acked = 0;
        let mut failures = Vec::new();
        for (volume, handle) in self.handles {
            match handle.join() {
                Ok(_) => {
                    debug!(volume, "volume completed");
                    acked += 1;
                }
                Err(e) => {
                    warn!(volume, error = %e, "volume exited abnormally");
                    failures.push(JoinFailure {
                        volume,
                        message: format!("{:#}", e),
                        killed: killed_by_sigkill(&e),
                    });
                }
            }
        }
        FanOutReport {
            dispatched,
            acked,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Recorder;

    fn commands(n: usize) -> Vec<VolumeCommand> {
        (0..n)
            .map(|volume| VolumeCommand {
                volume,
                command: format!("run fio_job_file.{}", volume),
            })
            .collect()
    }

    #[test]
    fn issues_every_dispatch_before_joining_any() {
        let rec = Recorder::default();
        let nodes = NodeSet::parse(&["c1,c2"], None).expect("nodes");
        let fanout = dispatch_all(&rec.transport(), &nodes, &commands(3)).expect("dispatch");
        assert_eq!(fanout.len(), 3);
        let report = fanout.join_all();
        assert_eq!(report.acked, 3);
        assert_eq!(report.dispatched, 3);
        assert_eq!(
            rec.calls(),
            vec![
                "transport.dispatch c1,c2 run fio_job_file.0",
                "transport.dispatch c1,c2 run fio_job_file.1",
                "transport.dispatch c1,c2 run fio_job_file.2",
                "transport.join run fio_job_file.0",
                "transport.join run fio_job_file.1",
                "transport.join run fio_job_file.2",
            ]
        );
    }

    #[test]
    fn first_failure_does_not_stop_the_barrier() {
        let rec = Recorder::default();
        rec.fail_join_on("fio_job_file.0");
        let nodes = NodeSet::parse(&["c1"], None).expect("nodes");
        let report = dispatch_all(&rec.transport(), &nodes, &commands(3))
            .expect("dispatch")
            .join_all();
        assert_eq!(report.acked, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].volume, 0);
        let joins = rec
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("transport.join"))
            .count();
        assert_eq!(joins, 3);
        match report.into_result() {
            Err(RunError::Join { failures, total }) => {
                assert_eq!(total, 3);
                assert_eq!(failures[0].volume, 0);
            }
            other => panic!("expected join error, got {:?}", other),
        }
    }

    #[test]
    fn dispatch_error_joins_issued_handles_then_surfaces() {
        let rec = Recorder::default();
        rec.fail_on("transport.dispatch c1 run fio_job_file.1");
        let nodes = NodeSet::parse(&["c1"], None).expect("nodes");
        let err = dispatch_all(&rec.transport(), &nodes, &commands(3))
            .err()
            .expect("dispatch of volume 1 fails");
        assert!(matches!(err, RunError::Dispatch { volume: 1, .. }));
        let calls = rec.calls();
        assert!(calls.contains(&"transport.join run fio_job_file.0".to_string()));
        assert!(!calls.iter().any(|c| c.contains("fio_job_file.2")));
    }

    #[test]
    fn dispatch_error_reports_failures_of_issued_volumes() {
        let rec = Recorder::default();
        rec.fail_on("transport.dispatch c1 run fio_job_file.2");
        rec.fail_join_on("fio_job_file.0");
        let nodes = NodeSet::parse(&["c1"], None).expect("nodes");
        let err = dispatch_all(&rec.transport(), &nodes, &commands(3))
            .err()
            .expect("dispatch of volume 2 fails");
        match err {
            RunError::Dispatch { volume, message } => {
                assert_eq!(volume, 2);
                assert!(message.contains("already issued volumes failed: volume 0:"));
                assert!(!message.contains("volume 1:"));
            }
            other => panic!("expected dispatch error, got {:?}", other),
        }
    }

    #[test]
    fn only_killed_failures_are_excused() {
        let mut report = FanOutReport {
            dispatched: 3,
            acked: 1,
            failures: vec![
                JoinFailure {
                    volume: 0,
                    message: "exit status 1".to_string(),
                    killed: false,
                },
                JoinFailure {
                    volume: 2,
                    message: "exit status 137".to_string(),
                    killed: true,
                },
            ],
        };
        assert_eq!(report.excuse_killed(), 1);
        match report.into_result() {
            Err(RunError::Join { failures, total }) => {
                assert_eq!(total, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].volume, 0);
            }
            other => panic!("expected join error, got {:?}", other),
        }

        let mut all_killed = FanOutReport {
            dispatched: 2,
            acked: 0,
            failures: vec![JoinFailure {
                volume: 1,
                message: "exit status 137".to_string(),
                killed: true,
            }],
        };
        assert_eq!(all_killed.excuse_killed(), 1);
        assert_eq!(all_killed.into_result().expect("excused"), 2);
    }
}
