// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entering and leaving cluster maintenance mode.

use crate::run::{FAILURE, SUCCESS};
use crate::wait::{CondCheckError, Timeout, WaitError, wait_for_condition};
use display_error_chain::DisplayErrorChain;
use hci_utils::cluster::{
    ClusterControl, ClusterError, ClusterStateReader, DrainStatus,
    FailbackMode, NodeState,
};
use slog::{Logger, error, info};
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum MaintenanceError {
    #[error("failed to read the state of node {node}")]
    Query {
        node: String,
        #[source]
        err: ClusterError,
    },

    #[error("failed to suspend node {node}")]
    Suspend {
        node: String,
        #[source]
        err: ClusterError,
    },

    #[error("the cluster failed to drain roles from node {node}")]
    DrainFailed { node: String },

    #[error("failed to resume node {node}")]
    Resume {
        node: String,
        #[source]
        err: ClusterError,
    },

    #[error(
        "node {node} did not reach {expected} within {timeout:?} \
         (last seen {state}, drain {drain_status})"
    )]
    TimedOut {
        node: String,
        expected: &'static str,
        timeout: Duration,
        state: NodeState,
        drain_status: DrainStatus,
    },
}

/// What [`MaintenanceController::resume`] had to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The node was out of the cluster and has been resumed.
    Resumed,
    /// The node was already Up; nothing was done.
    AlreadyUp,
}

pub struct MaintenanceController {
    log: Logger,
    reader: Arc<dyn ClusterStateReader>,
    control: Arc<dyn ClusterControl>,
    suspend_timeout: Duration,
    resume_timeout: Duration,
    poll_interval: Duration,
}

impl MaintenanceController {
    pub fn new(
        log: &Logger,
        reader: Arc<dyn ClusterStateReader>,
        control: Arc<dyn ClusterControl>,
        suspend_timeout: Duration,
        resume_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let log = log.new(slog::o!("component" => "MaintenanceController"));
        Self {
            log,
            reader,
            control,
            suspend_timeout,
            resume_timeout,
            poll_interval,
        }
    }

    /// Pauses `node` and drains its roles, returning once the cluster
    /// reports the node Paused with the drain completed.
    pub async fn suspend(&self, node: &str) -> Result<(), MaintenanceError> {
        if let Err(err) = self.control.suspend_node(node).await {
            error!(
                self.log, "failed to suspend node";
                "node" => node,
                "outcome" => FAILURE,
                "error" => %DisplayErrorChain::new(&err),
            );
            return Err(MaintenanceError::Suspend {
                node: node.to_string(),
                err,
            });
        }

        let result = self
            .wait_for_node(
                node,
                "Paused",
                self.suspend_timeout,
                |state, drain| match (state, drain) {
                    (_, DrainStatus::Failed) => Err(CondCheckError::Failed(
                        MaintenanceError::DrainFailed {
                            node: node.to_string(),
                        },
                    )),
                    (NodeState::Paused, DrainStatus::Completed) => Ok(()),
                    _ => Err(CondCheckError::NotYet),
                },
            )
            .await;
        match &result {
            Ok(()) => info!(
                self.log, "node suspended";
                "node" => node,
                "outcome" => SUCCESS,
            ),
            Err(err) => error!(
                self.log, "node did not finish suspending";
                "node" => node,
                "outcome" => FAILURE,
                "error" => %DisplayErrorChain::new(err),
            ),
        }
        result
    }

    /// Returns `node` to the cluster with the given failback policy.
    ///
    /// A node that has just restarted reports Down, then Joining, before it
    /// can be resumed; this waits out those states first. Resuming a node
    /// that is already Up does nothing and succeeds, so this is safe to call
    /// when an earlier attempt may already have worked.
    pub async fn resume(
        &self,
        node: &str,
        failback: FailbackMode,
    ) -> Result<ResumeOutcome, MaintenanceError> {
        let state = match self.wait_for_membership(node).await {
            Ok(state) => state,
            Err(err) => {
                error!(
                    self.log, "node is not ready to resume";
                    "node" => node,
                    "outcome" => FAILURE,
                    "error" => %DisplayErrorChain::new(&err),
                );
                return Err(err);
            }
        };
        if state == NodeState::Up {
            info!(
                self.log, "resume skipped: node already up";
                "node" => node,
                "outcome" => SUCCESS,
            );
            return Ok(ResumeOutcome::AlreadyUp);
        }

        if let Err(err) = self.control.resume_node(node, failback).await {
            error!(
                self.log, "failed to resume node";
                "node" => node,
                "state" => %state,
                "outcome" => FAILURE,
                "error" => %DisplayErrorChain::new(&err),
            );
            return Err(MaintenanceError::Resume {
                node: node.to_string(),
                err,
            });
        }

        let result = self
            .wait_for_node(node, "Up", self.resume_timeout, |state, _| {
                if state == NodeState::Up {
                    Ok(())
                } else {
                    Err(CondCheckError::NotYet)
                }
            })
            .await;
        match result {
            Ok(()) => {
                info!(
                    self.log, "node resumed";
                    "node" => node,
                    "failback" => %failback,
                    "outcome" => SUCCESS,
                );
                Ok(ResumeOutcome::Resumed)
            }
            Err(err) => {
                error!(
                    self.log, "node did not finish resuming";
                    "node" => node,
                    "outcome" => FAILURE,
                    "error" => %DisplayErrorChain::new(&err),
                );
                Err(err)
            }
        }
    }

    /// Waits until `node` is a member of the cluster again, returning the
    /// first state it reports other than Down or Joining.
    async fn wait_for_membership(
        &self,
        node: &str,
    ) -> Result<NodeState, MaintenanceError> {
        let rejoining = Cell::new(false);
        let rejoining = &rejoining;
        let state = self
            .wait_for_node(
                node,
                "Up or Paused",
                self.resume_timeout,
                move |state, _| match state {
                    NodeState::Down | NodeState::Joining => {
                        if !rejoining.replace(true) {
                            info!(
                                self.log, "waiting for node to rejoin";
                                "node" => node,
                                "state" => %state,
                            );
                        }
                        Err(CondCheckError::NotYet)
                    }
                    state => Ok(state),
                },
            )
            .await?;
        if rejoining.get() {
            info!(
                self.log, "node rejoined the cluster";
                "node" => node,
                "state" => %state,
            );
        }
        Ok(state)
    }

    /// Polls `node` until `check` accepts its state or `timeout` passes.
    async fn wait_for_node<T, F>(
        &self,
        node: &str,
        expected: &'static str,
        timeout: Duration,
        check: F,
    ) -> Result<T, MaintenanceError>
    where
        F: Fn(
            NodeState,
            DrainStatus,
        ) -> Result<T, CondCheckError<MaintenanceError>>,
    {
        let last_seen = Cell::new((NodeState::Unknown, DrainStatus::Unknown));
        let last_seen = &last_seen;
        let check = &check;
        let result = wait_for_condition(
            move || async move {
                let current = self.reader.get_node(node).await.map_err(|err| {
                    MaintenanceError::Query { node: node.to_string(), err }
                })?;
                last_seen.set((current.state, current.drain_status));
                check(current.state, current.drain_status)
            },
            self.poll_interval,
            Timeout::from_now(timeout),
        )
        .await;
        result.map_err(|err| match err {
            WaitError::PermanentError(err) => err,
            WaitError::TimedOut(elapsed) => {
                let (state, drain_status) = last_seen.get();
                MaintenanceError::TimedOut {
                    node: node.to_string(),
                    expected,
                    timeout: elapsed.duration(),
                    state,
                    drain_status,
                }
            }
        })
    }
}
