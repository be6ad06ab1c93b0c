// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors that end an orchestration run.

use crate::continuation::{ContinuationError, ContinuationOp};
use crate::drain::DrainError;
use crate::maintenance::MaintenanceError;
use hci_utils::ExecutionError;
use hci_utils::cluster::{ClusterError, NodeState};
use hci_utils::storage::{HealthStatus, OperationalStatus};
use hci_utils::windows_update::{ResultCode, UpdateError};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("preconditions for maintenance do not hold")]
    Precondition(#[from] PreconditionError),

    #[error("failed to discover pending updates")]
    Discovery(#[source] UpdateError),

    #[error("failed to drain shared volumes")]
    Drain(#[source] DrainError),

    #[error("failed to enter maintenance mode")]
    MaintenanceEntry(#[source] MaintenanceError),

    #[error("failed to leave maintenance mode")]
    MaintenanceExit(#[source] MaintenanceError),

    #[error("failed to install updates")]
    Install(#[from] InstallError),

    #[error("failed to {op} the post-reboot continuation")]
    Continuation {
        op: ContinuationOp,
        #[source]
        err: ContinuationError,
    },

    #[error("failed to schedule a restart")]
    Restart(#[source] ExecutionError),
}

#[derive(Debug, thiserror::Error)]
pub enum PreconditionError {
    #[error("failed to read cluster state")]
    Query(#[source] ClusterError),

    #[error("node {node} is not a member of the cluster")]
    LocalNodeMissing { node: String },

    #[error("no cluster node other than {node} is Up to take its volumes")]
    NoPartner { node: String },

    #[error("cluster is not healthy: {}", DisplayViolations(.0))]
    Unhealthy(Vec<Violation>),
}

/// One reason the cluster is not safe to take a node out of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    NodeNotUp { node: String, state: NodeState },
    VirtualDiskUnhealthy {
        disk: String,
        health: HealthStatus,
        operational: OperationalStatus,
    },
    SubsystemUnhealthy { subsystem: String, health: HealthStatus },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::NodeNotUp { node, state } => {
                write!(f, "node {node} is {state}")
            }
            Violation::VirtualDiskUnhealthy { disk, health, operational } => {
                write!(f, "virtual disk {disk} is {health}/{operational}")
            }
            Violation::SubsystemUnhealthy { subsystem, health } => {
                write!(f, "storage subsystem {subsystem} is {health}")
            }
        }
    }
}

struct DisplayViolations<'a>(&'a [Violation]);

impl fmt::Display for DisplayViolations<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error(transparent)]
    Driver(UpdateError),

    #[error(
        "{} of {total} updates did not install (overall result {result_code}): \
         {failed:?}",
        .failed.len()
    )]
    ItemsFailed {
        result_code: ResultCode,
        total: usize,
        failed: Vec<String>,
    },
}
