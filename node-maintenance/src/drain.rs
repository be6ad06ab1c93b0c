// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving shared volume ownership off the node about to be maintained.
//!
//! Draining happens in two halves. [`DrainCoordinator::plan`] only reads
//! cluster state: it picks the partner that will take the volumes and lists
//! the volumes the local node owns. [`DrainCoordinator::execute`] then moves
//! each volume in turn. If one move fails, the volumes already moved stay on
//! the partner.

use crate::run::{FAILURE, SUCCESS};
use crate::wait::Timeout;
use display_error_chain::DisplayErrorChain;
use hci_utils::cluster::{
    ClusterControl, ClusterError, ClusterNode, ClusterStateReader, NodeState,
    SharedVolume,
};
use slog::{Logger, error, info};
use std::sync::Arc;
use std::time::Duration;

/// How long past the server-side wait a move may run before it is abandoned
/// here. PowerShell startup and module loading count against the client
/// ceiling but not against `-Wait`.
pub const MOVE_CLIENT_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error("failed to read cluster state")]
    Query(#[source] ClusterError),

    #[error("no cluster node other than {node} is Up to take its volumes")]
    NoPartner { node: String },

    #[error(
        "failed to move shared volume {volume} to {partner} \
         ({moved} already moved)"
    )]
    Move {
        volume: String,
        partner: String,
        moved: usize,
        #[source]
        err: ClusterError,
    },

    #[error(
        "moving shared volume {volume} to {partner} did not finish within \
         {timeout:?} ({moved} already moved)"
    )]
    MoveTimedOut {
        volume: String,
        partner: String,
        moved: usize,
        timeout: Duration,
    },

    #[error("{node} still owns shared volumes after draining: {volumes:?}")]
    StillOwned { node: String, volumes: Vec<String> },
}

/// Picks the node that takes over: the first node, in the order the cluster
/// listed them, that is not `local` and is Up.
pub fn select_partner<'a>(
    nodes: &'a [ClusterNode],
    local: &str,
) -> Option<&'a ClusterNode> {
    nodes
        .iter()
        .find(|node| !node.is_named(local) && node.state == NodeState::Up)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrainPlan {
    pub node: String,
    pub partner: String,
    pub volumes: Vec<SharedVolume>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrainSummary {
    pub partner: String,
    pub moved: Vec<String>,
}

impl DrainSummary {
    pub fn moved_count(&self) -> usize {
        self.moved.len()
    }
}

pub struct DrainCoordinator {
    log: Logger,
    reader: Arc<dyn ClusterStateReader>,
    control: Arc<dyn ClusterControl>,
    move_timeout: Duration,
}

impl DrainCoordinator {
    pub fn new(
        log: &Logger,
        reader: Arc<dyn ClusterStateReader>,
        control: Arc<dyn ClusterControl>,
        move_timeout: Duration,
    ) -> Self {
        let log = log.new(slog::o!("component" => "DrainCoordinator"));
        Self { log, reader, control, move_timeout }
    }

    /// Chooses a partner for `node` and lists the volumes it owns, without
    /// changing anything.
    pub async fn plan(&self, node: &str) -> Result<DrainPlan, DrainError> {
        let result = self.plan_inner(node).await;
        match &result {
            Ok(plan) => info!(
                self.log, "planned drain";
                "node" => node,
                "partner" => &plan.partner,
                "volumes" => plan.volumes.len(),
                "outcome" => SUCCESS,
            ),
            Err(err) => error!(
                self.log, "failed to plan drain";
                "node" => node,
                "outcome" => FAILURE,
                "error" => %DisplayErrorChain::new(err),
            ),
        }
        result
    }

    async fn plan_inner(&self, node: &str) -> Result<DrainPlan, DrainError> {
        let nodes =
            self.reader.list_nodes().await.map_err(DrainError::Query)?;
        let partner = select_partner(&nodes, node)
            .ok_or_else(|| DrainError::NoPartner { node: node.to_string() })?;
        let volumes = self.owned_volumes(node).await?;
        Ok(DrainPlan {
            node: node.to_string(),
            partner: partner.name.clone(),
            volumes,
        })
    }

    /// Moves every volume in `plan` to its partner, stopping at the first
    /// failure.
    ///
    /// The cluster is asked to finish each move within the configured
    /// timeout; the move is abandoned here once [`MOVE_CLIENT_MARGIN`] more
    /// has passed.
    pub async fn execute(
        &self,
        plan: &DrainPlan,
    ) -> Result<DrainSummary, DrainError> {
        let mut moved = Vec::with_capacity(plan.volumes.len());
        for volume in &plan.volumes {
            let log = self.log.new(slog::o!(
                "volume" => volume.name.clone(),
                "partner" => plan.partner.clone(),
            ));
            let timeout =
                Timeout::from_now(self.move_timeout + MOVE_CLIENT_MARGIN);
            let result = timeout
                .timeout_at(self.control.move_shared_volume(
                    &volume.name,
                    &plan.partner,
                    self.move_timeout,
                ))
                .await;
            match result {
                Ok(Ok(())) => {
                    info!(log, "moved shared volume"; "outcome" => SUCCESS);
                    moved.push(volume.name.clone());
                }
                Ok(Err(err)) => {
                    error!(
                        log, "failed to move shared volume";
                        "outcome" => FAILURE,
                        "moved" => moved.len(),
                        "error" => %DisplayErrorChain::new(&err),
                    );
                    return Err(DrainError::Move {
                        volume: volume.name.clone(),
                        partner: plan.partner.clone(),
                        moved: moved.len(),
                        err,
                    });
                }
                Err(elapsed) => {
                    error!(
                        log, "timed out moving shared volume";
                        "outcome" => FAILURE,
                        "moved" => moved.len(),
                        "timeout" => ?elapsed.duration(),
                    );
                    return Err(DrainError::MoveTimedOut {
                        volume: volume.name.clone(),
                        partner: plan.partner.clone(),
                        moved: moved.len(),
                        timeout: elapsed.duration(),
                    });
                }
            }
        }

        let remaining: Vec<String> = self
            .owned_volumes(&plan.node)
            .await?
            .into_iter()
            .map(|volume| volume.name)
            .collect();
        if !remaining.is_empty() {
            error!(
                self.log, "node still owns shared volumes after drain";
                "outcome" => FAILURE,
                "volumes" => ?remaining,
            );
            return Err(DrainError::StillOwned {
                node: plan.node.clone(),
                volumes: remaining,
            });
        }

        Ok(DrainSummary { partner: plan.partner.clone(), moved })
    }

    /// Plans and executes a drain of `node`.
    pub async fn drain(&self, node: &str) -> Result<DrainSummary, DrainError> {
        let plan = self.plan(node).await?;
        self.execute(&plan).await
    }

    async fn owned_volumes(
        &self,
        node: &str,
    ) -> Result<Vec<SharedVolume>, DrainError> {
        Ok(self
            .reader
            .list_shared_volumes()
            .await
            .map_err(DrainError::Query)?
            .into_iter()
            .filter(|volume| volume.is_owned_by(node))
            .collect())
    }
}
