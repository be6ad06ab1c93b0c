// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The startup task that brings a node back into the cluster after the
//! restart an update asked for.
//!
//! At most one continuation exists at a time: arming removes any task left
//! over from an earlier run before registering a new one.

use crate::run::{FAILURE, SUCCESS};
use camino::Utf8PathBuf;
use display_error_chain::DisplayErrorChain;
use hci_utils::scheduled_task::{TaskDefinition, TaskError, TaskScheduler};
use slog::{Logger, error, info};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContinuationOp {
    Arm,
    Disarm,
}

impl fmt::Display for ContinuationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContinuationOp::Arm => f.write_str("arm"),
            ContinuationOp::Disarm => f.write_str("disarm"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContinuationError {
    #[error("failed to look for an existing continuation")]
    Probe(#[source] TaskError),

    #[error("failed to remove the previous continuation")]
    RemoveStale(#[source] TaskError),

    #[error("failed to register the continuation")]
    Register(#[source] TaskError),

    #[error("failed to remove the continuation")]
    Remove(#[source] TaskError),
}

/// What the continuation runs: this program again, in the post-reboot
/// phase, with the configuration file the current run used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContinuationTarget {
    pub program: Utf8PathBuf,
    pub config: Option<Utf8PathBuf>,
}

impl ContinuationTarget {
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec!["--phase".to_string(), "post-reboot".to_string()];
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.to_string());
        }
        args
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisarmOutcome {
    Removed,
    /// There was nothing to remove.
    NotFound,
}

pub struct ContinuationManager {
    log: Logger,
    scheduler: Arc<dyn TaskScheduler>,
    task_name: String,
}

impl ContinuationManager {
    pub fn new(
        log: &Logger,
        scheduler: Arc<dyn TaskScheduler>,
        task_name: impl Into<String>,
    ) -> Self {
        let task_name = task_name.into();
        let log = log.new(slog::o!(
            "component" => "ContinuationManager",
            "task" => task_name.clone(),
        ));
        Self { log, scheduler, task_name }
    }

    /// Registers the continuation, replacing any previous one.
    pub async fn arm(
        &self,
        target: &ContinuationTarget,
    ) -> Result<(), ContinuationError> {
        let result = self.arm_inner(target).await;
        match &result {
            Ok(()) => info!(
                self.log, "armed continuation";
                "program" => %target.program,
                "outcome" => SUCCESS,
            ),
            Err(err) => error!(
                self.log, "failed to arm continuation";
                "program" => %target.program,
                "outcome" => FAILURE,
                "error" => %DisplayErrorChain::new(err),
            ),
        }
        result
    }

    async fn arm_inner(
        &self,
        target: &ContinuationTarget,
    ) -> Result<(), ContinuationError> {
        if self.exists().await? {
            info!(self.log, "removing continuation left by an earlier run");
            self.scheduler
                .delete(&self.task_name)
                .await
                .map_err(ContinuationError::RemoveStale)?;
        }
        let task = TaskDefinition {
            name: self.task_name.clone(),
            program: target.program.clone(),
            arguments: target.arguments(),
        };
        self.scheduler
            .create(&task)
            .await
            .map_err(ContinuationError::Register)
    }

    /// Removes the continuation. Succeeds if it was already gone.
    pub async fn disarm(&self) -> Result<DisarmOutcome, ContinuationError> {
        let result = self.disarm_inner().await;
        match &result {
            Ok(outcome) => info!(
                self.log, "disarmed continuation";
                "found" => *outcome == DisarmOutcome::Removed,
                "outcome" => SUCCESS,
            ),
            Err(err) => error!(
                self.log, "failed to disarm continuation";
                "outcome" => FAILURE,
                "error" => %DisplayErrorChain::new(err),
            ),
        }
        result
    }

    async fn disarm_inner(&self) -> Result<DisarmOutcome, ContinuationError> {
        if !self.exists().await? {
            return Ok(DisarmOutcome::NotFound);
        }
        self.scheduler
            .delete(&self.task_name)
            .await
            .map_err(ContinuationError::Remove)?;
        Ok(DisarmOutcome::Removed)
    }

    async fn exists(&self) -> Result<bool, ContinuationError> {
        self.scheduler
            .exists(&self.task_name)
            .await
            .map_err(ContinuationError::Probe)
    }
}
