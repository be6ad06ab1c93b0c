// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The state machine that takes one node through maintenance.
//!
//! Each invocation runs one [`Phase`] from start to finish and returns a
//! [`RunReport`]. Nothing is carried between invocations except the
//! continuation task; the post-reboot phase works entirely from live cluster
//! state.

use crate::config::Config;
use crate::continuation::{
    ContinuationManager, ContinuationOp, ContinuationTarget,
};
use crate::drain::{DrainCoordinator, DrainError, DrainPlan};
use crate::errors::{
    InstallError, OrchestrationError, PreconditionError, Violation,
};
use crate::maintenance::MaintenanceController;
use crate::run::{
    Completion, FAILURE, OrchestrationRun, RunOutcome, RunReport, RunState,
    SUCCESS,
};
use display_error_chain::DisplayErrorChain;
use hci_utils::cluster::{
    ClusterControl, ClusterStateReader, FailbackMode, NodeState,
};
use hci_utils::reboot::RebootDetector;
use hci_utils::scheduled_task::TaskScheduler;
use hci_utils::shutdown::Restarter;
use hci_utils::windows_update::{UpdateDriver, UpdateSet};
use slog::{Logger, error, info};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const RESTART_REASON: &str = "Restarting to finish installing updates \
    during cluster-aware node maintenance";

/// Where in the maintenance cycle an invocation starts.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum,
)]
pub enum Phase {
    /// Validate, drain, suspend, update, then restart or resume.
    #[default]
    PreReboot,
    /// Bring the node back after the restart a pre-reboot run scheduled.
    PostReboot,
    /// Only register the post-reboot continuation.
    ScheduleOnly,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::PreReboot => f.write_str("pre-reboot"),
            Phase::PostReboot => f.write_str("post-reboot"),
            Phase::ScheduleOnly => f.write_str("schedule-only"),
        }
    }
}

/// The host capabilities a run drives.
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn ClusterStateReader>,
    pub control: Arc<dyn ClusterControl>,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub updates: Arc<dyn UpdateDriver>,
    pub reboot: Arc<dyn RebootDetector>,
    pub restarter: Arc<dyn Restarter>,
}

pub struct Orchestrator {
    log: Logger,
    node: String,
    target: ContinuationTarget,
    task_name: String,
    move_timeout: Duration,
    suspend_timeout: Duration,
    resume_timeout: Duration,
    poll_interval: Duration,
    failback: FailbackMode,
    restart_grace: Duration,
    collaborators: Collaborators,
}

/// The components of one run, each logging with that run's context.
struct Steps {
    drain: DrainCoordinator,
    maintenance: MaintenanceController,
    continuation: ContinuationManager,
}

impl Orchestrator {
    pub fn new(
        log: &Logger,
        node: impl Into<String>,
        target: ContinuationTarget,
        config: &Config,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            log: log.clone(),
            node: node.into(),
            target,
            task_name: config.continuation.task_name.clone(),
            move_timeout: config.drain.move_timeout(),
            suspend_timeout: config.maintenance.suspend_timeout(),
            resume_timeout: config.maintenance.resume_timeout(),
            poll_interval: config.maintenance.poll_interval(),
            failback: config.maintenance.failback,
            restart_grace: config.restart.grace(),
            collaborators,
        }
    }

    pub async fn run(&self, phase: Phase) -> RunReport {
        let mut run = OrchestrationRun::start(&self.log, phase, &self.node);
        let steps = self.steps(run.log());
        let outcome = match phase {
            Phase::PreReboot => self.pre_reboot(&mut run, &steps).await,
            Phase::PostReboot => self.post_reboot(&mut run, &steps).await,
            Phase::ScheduleOnly => self.schedule_only(&steps).await,
        };
        run.finish(outcome)
    }

    fn steps(&self, log: &Logger) -> Steps {
        let c = &self.collaborators;
        Steps {
            drain: DrainCoordinator::new(
                log,
                c.cluster.clone(),
                c.control.clone(),
                self.move_timeout,
            ),
            maintenance: MaintenanceController::new(
                log,
                c.cluster.clone(),
                c.control.clone(),
                self.suspend_timeout,
                self.resume_timeout,
                self.poll_interval,
            ),
            continuation: ContinuationManager::new(
                log,
                c.scheduler.clone(),
                self.task_name.clone(),
            ),
        }
    }

    async fn pre_reboot(
        &self,
        run: &mut OrchestrationRun,
        steps: &Steps,
    ) -> RunOutcome {
        run.enter(RunState::ValidatingPreconditions);
        if let Err(err) = self.check_health(run.log()).await {
            return RunOutcome::Aborted {
                error: err.into(),
                compensation: None,
            };
        }
        let updates = match self.discover(run.log()).await {
            Ok(updates) => updates,
            Err(error) => {
                return RunOutcome::Aborted { error, compensation: None };
            }
        };
        if updates.is_empty() {
            info!(run.log(), "no pending updates; leaving node in service");
            return RunOutcome::Completed(Completion::NoUpdates);
        }
        let plan = match steps.drain.plan(&self.node).await {
            Ok(plan) => plan,
            Err(err) => {
                return RunOutcome::Aborted {
                    error: self.plan_error(err),
                    compensation: None,
                };
            }
        };

        run.enter(RunState::Draining);
        if let Err(err) = self.drain(run.log(), steps, &plan).await {
            return self
                .compensate(run, steps, OrchestrationError::Drain(err))
                .await;
        }

        run.enter(RunState::Suspending);
        if let Err(err) = steps.maintenance.suspend(&self.node).await {
            let error = OrchestrationError::MaintenanceEntry(err);
            return self.compensate(run, steps, error).await;
        }

        run.enter(RunState::Updating);
        // The installer may restart the host on its own, so the
        // continuation must exist before installation starts.
        if let Err(err) = steps.continuation.arm(&self.target).await {
            let error = OrchestrationError::Continuation {
                op: ContinuationOp::Arm,
                err,
            };
            return self.compensate(run, steps, error).await;
        }
        let reboot_required = match self.install(run.log(), &updates).await {
            Ok(reboot_required) => reboot_required,
            Err(err) => {
                return RunOutcome::Failed { error: err.into(), cause: None };
            }
        };

        run.enter(RunState::RebootDecision);
        if self.reboot_pending(run.log()).await || reboot_required {
            run.enter(RunState::Rebooting);
            return match self.schedule_restart(run.log()).await {
                Ok(()) => RunOutcome::Completed(Completion::RestartScheduled),
                Err(error) => RunOutcome::Failed { error, cause: None },
            };
        }

        run.enter(RunState::Resuming);
        self.resume_and_disarm(run, steps, Completion::Resumed).await
    }

    async fn post_reboot(
        &self,
        run: &mut OrchestrationRun,
        steps: &Steps,
    ) -> RunOutcome {
        run.enter(RunState::Resuming);
        self.resume_and_disarm(run, steps, Completion::Recovered).await
    }

    async fn schedule_only(&self, steps: &Steps) -> RunOutcome {
        match steps.continuation.arm(&self.target).await {
            Ok(()) => RunOutcome::Completed(Completion::ContinuationArmed),
            Err(err) => RunOutcome::Failed {
                error: OrchestrationError::Continuation {
                    op: ContinuationOp::Arm,
                    err,
                },
                cause: None,
            },
        }
    }

    /// Takes a health snapshot of the cluster and reports every reason it
    /// is not safe to take this node out.
    async fn check_health(
        &self,
        log: &Logger,
    ) -> Result<(), PreconditionError> {
        let result = self.read_health(log).await;
        if let Err(err) = &result {
            error!(
                log, "cluster is not ready for maintenance";
                "outcome" => FAILURE,
                "error" => %DisplayErrorChain::new(err),
            );
        }
        result
    }

    async fn read_health(&self, log: &Logger) -> Result<(), PreconditionError> {
        let cluster = &self.collaborators.cluster;
        let nodes =
            cluster.list_nodes().await.map_err(PreconditionError::Query)?;
        if !nodes.iter().any(|node| node.is_named(&self.node)) {
            return Err(PreconditionError::LocalNodeMissing {
                node: self.node.clone(),
            });
        }
        let health =
            cluster.storage_health().await.map_err(PreconditionError::Query)?;
        let groups =
            cluster.list_groups().await.map_err(PreconditionError::Query)?;

        let local_groups: Vec<&str> = groups
            .iter()
            .filter(|group| group.owner_node.eq_ignore_ascii_case(&self.node))
            .map(|group| group.name.as_str())
            .collect();
        info!(
            log, "read cluster health snapshot";
            "nodes" => nodes.len(),
            "virtual_disks" => health.virtual_disks.len(),
            "subsystem" => %health.subsystem.health_status,
            "local_groups" => ?local_groups,
            "outcome" => SUCCESS,
        );

        let mut violations: Vec<Violation> = nodes
            .iter()
            .filter(|node| node.state != NodeState::Up)
            .map(|node| Violation::NodeNotUp {
                node: node.name.clone(),
                state: node.state,
            })
            .collect();
        violations.extend(health.unhealthy_disks().map(|disk| {
            Violation::VirtualDiskUnhealthy {
                disk: disk.friendly_name.clone(),
                health: disk.health_status,
                operational: disk.operational_status.clone(),
            }
        }));
        if health.subsystem.is_unhealthy() {
            violations.push(Violation::SubsystemUnhealthy {
                subsystem: health.subsystem.friendly_name.clone(),
                health: health.subsystem.health_status,
            });
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(PreconditionError::Unhealthy(violations))
        }
    }

    async fn discover(
        &self,
        log: &Logger,
    ) -> Result<UpdateSet, OrchestrationError> {
        match self.collaborators.updates.discover().await {
            Ok(updates) => {
                info!(
                    log, "discovered pending updates";
                    "count" => updates.len(),
                    "reboot_required" => updates.reboot_required(),
                    "outcome" => SUCCESS,
                );
                for update in updates.iter() {
                    info!(
                        log, "pending update";
                        "title" => &update.title,
                        "update_id" => &update.update_id,
                    );
                }
                Ok(updates)
            }
            Err(err) => {
                error!(
                    log, "failed to discover pending updates";
                    "outcome" => FAILURE,
                    "error" => %DisplayErrorChain::new(&err),
                );
                Err(OrchestrationError::Discovery(err))
            }
        }
    }

    /// Planning only reads cluster state, so its failures are precondition
    /// failures.
    fn plan_error(&self, err: DrainError) -> OrchestrationError {
        match err {
            DrainError::NoPartner { node } => {
                PreconditionError::NoPartner { node }.into()
            }
            DrainError::Query(err) => PreconditionError::Query(err).into(),
            err => OrchestrationError::Drain(err),
        }
    }

    async fn drain(
        &self,
        log: &Logger,
        steps: &Steps,
        plan: &DrainPlan,
    ) -> Result<(), DrainError> {
        let summary = steps.drain.execute(plan).await?;
        info!(
            log, "drained shared volumes";
            "partner" => &summary.partner,
            "moved" => summary.moved_count(),
        );
        Ok(())
    }

    /// Installs `updates`, returning whether the installer asked for a
    /// restart.
    async fn install(
        &self,
        log: &Logger,
        updates: &UpdateSet,
    ) -> Result<bool, InstallError> {
        let result = match self.collaborators.updates.install(updates).await {
            Ok(result) => result,
            Err(err) => {
                error!(
                    log, "update installation failed";
                    "outcome" => FAILURE,
                    "error" => %DisplayErrorChain::new(&err),
                );
                return Err(InstallError::Driver(err));
            }
        };
        let failed: Vec<String> =
            result.failures().map(|item| item.title.clone()).collect();
        if !failed.is_empty() {
            error!(
                log, "some updates did not install";
                "result_code" => %result.result_code,
                "failed" => ?failed,
                "outcome" => FAILURE,
            );
            return Err(InstallError::ItemsFailed {
                result_code: result.result_code,
                total: result.items.len(),
                failed,
            });
        }
        info!(
            log, "installed updates";
            "count" => result.items.len(),
            "result_code" => %result.result_code,
            "reboot_required" => result.reboot_required,
            "outcome" => SUCCESS,
        );
        Ok(result.reboot_required)
    }

    async fn reboot_pending(&self, log: &Logger) -> bool {
        let signals = self.collaborators.reboot.signals().await;
        info!(
            log, "checked reboot-pending signals";
            "component_servicing" => signals.component_servicing,
            "windows_update" => signals.windows_update,
            "computer_rename" => signals.computer_rename,
            "file_rename" => signals.file_rename,
            "pending" => signals.any(),
            "outcome" => SUCCESS,
        );
        signals.any()
    }

    async fn schedule_restart(
        &self,
        log: &Logger,
    ) -> Result<(), OrchestrationError> {
        match self
            .collaborators
            .restarter
            .restart(self.restart_grace, RESTART_REASON)
            .await
        {
            Ok(()) => {
                info!(
                    log, "scheduled restart";
                    "grace" => ?self.restart_grace,
                    "outcome" => SUCCESS,
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    log, "failed to schedule restart";
                    "outcome" => FAILURE,
                    "error" => %DisplayErrorChain::new(&err),
                );
                Err(OrchestrationError::Restart(err))
            }
        }
    }

    /// Undoes a failed drain or suspend by resuming the node. The resume is
    /// attempted once; if it fails the node is left for an operator.
    async fn compensate(
        &self,
        run: &mut OrchestrationRun,
        steps: &Steps,
        error: OrchestrationError,
    ) -> RunOutcome {
        info!(
            run.log(), "compensating";
            "failed_in" => %run.state(),
            "error" => %DisplayErrorChain::new(&error),
        );
        run.enter(RunState::Resuming);
        match steps.maintenance.resume(&self.node, self.failback).await {
            Ok(outcome) => {
                RunOutcome::Aborted { error, compensation: Some(outcome) }
            }
            Err(err) => RunOutcome::Failed {
                error: OrchestrationError::MaintenanceExit(err),
                cause: Some(Box::new(error)),
            },
        }
    }

    /// Returns the node to the cluster and removes the continuation. If the
    /// resume fails the continuation stays, so the next startup tries again.
    async fn resume_and_disarm(
        &self,
        run: &mut OrchestrationRun,
        steps: &Steps,
        completion: Completion,
    ) -> RunOutcome {
        if let Err(err) =
            steps.maintenance.resume(&self.node, self.failback).await
        {
            return RunOutcome::Failed {
                error: OrchestrationError::MaintenanceExit(err),
                cause: None,
            };
        }
        run.enter(RunState::CleaningUp);
        if let Err(err) = steps.continuation.disarm().await {
            let err = OrchestrationError::Continuation {
                op: ContinuationOp::Disarm,
                err,
            };
            run.warn("continuation left registered", &err);
        }
        RunOutcome::Completed(completion)
    }
}
