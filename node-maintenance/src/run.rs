// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bookkeeping and event emission for a single orchestration run.
//!
//! A run is never persisted. Everything it records ends up in the event log
//! and in the [`RunReport`] returned to the caller; recovery after a restart
//! re-reads cluster state instead.

use crate::errors::OrchestrationError;
use crate::maintenance::ResumeOutcome;
use crate::orchestrator::Phase;
use chrono::{DateTime, Utc};
use display_error_chain::DisplayErrorChain;
use slog::{Logger, error, info, warn};
use std::fmt;
use uuid::Uuid;

/// Value of the `outcome` key on an event recording a successful call.
pub(crate) const SUCCESS: &str = "SUCCESS";
/// Value of the `outcome` key on an event recording a failed call.
pub(crate) const FAILURE: &str = "FAILURE";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Start,
    ValidatingPreconditions,
    Draining,
    Suspending,
    Updating,
    RebootDecision,
    Rebooting,
    Resuming,
    CleaningUp,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Start => "Start",
            RunState::ValidatingPreconditions => "ValidatingPreconditions",
            RunState::Draining => "Draining",
            RunState::Suspending => "Suspending",
            RunState::Updating => "Updating",
            RunState::RebootDecision => "RebootDecision",
            RunState::Rebooting => "Rebooting",
            RunState::Resuming => "Resuming",
            RunState::CleaningUp => "CleaningUp",
            RunState::Done => "Done",
            RunState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// How a run that did its job got there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Nothing was pending, so the node was never taken out of the cluster.
    NoUpdates,
    /// Updates installed and a restart is scheduled; the continuation
    /// finishes the job after it.
    RestartScheduled,
    /// Updates installed without needing a restart and the node is back.
    Resumed,
    /// The node is back in the cluster after a restart.
    Recovered,
    /// The continuation is registered.
    ContinuationArmed,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(Completion),
    /// The run stopped before updating. `compensation` is what the
    /// compensating resume did, or `None` if nothing had been changed.
    Aborted {
        error: OrchestrationError,
        compensation: Option<ResumeOutcome>,
    },
    /// The node needs an operator. When the failure happened while undoing
    /// an earlier one, `cause` holds the earlier one.
    Failed {
        error: OrchestrationError,
        cause: Option<Box<OrchestrationError>>,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    fn terminal_state(&self) -> RunState {
        match self {
            RunOutcome::Completed(_) => RunState::Done,
            RunOutcome::Aborted { .. } | RunOutcome::Failed { .. } => {
                RunState::Failed
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed(_) => "completed",
            RunOutcome::Aborted { .. } => "aborted",
            RunOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub phase: Phase,
    pub node: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Every state the run entered, in order, starting with `Start`.
    pub states: Vec<RunState>,
    pub outcome: RunOutcome,
    /// Problems that did not change the outcome.
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn entered(&self, state: RunState) -> bool {
        self.states.contains(&state)
    }
}

pub(crate) struct OrchestrationRun {
    log: Logger,
    run_id: Uuid,
    phase: Phase,
    node: String,
    started_at: DateTime<Utc>,
    states: Vec<RunState>,
    warnings: Vec<String>,
}

impl OrchestrationRun {
    pub(crate) fn start(log: &Logger, phase: Phase, node: &str) -> Self {
        let run_id = Uuid::new_v4();
        let log = log.new(slog::o!(
            "run_id" => run_id.to_string(),
            "phase" => phase.to_string(),
            "node" => node.to_string(),
        ));
        let started_at = Utc::now();
        info!(log, "run started"; "started_at" => %started_at);
        Self {
            log,
            run_id,
            phase,
            node: node.to_string(),
            started_at,
            states: vec![RunState::Start],
            warnings: Vec::new(),
        }
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    pub(crate) fn state(&self) -> RunState {
        // `states` starts non-empty and only grows.
        self.states.last().copied().unwrap_or(RunState::Start)
    }

    pub(crate) fn enter(&mut self, state: RunState) {
        info!(
            self.log, "state transition";
            "from" => %self.state(),
            "to" => %state,
        );
        self.states.push(state);
    }

    /// Records a problem that does not change the outcome of the run.
    pub(crate) fn warn(&mut self, msg: &str, err: &dyn std::error::Error) {
        let chain = DisplayErrorChain::new(err).to_string();
        warn!(self.log, "{msg}"; "error" => &chain);
        self.warnings.push(format!("{msg}: {chain}"));
    }

    pub(crate) fn finish(mut self, outcome: RunOutcome) -> RunReport {
        self.enter(outcome.terminal_state());
        let finished_at = Utc::now();
        match &outcome {
            RunOutcome::Completed(completion) => info!(
                self.log, "run finished";
                "result" => outcome.label(),
                "completion" => ?completion,
                "warnings" => self.warnings.len(),
                "outcome" => SUCCESS,
            ),
            RunOutcome::Aborted { error, compensation } => error!(
                self.log, "run finished";
                "result" => outcome.label(),
                "compensation" => ?compensation,
                "outcome" => FAILURE,
                "error" => %DisplayErrorChain::new(error),
            ),
            RunOutcome::Failed { error, cause } => error!(
                self.log, "run finished";
                "result" => outcome.label(),
                "outcome" => FAILURE,
                "error" => %DisplayErrorChain::new(error),
                "cause" => cause
                    .as_deref()
                    .map(|cause| DisplayErrorChain::new(cause).to_string()),
            ),
        }
        RunReport {
            run_id: self.run_id,
            phase: self.phase,
            node: self.node,
            started_at: self.started_at,
            finished_at,
            states: self.states,
            outcome,
            warnings: self.warnings,
        }
    }
}
