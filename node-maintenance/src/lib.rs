// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Unattended rolling maintenance of one node in a hyper-converged failover
//! cluster: drain, suspend, update, then restart or resume.

pub mod config;
pub mod continuation;
mod dispatch;
pub mod drain;
pub mod errors;
#[cfg(test)]
mod fakes;
pub mod maintenance;
pub mod orchestrator;
pub mod run;
#[cfg(test)]
mod test_helpers;
pub mod wait;

pub use dispatch::*;
pub use orchestrator::{Collaborators, Orchestrator, Phase};
pub use run::{Completion, RunOutcome, RunReport, RunState};
