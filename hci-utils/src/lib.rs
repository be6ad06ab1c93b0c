// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around the Windows host commands used to maintain a node of a
//! hyper-converged failover cluster.

pub mod cluster;
pub mod executor;
pub mod powershell;
pub mod reboot;
pub mod scheduled_task;
pub mod shutdown;
pub mod storage;
pub mod windows_update;

#[cfg(test)]
mod test_helpers;

pub const POWERSHELL: &str = "powershell.exe";
pub const REG: &str = "reg.exe";
pub const SCHTASKS: &str = "schtasks.exe";
pub const SHUTDOWN: &str = "shutdown.exe";

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub command: String,
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),
}

impl ExecutionError {
    /// Returns true if the command ran to completion and reported failure,
    /// as opposed to never starting.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, ExecutionError::CommandFailure(_))
    }
}

pub fn output_to_exec_error(
    command: String,
    output: &std::process::Output,
) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command,
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}
