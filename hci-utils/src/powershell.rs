// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running PowerShell scripts and decoding their JSON output.

use crate::ExecutionError;
use crate::executor::BoxedExecutor;
use serde::de::DeserializeOwned;
use tokio::process::Command;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("PowerShell execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Failed to parse output of `{cmdlet}`: {err}")]
    Parse {
        cmdlet: &'static str,
        #[source]
        err: serde_json::Error,
    },
}

/// Quotes `s` as a single-quoted PowerShell literal.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Runs scripts through a PowerShell host.
#[derive(Clone)]
pub struct PowerShell {
    executor: BoxedExecutor,
    program: String,
}

impl PowerShell {
    pub fn new(executor: BoxedExecutor, program: impl Into<String>) -> Self {
        Self { executor, program: program.into() }
    }

    fn command(&self, script: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
        ]);
        // Make every non-terminating cmdlet error terminate the script, so
        // that failure shows up in the exit status.
        cmd.arg(format!("$ErrorActionPreference = 'Stop'; {script}"));
        cmd
    }

    /// Runs `script`, discarding its output.
    pub async fn run(&self, script: &str) -> Result<(), Error> {
        self.executor.execute_async(&mut self.command(script)).await?;
        Ok(())
    }

    /// Runs `script`, which must write a single JSON document to stdout.
    ///
    /// `cmdlet` names the command being run for error reporting.
    pub async fn run_json<T: DeserializeOwned>(
        &self,
        cmdlet: &'static str,
        script: &str,
    ) -> Result<T, Error> {
        let output =
            self.executor.execute_async(&mut self.command(script)).await?;
        parse_json(cmdlet, &output.stdout)
    }
}

/// `ConvertTo-Json` emits nothing at all for an empty pipeline; treat that
/// as an empty array so list cmdlets decode uniformly.
pub(crate) fn parse_json<T: DeserializeOwned>(
    cmdlet: &'static str,
    stdout: &[u8],
) -> Result<T, Error> {
    let stdout = if stdout.iter().all(|b| b.is_ascii_whitespace()) {
        b"[]".as_slice()
    } else {
        stdout
    };
    serde_json::from_slice(stdout).map_err(|err| Error::Parse { cmdlet, err })
}
