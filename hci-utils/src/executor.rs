// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running host commands, with a fake for tests.

use crate::{ExecutionError, output_to_exec_error};

use async_trait::async_trait;
use slog::{Logger, debug, error, info};
use std::fmt;
use std::process::{ExitStatus, Output};
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::Command;

/// The program and arguments of a command, as handed to an [`Executor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Input {
    pub program: String,
    pub args: Vec<String>,
}

impl Input {
    /// Returns true if any argument contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.args.iter().any(|arg| arg.contains(needle))
    }
}

impl From<&std::process::Command> for Input {
    fn from(command: &std::process::Command) -> Self {
        Self {
            program: command.get_program().to_string_lossy().into_owned(),
            args: command
                .get_args()
                .map(|s| s.to_string_lossy().into_owned())
                .collect(),
        }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Convenience constructors for canned command output.
pub trait OutputExt: Sized {
    fn success() -> Self;
    fn failure() -> Self;
    fn with_stdout(self, stdout: impl Into<Vec<u8>>) -> Self;
    fn with_stderr(self, stderr: impl Into<Vec<u8>>) -> Self;
}

#[cfg(unix)]
fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(code << 8)
}

#[cfg(windows)]
fn exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    ExitStatus::from_raw(code as u32)
}

impl OutputExt for Output {
    fn success() -> Self {
        Output { status: exit_status(0), stdout: vec![], stderr: vec![] }
    }

    fn failure() -> Self {
        Output { status: exit_status(1), stdout: vec![], stderr: vec![] }
    }

    fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

fn log_input(log: &Logger, id: u64, input: &Input) {
    info!(
        log,
        "running command via executor"; "id" => id, "command" => %input.program
    );
    debug!(
        log,
        "running command via executor"; "id" => id, "command" => %input
    );
}

fn log_output(log: &Logger, id: u64, output: &Output) {
    info!(
        log,
        "finished running command via executor";
        "id" => id,
        "result" => if output.status.success() { "OK" } else { "ERROR" },
        "status" => output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !output.stdout.is_empty() {
        debug!(
            log,
            "finished command stdout";
            "id" => id,
            "stdout" => from_utf8(&output.stdout)
                .unwrap_or("<Not valid UTF-8>"),
        );
    }
    if !output.stderr.is_empty() {
        debug!(
            log,
            "finished command stderr";
            "id" => id,
            "stderr" => from_utf8(&output.stderr)
                .unwrap_or("<Not valid UTF-8>"),
        );
    }
}

/// Describes the commonly-used "safe-to-reference" type describing the
/// Executor as a trait object.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Describes an "executor", which can run [`Command`]s and return a response.
///
/// - In production, this is usually simply a [`HostExecutor`].
/// - Under test, this can be customized, and a [`FakeExecutor`] may be used.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes a command, waiting for it to complete, and returning output.
    ///
    /// A non-zero exit status is reported as
    /// [`ExecutionError::CommandFailure`].
    async fn execute_async(
        &self,
        command: &mut Command,
    ) -> Result<Output, ExecutionError>;
}

/// Handler called when a fake command is run.
pub type WaitFn = dyn FnMut(&Input) -> Output + Send;
pub type BoxedWaitFn = Box<WaitFn>;

/// An executor which can expect certain inputs, and respond with specific
/// outputs.
pub struct FakeExecutor {
    log: Logger,
    counter: AtomicU64,
    wait_handler: Mutex<BoxedWaitFn>,
    inputs: Mutex<Vec<Input>>,
}

impl FakeExecutor {
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(Self {
            log,
            counter: AtomicU64::new(0),
            wait_handler: Mutex::new(Box::new(|_input| Output::success())),
            inputs: Mutex::new(Vec::new()),
        })
    }

    /// Set the request handler to an arbitrary function.
    pub fn set_wait_handler(&self, f: BoxedWaitFn) {
        *self.wait_handler.lock().unwrap() = f;
    }

    /// Every command run so far, in order.
    pub fn inputs(&self) -> Vec<Input> {
        self.inputs.lock().unwrap().clone()
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    // NOTE: We aren't actually performing any async operations -- it's up to
    // the caller to control the (synchronous) handler.
    async fn execute_async(
        &self,
        command: &mut Command,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let input = Input::from(command.as_std());
        log_input(&self.log, id, &input);

        let output = self.wait_handler.lock().unwrap()(&input);
        self.inputs.lock().unwrap().push(input.clone());
        log_output(&self.log, id, &output);

        if !output.status.success() {
            return Err(output_to_exec_error(input.to_string(), &output));
        }
        Ok(output)
    }
}

pub struct HostExecutor {
    log: Logger,
    counter: AtomicU64,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { log, counter: AtomicU64::new(0) })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute_async(
        &self,
        command: &mut Command,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let input = Input::from(command.as_std());
        log_input(&self.log, id, &input);

        // A caller that stops waiting (a client-side timeout, for one)
        // drops this future; the child must not outlive it.
        command.kill_on_drop(true);
        let output = command.output().await.map_err(|err| {
            error!(
                self.log, "Could not start program asynchronously!";
                "id" => id,
            );
            ExecutionError::ExecutionStart { command: input.to_string(), err }
        })?;
        log_output(&self.log, id, &output);

        if !output.status.success() {
            return Err(output_to_exec_error(input.to_string(), &output));
        }
        Ok(output)
    }
}
