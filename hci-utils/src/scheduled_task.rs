// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for managing Task Scheduler tasks that run at system startup.

use crate::executor::BoxedExecutor;
use crate::{ExecutionError, SCHTASKS};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio::process::Command;

#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error("Failed to query scheduled task '{name}': {err}")]
    Query {
        name: String,
        #[source]
        err: ExecutionError,
    },

    #[error("Failed to create scheduled task '{name}': {err}")]
    Create {
        name: String,
        #[source]
        err: ExecutionError,
    },

    #[error("Failed to delete scheduled task '{name}': {err}")]
    Delete {
        name: String,
        #[source]
        err: ExecutionError,
    },
}

/// A task that runs `program` with `arguments` once at every system
/// startup, as `SYSTEM` at the highest run level, whether or not anyone is
/// logged on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskDefinition {
    pub name: String,
    pub program: Utf8PathBuf,
    pub arguments: Vec<String>,
}

impl TaskDefinition {
    /// The command line `schtasks /TR` expects.
    pub fn command_line(&self) -> String {
        let mut line = quote_arg(self.program.as_str());
        for arg in &self.arguments {
            line.push(' ');
            line.push_str(&quote_arg(arg));
        }
        line
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.contains(&[' ', '\t', '"'][..]) {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool, TaskError>;

    /// Registers `task`, replacing any task of the same name.
    async fn create(&self, task: &TaskDefinition) -> Result<(), TaskError>;

    async fn delete(&self, name: &str) -> Result<(), TaskError>;
}

/// Task Scheduler, driven through `schtasks.exe`.
pub struct Schtasks {
    executor: BoxedExecutor,
}

impl Schtasks {
    pub fn new(executor: BoxedExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl TaskScheduler for Schtasks {
    async fn exists(&self, name: &str) -> Result<bool, TaskError> {
        let mut cmd = Command::new(SCHTASKS);
        cmd.args(["/Query", "/TN", name]);
        match self.executor.execute_async(&mut cmd).await {
            Ok(_) => Ok(true),
            // schtasks exits non-zero when no such task exists.
            Err(err) if err.is_command_failure() => Ok(false),
            Err(err) => Err(TaskError::Query { name: name.to_string(), err }),
        }
    }

    async fn create(&self, task: &TaskDefinition) -> Result<(), TaskError> {
        let mut cmd = Command::new(SCHTASKS);
        cmd.args(["/Create", "/TN", task.name.as_str()])
            .arg("/TR")
            .arg(task.command_line())
            .args(["/SC", "ONSTART", "/RU", "SYSTEM", "/RL", "HIGHEST", "/F"]);
        self.executor
            .execute_async(&mut cmd)
            .await
            .map_err(|err| TaskError::Create { name: task.name.clone(), err })?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), TaskError> {
        let mut cmd = Command::new(SCHTASKS);
        cmd.args(["/Delete", "/TN", name, "/F"]);
        self.executor
            .execute_async(&mut cmd)
            .await
            .map_err(|err| TaskError::Delete { name: name.to_string(), err })?;
        Ok(())
    }
}
