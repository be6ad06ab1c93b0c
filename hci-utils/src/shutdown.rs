// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Restarting the host.

use crate::executor::BoxedExecutor;
use crate::{ExecutionError, SHUTDOWN};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

const REASON_LENGTH_MAX: usize = 512;

#[async_trait]
pub trait Restarter: Send + Sync {
    /// Schedules a restart `delay` from now and returns without waiting for
    /// it.
    async fn restart(
        &self,
        delay: Duration,
        reason: &str,
    ) -> Result<(), ExecutionError>;
}

/// Restarts through `shutdown.exe`.
pub struct Shutdown {
    executor: BoxedExecutor,
}

impl Shutdown {
    pub fn new(executor: BoxedExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Restarter for Shutdown {
    async fn restart(
        &self,
        delay: Duration,
        reason: &str,
    ) -> Result<(), ExecutionError> {
        let reason: String = reason.chars().take(REASON_LENGTH_MAX).collect();
        let mut cmd = Command::new(SHUTDOWN);
        cmd.args(["/r", "/t"])
            .arg(delay.as_secs().to_string())
            // "Operating System: Service pack (Planned)"
            .args(["/d", "p:2:16", "/c"])
            .arg(reason);
        self.executor.execute_async(&mut cmd).await?;
        Ok(())
    }
}
