// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Detecting whether the host is waiting for a restart.

use crate::REG;
use crate::executor::BoxedExecutor;
use async_trait::async_trait;
use slog::{Logger, debug};
use tokio::process::Command;

const CBS_REBOOT_PENDING: &str =
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Component Based Servicing\RebootPending";
const WU_REBOOT_REQUIRED: &str =
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\WindowsUpdate\Auto Update\RebootRequired";
const ACTIVE_COMPUTER_NAME: &str =
    r"HKLM\SYSTEM\CurrentControlSet\Control\ComputerName\ActiveComputerName";
const PENDING_COMPUTER_NAME: &str =
    r"HKLM\SYSTEM\CurrentControlSet\Control\ComputerName\ComputerName";
const SESSION_MANAGER: &str =
    r"HKLM\SYSTEM\CurrentControlSet\Control\Session Manager";

/// The independent OS markers that each mean a restart is outstanding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RebootSignals {
    /// Component-Based Servicing has staged changes.
    pub component_servicing: bool,
    /// Windows Update has installed something that needs a restart.
    pub windows_update: bool,
    /// The computer has been renamed but not yet restarted.
    pub computer_rename: bool,
    /// Files are queued to be replaced at the next boot.
    pub file_rename: bool,
}

impl RebootSignals {
    pub fn any(&self) -> bool {
        self.component_servicing
            || self.windows_update
            || self.computer_rename
            || self.file_rename
    }
}

#[async_trait]
pub trait RebootDetector: Send + Sync {
    /// Reads every signal. A signal that cannot be read is reported as
    /// absent.
    async fn signals(&self) -> RebootSignals;

    async fn is_reboot_pending(&self) -> bool {
        self.signals().await.any()
    }
}

/// Reads the reboot signals from the registry through `reg.exe`.
pub struct RegistryRebootDetector {
    log: Logger,
    executor: BoxedExecutor,
}

impl RegistryRebootDetector {
    pub fn new(log: &Logger, executor: BoxedExecutor) -> Self {
        let log = log.new(slog::o!("component" => "RegistryRebootDetector"));
        Self { log, executor }
    }

    async fn query(&self, key: &str, value: Option<&str>) -> Option<String> {
        let mut cmd = Command::new(REG);
        cmd.args(["query", key]);
        if let Some(value) = value {
            cmd.args(["/v", value]);
        }
        match self.executor.execute_async(&mut cmd).await {
            Ok(output) => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Err(err) => {
                debug!(
                    self.log, "registry query found nothing";
                    "key" => key,
                    "value" => value,
                    "err" => %err,
                );
                None
            }
        }
    }

    async fn key_exists(&self, key: &str) -> bool {
        self.query(key, None).await.is_some()
    }

    async fn read_value(&self, key: &str, value: &str) -> Option<String> {
        let stdout = self.query(key, Some(value)).await?;
        parse_reg_value(&stdout, value)
    }
}

#[async_trait]
impl RebootDetector for RegistryRebootDetector {
    async fn signals(&self) -> RebootSignals {
        let component_servicing = self.key_exists(CBS_REBOOT_PENDING).await;
        let windows_update = self.key_exists(WU_REBOOT_REQUIRED).await;

        let active =
            self.read_value(ACTIVE_COMPUTER_NAME, "ComputerName").await;
        let pending =
            self.read_value(PENDING_COMPUTER_NAME, "ComputerName").await;
        let computer_rename = match (active, pending) {
            (Some(active), Some(pending)) => {
                !active.eq_ignore_ascii_case(&pending)
            }
            _ => false,
        };

        let file_rename = self
            .query(SESSION_MANAGER, Some("PendingFileRenameOperations"))
            .await
            .is_some();

        let signals = RebootSignals {
            component_servicing,
            windows_update,
            computer_rename,
            file_rename,
        };
        debug!(self.log, "read reboot signals"; "signals" => ?signals);
        signals
    }
}

/// Extracts the data of `name` from `reg query /v` output, which looks like:
///
/// ```text
/// HKEY_LOCAL_MACHINE\SYSTEM\...\ActiveComputerName
///     ComputerName    REG_SZ    NODE1
/// ```
fn parse_reg_value(stdout: &str, name: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if !fields.next()?.eq_ignore_ascii_case(name) {
            return None;
        }
        if !fields.next()?.starts_with("REG_") {
            return None;
        }
        Some(fields.collect::<Vec<_>>().join(" "))
    })
}
