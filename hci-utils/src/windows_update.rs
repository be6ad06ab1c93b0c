// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovering and installing software updates through the Windows Update
//! Agent.

use crate::powershell::{self, PowerShell, quote};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum UpdateError {
    #[error("Windows Update search failed: {0}")]
    Search(#[source] powershell::Error),

    #[error("Windows Update installation failed: {0}")]
    Install(#[source] powershell::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateDescriptor {
    pub title: String,
    pub update_id: String,
    pub reboot_required: bool,
}

/// The updates pending on this host, in the order the agent listed them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateSet {
    updates: Vec<UpdateDescriptor>,
}

impl UpdateSet {
    pub fn new(updates: Vec<UpdateDescriptor>) -> Self {
        Self { updates }
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpdateDescriptor> {
        self.updates.iter()
    }

    /// Whether any member said, at discovery time, that it needs a restart.
    pub fn reboot_required(&self) -> bool {
        self.updates.iter().any(|u| u.reboot_required)
    }
}

/// `OperationResultCode` from the Windows Update Agent API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "i32")]
pub enum ResultCode {
    NotStarted,
    InProgress,
    Succeeded,
    SucceededWithErrors,
    Failed,
    Aborted,
    Other(i32),
}

impl From<i32> for ResultCode {
    fn from(code: i32) -> Self {
        match code {
            0 => ResultCode::NotStarted,
            1 => ResultCode::InProgress,
            2 => ResultCode::Succeeded,
            3 => ResultCode::SucceededWithErrors,
            4 => ResultCode::Failed,
            5 => ResultCode::Aborted,
            other => ResultCode::Other(other),
        }
    }
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Succeeded | ResultCode::SucceededWithErrors)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::NotStarted => f.write_str("NotStarted"),
            ResultCode::InProgress => f.write_str("InProgress"),
            ResultCode::Succeeded => f.write_str("Succeeded"),
            ResultCode::SucceededWithErrors => {
                f.write_str("SucceededWithErrors")
            }
            ResultCode::Failed => f.write_str("Failed"),
            ResultCode::Aborted => f.write_str("Aborted"),
            ResultCode::Other(code) => write!(f, "Other({code})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstallItemResult {
    pub update_id: String,
    pub title: String,
    pub result_code: ResultCode,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstallResult {
    pub result_code: ResultCode,
    pub reboot_required: bool,
    pub items: Vec<InstallItemResult>,
}

impl InstallResult {
    pub fn failures(&self) -> impl Iterator<Item = &InstallItemResult> {
        self.items.iter().filter(|item| !item.result_code.is_success())
    }

    /// Requested updates the installer never reported on are recorded as
    /// not started.
    fn account_for(&mut self, requested: &UpdateSet) {
        for update in requested.iter() {
            let reported = self.items.iter().any(|item| {
                item.update_id.eq_ignore_ascii_case(&update.update_id)
            });
            if !reported {
                self.items.push(InstallItemResult {
                    update_id: update.update_id.clone(),
                    title: update.title.clone(),
                    result_code: ResultCode::NotStarted,
                });
            }
        }
    }
}

/// Finds and applies pending updates.
#[async_trait]
pub trait UpdateDriver: Send + Sync {
    async fn discover(&self) -> Result<UpdateSet, UpdateError>;

    /// Downloads and installs `updates`. Blocks for as long as the installer
    /// runs.
    async fn install(
        &self,
        updates: &UpdateSet,
    ) -> Result<InstallResult, UpdateError>;
}

const SEARCH_CRITERIA: &str =
    "IsInstalled=0 and IsHidden=0 and Type='Software'";

/// The Windows Update Agent COM API, scripted through PowerShell.
pub struct WindowsUpdate {
    ps: PowerShell,
}

impl WindowsUpdate {
    pub fn new(ps: PowerShell) -> Self {
        Self { ps }
    }
}

fn discover_script() -> String {
    format!(
        r#"$session = New-Object -ComObject Microsoft.Update.Session
$result = $session.CreateUpdateSearcher().Search({criteria})
ConvertTo-Json -Compress -InputObject @($result.Updates | ForEach-Object {{
    [pscustomobject]@{{
        Title = $_.Title
        UpdateId = $_.Identity.UpdateID
        RebootRequired = ($_.InstallationBehavior.RebootBehavior -ne 0)
    }}
}})"#,
        criteria = quote(SEARCH_CRITERIA),
    )
}

fn install_script(updates: &UpdateSet) -> String {
    let ids = updates
        .iter()
        .map(|u| quote(&u.update_id))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"$ids = @({ids})
$session = New-Object -ComObject Microsoft.Update.Session
$result = $session.CreateUpdateSearcher().Search({criteria})
$updates = New-Object -ComObject Microsoft.Update.UpdateColl
foreach ($u in $result.Updates) {{
    if ($ids -contains $u.Identity.UpdateID) {{
        if (-not $u.EulaAccepted) {{ $u.AcceptEula() }}
        [void]$updates.Add($u)
    }}
}}
$downloader = $session.CreateUpdateDownloader()
$downloader.Updates = $updates
[void]$downloader.Download()
$installer = $session.CreateUpdateInstaller()
$installer.Updates = $updates
$r = $installer.Install()
$items = for ($i = 0; $i -lt $updates.Count; $i++) {{
    [pscustomobject]@{{
        UpdateId = $updates.Item($i).Identity.UpdateID
        Title = $updates.Item($i).Title
        ResultCode = [int]$r.GetUpdateResult($i).ResultCode
    }}
}}
ConvertTo-Json -Compress -Depth 3 -InputObject ([pscustomobject]@{{
    ResultCode = [int]$r.ResultCode
    RebootRequired = [bool]$r.RebootRequired
    Items = @($items)
}})"#,
        criteria = quote(SEARCH_CRITERIA),
    )
}

#[async_trait]
impl UpdateDriver for WindowsUpdate {
    async fn discover(&self) -> Result<UpdateSet, UpdateError> {
        let updates: Vec<UpdateDescriptor> = self
            .ps
            .run_json("IUpdateSearcher.Search", &discover_script())
            .await
            .map_err(UpdateError::Search)?;
        Ok(UpdateSet::new(updates))
    }

    async fn install(
        &self,
        updates: &UpdateSet,
    ) -> Result<InstallResult, UpdateError> {
        let mut result: InstallResult = self
            .ps
            .run_json("IUpdateInstaller.Install", &install_script(updates))
            .await
            .map_err(UpdateError::Install)?;
        result.account_for(updates);
        Ok(result)
    }
}
