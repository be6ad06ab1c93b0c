// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for reading and changing failover cluster state.

use crate::powershell::{self, PowerShell, quote};
use crate::storage::{StorageHealth, StorageSubsystem, VirtualDisk};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error(transparent)]
    PowerShell(#[from] powershell::Error),

    #[error("Node '{0}' is not a member of the cluster")]
    NodeNotFound(String),

    #[error("No clustered storage subsystem found")]
    NoStorageSubsystem,
}

/// Membership state of a cluster node, as reported by `Get-ClusterNode`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum NodeState {
    Up,
    Down,
    Paused,
    Joining,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Up => "Up",
            NodeState::Down => "Down",
            NodeState::Paused => "Paused",
            NodeState::Joining => "Joining",
            NodeState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Progress of the role drain started by `Suspend-ClusterNode -Drain`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum DrainStatus {
    NotInitiated,
    InProgress,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for DrainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DrainStatus::NotInitiated => "NotInitiated",
            DrainStatus::InProgress => "InProgress",
            DrainStatus::Completed => "Completed",
            DrainStatus::Failed => "Failed",
            DrainStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterNode {
    pub name: String,
    pub state: NodeState,
    pub drain_status: DrainStatus,
}

impl ClusterNode {
    /// Windows host names compare case-insensitively.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum GroupState {
    Online,
    Offline,
    Failed,
    PartialOnline,
    Pending,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterGroup {
    pub name: String,
    pub owner_node: String,
    pub state: GroupState,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SharedVolume {
    pub name: String,
    pub owner_node: String,
}

impl SharedVolume {
    pub fn is_owned_by(&self, node: &str) -> bool {
        self.owner_node.eq_ignore_ascii_case(node)
    }
}

/// Whether roles move back to a node once it resumes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailbackMode {
    #[default]
    Immediate,
    Policy,
    NoFailback,
}

impl FailbackMode {
    /// The value of `Resume-ClusterNode -Failback`.
    pub fn as_cmdlet_arg(&self) -> &'static str {
        match self {
            FailbackMode::Immediate => "Immediate",
            FailbackMode::Policy => "Policy",
            FailbackMode::NoFailback => "NoFailback",
        }
    }
}

impl fmt::Display for FailbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_cmdlet_arg())
    }
}

/// Read-only access to cluster membership, ownership, and storage health.
#[async_trait]
pub trait ClusterStateReader: Send + Sync {
    /// Lists cluster nodes in the order the cluster returns them.
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, ClusterError>;

    async fn list_groups(&self) -> Result<Vec<ClusterGroup>, ClusterError>;

    async fn list_shared_volumes(
        &self,
    ) -> Result<Vec<SharedVolume>, ClusterError>;

    async fn storage_subsystem(
        &self,
    ) -> Result<StorageSubsystem, ClusterError>;

    async fn list_virtual_disks(
        &self,
    ) -> Result<Vec<VirtualDisk>, ClusterError>;

    async fn get_node(&self, name: &str) -> Result<ClusterNode, ClusterError> {
        self.list_nodes()
            .await?
            .into_iter()
            .find(|node| node.is_named(name))
            .ok_or_else(|| ClusterError::NodeNotFound(name.to_string()))
    }

    async fn storage_health(&self) -> Result<StorageHealth, ClusterError> {
        let subsystem = self.storage_subsystem().await?;
        let virtual_disks = self.list_virtual_disks().await?;
        Ok(StorageHealth { subsystem, virtual_disks })
    }
}

/// The cluster operations that change membership or ownership.
///
/// These return once the cluster has accepted the request; callers that
/// need the transition to complete poll through [`ClusterStateReader`].
#[async_trait]
pub trait ClusterControl: Send + Sync {
    async fn suspend_node(&self, name: &str) -> Result<(), ClusterError>;

    async fn resume_node(
        &self,
        name: &str,
        failback: FailbackMode,
    ) -> Result<(), ClusterError>;

    /// Moves `volume` to `node`, letting the cluster wait up to `wait` for
    /// the move to finish.
    async fn move_shared_volume(
        &self,
        volume: &str,
        node: &str,
        wait: Duration,
    ) -> Result<(), ClusterError>;
}

const LIST_NODES: &str = "ConvertTo-Json -Compress -InputObject @(\
    Get-ClusterNode | ForEach-Object { [pscustomobject]@{ \
    Name = $_.Name; State = \"$($_.State)\"; \
    DrainStatus = \"$($_.DrainStatus)\" } })";

const LIST_GROUPS: &str = "ConvertTo-Json -Compress -InputObject @(\
    Get-ClusterGroup | ForEach-Object { [pscustomobject]@{ \
    Name = $_.Name; OwnerNode = \"$($_.OwnerNode.Name)\"; \
    State = \"$($_.State)\" } })";

const LIST_SHARED_VOLUMES: &str = "ConvertTo-Json -Compress -InputObject @(\
    Get-ClusterSharedVolume | ForEach-Object { [pscustomobject]@{ \
    Name = $_.Name; OwnerNode = \"$($_.OwnerNode.Name)\" } })";

const LIST_STORAGE_SUBSYSTEMS: &str = "ConvertTo-Json -Compress -InputObject @(\
    Get-StorageSubSystem -FriendlyName 'Clustered Windows Storage*' | \
    ForEach-Object { [pscustomobject]@{ \
    FriendlyName = $_.FriendlyName; HealthStatus = \"$($_.HealthStatus)\" } })";

const LIST_VIRTUAL_DISKS: &str = "ConvertTo-Json -Compress -InputObject @(\
    Get-VirtualDisk | ForEach-Object { [pscustomobject]@{ \
    FriendlyName = $_.FriendlyName; HealthStatus = \"$($_.HealthStatus)\"; \
    OperationalStatus = \"$($_.OperationalStatus)\" } })";

/// The local failover cluster, driven through the FailoverClusters and
/// Storage PowerShell modules.
pub struct FailoverCluster {
    ps: PowerShell,
}

impl FailoverCluster {
    pub fn new(ps: PowerShell) -> Self {
        Self { ps }
    }
}

#[async_trait]
impl ClusterStateReader for FailoverCluster {
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, ClusterError> {
        Ok(self.ps.run_json("Get-ClusterNode", LIST_NODES).await?)
    }

    async fn list_groups(&self) -> Result<Vec<ClusterGroup>, ClusterError> {
        Ok(self.ps.run_json("Get-ClusterGroup", LIST_GROUPS).await?)
    }

    async fn list_shared_volumes(
        &self,
    ) -> Result<Vec<SharedVolume>, ClusterError> {
        Ok(self
            .ps
            .run_json("Get-ClusterSharedVolume", LIST_SHARED_VOLUMES)
            .await?)
    }

    async fn storage_subsystem(
        &self,
    ) -> Result<StorageSubsystem, ClusterError> {
        let subsystems: Vec<StorageSubsystem> = self
            .ps
            .run_json("Get-StorageSubSystem", LIST_STORAGE_SUBSYSTEMS)
            .await?;
        subsystems.into_iter().next().ok_or(ClusterError::NoStorageSubsystem)
    }

    async fn list_virtual_disks(
        &self,
    ) -> Result<Vec<VirtualDisk>, ClusterError> {
        Ok(self.ps.run_json("Get-VirtualDisk", LIST_VIRTUAL_DISKS).await?)
    }
}

#[async_trait]
impl ClusterControl for FailoverCluster {
    async fn suspend_node(&self, name: &str) -> Result<(), ClusterError> {
        let script = format!(
            "Suspend-ClusterNode -Name {} -Drain | Out-Null",
            quote(name)
        );
        Ok(self.ps.run(&script).await?)
    }

    async fn resume_node(
        &self,
        name: &str,
        failback: FailbackMode,
    ) -> Result<(), ClusterError> {
        let script = format!(
            "Resume-ClusterNode -Name {} -Failback {} | Out-Null",
            quote(name),
            failback.as_cmdlet_arg(),
        );
        Ok(self.ps.run(&script).await?)
    }

    async fn move_shared_volume(
        &self,
        volume: &str,
        node: &str,
        wait: Duration,
    ) -> Result<(), ClusterError> {
        let script = format!(
            "Move-ClusterSharedVolume -Name {} -Node {} -Wait {} | Out-Null",
            quote(volume),
            quote(node),
            wait.as_secs(),
        );
        Ok(self.ps.run(&script).await?)
    }
}
