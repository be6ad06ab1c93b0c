// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators for exercising the orchestrator without a
//! cluster.
//!
//! Every fake records what it was asked to do in a shared [`Journal`], so a
//! test can assert the order of calls across collaborators.

use async_trait::async_trait;
use hci_utils::ExecutionError;
use hci_utils::cluster::{
    ClusterControl, ClusterError, ClusterGroup, ClusterNode,
    ClusterStateReader, DrainStatus, FailbackMode, GroupState, NodeState,
    SharedVolume,
};
use hci_utils::powershell;
use hci_utils::reboot::{RebootDetector, RebootSignals};
use hci_utils::scheduled_task::{TaskDefinition, TaskError, TaskScheduler};
use hci_utils::shutdown::Restarter;
use hci_utils::storage::{
    HealthStatus, OperationalStatus, StorageSubsystem, VirtualDisk,
};
use hci_utils::windows_update::{
    InstallItemResult, InstallResult, ResultCode, UpdateDescriptor,
    UpdateDriver, UpdateError, UpdateSet,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    ListNodes,
    ListGroups,
    ListSharedVolumes,
    StorageSubsystem,
    ListVirtualDisks,
    Suspend { node: String },
    Resume { node: String, failback: FailbackMode },
    MoveVolume { volume: String, node: String },
    TaskExists { name: String },
    CreateTask { name: String },
    DeleteTask { name: String },
    Discover,
    Install { updates: Vec<String> },
    RebootSignals,
    Restart { delay: Duration },
}

impl Call {
    /// Whether the call changes cluster, host, or scheduler state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Call::Suspend { .. }
                | Call::Resume { .. }
                | Call::MoveVolume { .. }
                | Call::CreateTask { .. }
                | Call::DeleteTask { .. }
                | Call::Install { .. }
                | Call::Restart { .. }
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct Journal(Arc<Mutex<Vec<Call>>>);

impl Journal {
    fn record(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    /// Index of the first call matching `pred`.
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls().iter().position(pred)
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| pred(call)).count()
    }
}

fn injected(command: &str) -> ExecutionError {
    ExecutionError::ExecutionStart {
        command: command.to_string(),
        err: std::io::Error::other("injected failure"),
    }
}

fn injected_cluster(command: &str) -> ClusterError {
    ClusterError::PowerShell(powershell::Error::Execution(injected(command)))
}

fn injected_update(command: &str) -> powershell::Error {
    powershell::Error::Execution(injected(command))
}

struct ClusterState {
    nodes: Vec<ClusterNode>,
    groups: Vec<ClusterGroup>,
    volumes: Vec<SharedVolume>,
    subsystem: StorageSubsystem,
    disks: Vec<VirtualDisk>,
    rejoin: Option<Rejoin>,
}

/// A node that changes state after it has been read a number of times.
struct Rejoin {
    node: String,
    reads: usize,
    state: NodeState,
}

impl ClusterState {
    fn read_nodes(&mut self) -> Vec<ClusterNode> {
        if let Some(rejoin) = &mut self.rejoin {
            if rejoin.reads == 0 {
                let (name, state) = (rejoin.node.clone(), rejoin.state);
                self.rejoin = None;
                if let Some(node) =
                    self.nodes.iter_mut().find(|node| node.is_named(&name))
                {
                    node.state = state;
                }
            } else {
                rejoin.reads -= 1;
            }
        }
        self.nodes.clone()
    }
}

pub struct FakeCluster {
    journal: Journal,
    state: Mutex<ClusterState>,
    fail_suspend: bool,
    fail_resume: bool,
    suspend_drain_status: DrainStatus,
    fail_moves: BTreeSet<String>,
    hang_moves: BTreeSet<String>,
    slow_moves: BTreeMap<String, Duration>,
}

pub struct FakeClusterBuilder {
    journal: Journal,
    state: ClusterState,
    fail_suspend: bool,
    fail_resume: bool,
    suspend_drain_status: DrainStatus,
    fail_moves: BTreeSet<String>,
    hang_moves: BTreeSet<String>,
    slow_moves: BTreeMap<String, Duration>,
}

impl FakeCluster {
    /// A cluster with a healthy storage subsystem and no nodes, disks, or
    /// volumes.
    pub fn builder() -> FakeClusterBuilder {
        FakeClusterBuilder {
            journal: Journal::default(),
            state: ClusterState {
                nodes: Vec::new(),
                groups: Vec::new(),
                volumes: Vec::new(),
                subsystem: StorageSubsystem {
                    friendly_name: "Clustered Windows Storage on hci1"
                        .to_string(),
                    health_status: HealthStatus::Healthy,
                },
                disks: Vec::new(),
                rejoin: None,
            },
            fail_suspend: false,
            fail_resume: false,
            suspend_drain_status: DrainStatus::Completed,
            fail_moves: BTreeSet::new(),
            hang_moves: BTreeSet::new(),
            slow_moves: BTreeMap::new(),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.journal.calls()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.journal.mutations()
    }

    pub fn node(&self, name: &str) -> ClusterNode {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .find(|node| node.is_named(name))
            .cloned()
            .unwrap_or_else(|| panic!("no node named {name}"))
    }

    pub fn volumes_owned_by(&self, node: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .volumes
            .iter()
            .filter(|volume| volume.is_owned_by(node))
            .map(|volume| volume.name.clone())
            .collect()
    }
}

impl FakeClusterBuilder {
    pub fn journal(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    /// Adds nodes that are Up and not draining.
    pub fn nodes(mut self, names: &[&str]) -> Self {
        self.state.nodes.extend(names.iter().map(|name| ClusterNode {
            name: name.to_string(),
            state: NodeState::Up,
            drain_status: DrainStatus::NotInitiated,
        }));
        self
    }

    pub fn node_state(mut self, name: &str, state: NodeState) -> Self {
        let node = self
            .state
            .nodes
            .iter_mut()
            .find(|node| node.is_named(name))
            .unwrap_or_else(|| panic!("no node named {name}"));
        node.state = state;
        if state == NodeState::Paused {
            node.drain_status = DrainStatus::Completed;
        }
        self
    }

    /// `name` keeps its current state for `reads` node listings, then
    /// reports `state`.
    pub fn rejoins_after(
        mut self,
        name: &str,
        reads: usize,
        state: NodeState,
    ) -> Self {
        self.state.rejoin =
            Some(Rejoin { node: name.to_string(), reads, state });
        self
    }

    pub fn volume(mut self, name: &str, owner: &str) -> Self {
        self.state.volumes.push(SharedVolume {
            name: name.to_string(),
            owner_node: owner.to_string(),
        });
        self
    }

    pub fn group(mut self, name: &str, owner: &str) -> Self {
        self.state.groups.push(ClusterGroup {
            name: name.to_string(),
            owner_node: owner.to_string(),
            state: GroupState::Online,
        });
        self
    }

    pub fn disk(
        mut self,
        name: &str,
        health: HealthStatus,
        operational: &str,
    ) -> Self {
        self.state.disks.push(VirtualDisk {
            friendly_name: name.to_string(),
            health_status: health,
            operational_status: OperationalStatus(operational.to_string()),
        });
        self
    }

    pub fn subsystem_health(mut self, health: HealthStatus) -> Self {
        self.state.subsystem.health_status = health;
        self
    }

    pub fn fail_suspend(mut self) -> Self {
        self.fail_suspend = true;
        self
    }

    pub fn fail_resume(mut self) -> Self {
        self.fail_resume = true;
        self
    }

    /// The drain status a node reports once suspended.
    pub fn suspend_drain_status(mut self, status: DrainStatus) -> Self {
        self.suspend_drain_status = status;
        self
    }

    pub fn fail_move_of(mut self, volume: &str) -> Self {
        self.fail_moves.insert(volume.to_string());
        self
    }

    /// Moving `volume` never finishes.
    pub fn hang_move_of(mut self, volume: &str) -> Self {
        self.hang_moves.insert(volume.to_string());
        self
    }

    /// Moving `volume` takes `duration` before it succeeds.
    pub fn slow_move_of(mut self, volume: &str, duration: Duration) -> Self {
        self.slow_moves.insert(volume.to_string(), duration);
        self
    }

    pub fn build(self) -> Arc<FakeCluster> {
        Arc::new(FakeCluster {
            journal: self.journal,
            state: Mutex::new(self.state),
            fail_suspend: self.fail_suspend,
            fail_resume: self.fail_resume,
            suspend_drain_status: self.suspend_drain_status,
            fail_moves: self.fail_moves,
            hang_moves: self.hang_moves,
            slow_moves: self.slow_moves,
        })
    }
}

#[async_trait]
impl ClusterStateReader for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, ClusterError> {
        self.journal.record(Call::ListNodes);
        Ok(self.state.lock().unwrap().read_nodes())
    }

    async fn list_groups(&self) -> Result<Vec<ClusterGroup>, ClusterError> {
        self.journal.record(Call::ListGroups);
        Ok(self.state.lock().unwrap().groups.clone())
    }

    async fn list_shared_volumes(
        &self,
    ) -> Result<Vec<SharedVolume>, ClusterError> {
        self.journal.record(Call::ListSharedVolumes);
        Ok(self.state.lock().unwrap().volumes.clone())
    }

    async fn storage_subsystem(
        &self,
    ) -> Result<StorageSubsystem, ClusterError> {
        self.journal.record(Call::StorageSubsystem);
        Ok(self.state.lock().unwrap().subsystem.clone())
    }

    async fn list_virtual_disks(
        &self,
    ) -> Result<Vec<VirtualDisk>, ClusterError> {
        self.journal.record(Call::ListVirtualDisks);
        Ok(self.state.lock().unwrap().disks.clone())
    }
}

#[async_trait]
impl ClusterControl for FakeCluster {
    async fn suspend_node(&self, name: &str) -> Result<(), ClusterError> {
        self.journal.record(Call::Suspend { node: name.to_string() });
        if self.fail_suspend {
            return Err(injected_cluster("Suspend-ClusterNode"));
        }
        let mut state = self.state.lock().unwrap();
        let node = state
            .nodes
            .iter_mut()
            .find(|node| node.is_named(name))
            .ok_or_else(|| ClusterError::NodeNotFound(name.to_string()))?;
        node.state = NodeState::Paused;
        node.drain_status = self.suspend_drain_status;
        Ok(())
    }

    async fn resume_node(
        &self,
        name: &str,
        failback: FailbackMode,
    ) -> Result<(), ClusterError> {
        self.journal.record(Call::Resume { node: name.to_string(), failback });
        if self.fail_resume {
            return Err(injected_cluster("Resume-ClusterNode"));
        }
        let mut state = self.state.lock().unwrap();
        let node = state
            .nodes
            .iter_mut()
            .find(|node| node.is_named(name))
            .ok_or_else(|| ClusterError::NodeNotFound(name.to_string()))?;
        node.state = NodeState::Up;
        node.drain_status = DrainStatus::NotInitiated;
        Ok(())
    }

    async fn move_shared_volume(
        &self,
        volume: &str,
        node: &str,
        _wait: Duration,
    ) -> Result<(), ClusterError> {
        self.journal.record(Call::MoveVolume {
            volume: volume.to_string(),
            node: node.to_string(),
        });
        if self.hang_moves.contains(volume) {
            futures::future::pending::<()>().await;
        }
        if let Some(duration) = self.slow_moves.get(volume) {
            tokio::time::sleep(*duration).await;
        }
        if self.fail_moves.contains(volume) {
            return Err(injected_cluster("Move-ClusterSharedVolume"));
        }
        let mut state = self.state.lock().unwrap();
        for shared in state.volumes.iter_mut().filter(|v| v.name == volume) {
            shared.owner_node = node.to_string();
        }
        Ok(())
    }
}

pub struct FakeScheduler {
    journal: Journal,
    tasks: Mutex<Vec<TaskDefinition>>,
    fail_create: bool,
    fail_delete: bool,
}

impl FakeScheduler {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            tasks: Mutex::new(Vec::new()),
            fail_create: false,
            fail_delete: false,
        }
    }

    /// Starts with a task named `name` already registered.
    pub fn with_task(self, name: &str) -> Self {
        self.tasks.lock().unwrap().push(TaskDefinition {
            name: name.to_string(),
            program: "stale.exe".into(),
            arguments: Vec::new(),
        });
        self
    }

    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn fail_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    pub fn tasks(&self) -> Vec<TaskDefinition> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskScheduler for FakeScheduler {
    async fn exists(&self, name: &str) -> Result<bool, TaskError> {
        self.journal.record(Call::TaskExists { name: name.to_string() });
        Ok(self.tasks.lock().unwrap().iter().any(|task| task.name == name))
    }

    async fn create(&self, task: &TaskDefinition) -> Result<(), TaskError> {
        self.journal.record(Call::CreateTask { name: task.name.clone() });
        if self.fail_create {
            return Err(TaskError::Create {
                name: task.name.clone(),
                err: injected("schtasks /Create"),
            });
        }
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|existing| existing.name != task.name);
        tasks.push(task.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), TaskError> {
        self.journal.record(Call::DeleteTask { name: name.to_string() });
        let mut tasks = self.tasks.lock().unwrap();
        if self.fail_delete || !tasks.iter().any(|task| task.name == name) {
            return Err(TaskError::Delete {
                name: name.to_string(),
                err: injected("schtasks /Delete"),
            });
        }
        tasks.retain(|task| task.name != name);
        Ok(())
    }
}

pub struct FakeUpdates {
    journal: Journal,
    pending: Vec<UpdateDescriptor>,
    install_reboot_required: bool,
    failing: BTreeSet<String>,
    fail_discover: bool,
    fail_install: bool,
}

impl FakeUpdates {
    pub fn new(journal: &Journal, pending: Vec<UpdateDescriptor>) -> Self {
        Self {
            journal: journal.clone(),
            pending,
            install_reboot_required: false,
            failing: BTreeSet::new(),
            fail_discover: false,
            fail_install: false,
        }
    }

    /// `count` pending updates that all say they need a restart, or all
    /// say they don't.
    pub fn pending(journal: &Journal, count: usize, reboot: bool) -> Self {
        let pending = (1..=count)
            .map(|i| UpdateDescriptor {
                title: format!("2026-10 Cumulative Update part {i}"),
                update_id: format!("update-{i}"),
                reboot_required: reboot,
            })
            .collect();
        Self::new(journal, pending).install_reboot_required(reboot)
    }

    pub fn install_reboot_required(mut self, required: bool) -> Self {
        self.install_reboot_required = required;
        self
    }

    pub fn fail_item(mut self, update_id: &str) -> Self {
        self.failing.insert(update_id.to_string());
        self
    }

    pub fn fail_discover(mut self) -> Self {
        self.fail_discover = true;
        self
    }

    pub fn fail_install(mut self) -> Self {
        self.fail_install = true;
        self
    }
}

#[async_trait]
impl UpdateDriver for FakeUpdates {
    async fn discover(&self) -> Result<UpdateSet, UpdateError> {
        self.journal.record(Call::Discover);
        if self.fail_discover {
            return Err(UpdateError::Search(injected_update("Search")));
        }
        Ok(UpdateSet::new(self.pending.clone()))
    }

    async fn install(
        &self,
        updates: &UpdateSet,
    ) -> Result<InstallResult, UpdateError> {
        self.journal.record(Call::Install {
            updates: updates.iter().map(|u| u.update_id.clone()).collect(),
        });
        if self.fail_install {
            return Err(UpdateError::Install(injected_update("Install")));
        }
        let items: Vec<InstallItemResult> = updates
            .iter()
            .map(|update| InstallItemResult {
                update_id: update.update_id.clone(),
                title: update.title.clone(),
                result_code: if self.failing.contains(&update.update_id) {
                    ResultCode::Failed
                } else {
                    ResultCode::Succeeded
                },
            })
            .collect();
        let result_code = if self.failing.is_empty() {
            ResultCode::Succeeded
        } else {
            ResultCode::SucceededWithErrors
        };
        Ok(InstallResult {
            result_code,
            reboot_required: self.install_reboot_required,
            items,
        })
    }
}

pub struct FakeRebootDetector {
    journal: Journal,
    signals: RebootSignals,
}

impl FakeRebootDetector {
    pub fn new(journal: &Journal, pending: bool) -> Self {
        let signals = RebootSignals {
            component_servicing: pending,
            ..Default::default()
        };
        Self { journal: journal.clone(), signals }
    }
}

#[async_trait]
impl RebootDetector for FakeRebootDetector {
    async fn signals(&self) -> RebootSignals {
        self.journal.record(Call::RebootSignals);
        self.signals
    }
}

pub struct FakeRestarter {
    journal: Journal,
    fail: bool,
}

impl FakeRestarter {
    pub fn new(journal: &Journal) -> Self {
        Self { journal: journal.clone(), fail: false }
    }

    pub fn fail(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl Restarter for FakeRestarter {
    async fn restart(
        &self,
        delay: Duration,
        _reason: &str,
    ) -> Result<(), ExecutionError> {
        self.journal.record(Call::Restart { delay });
        if self.fail {
            return Err(injected("shutdown /r"));
        }
        Ok(())
    }
}
