// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use display_error_chain::DisplayErrorChain;
use hci_utils::cluster::FailoverCluster;
use hci_utils::executor::HostExecutor;
use hci_utils::powershell::PowerShell;
use hci_utils::reboot::RegistryRebootDetector;
use hci_utils::scheduled_task::Schtasks;
use hci_utils::shutdown::Shutdown;
use hci_utils::windows_update::WindowsUpdate;
use slog::{Drain, info};

use crate::config::{Config, LogConfig};
use crate::continuation::ContinuationTarget;
use crate::orchestrator::{Collaborators, Orchestrator, Phase};
use crate::run::RunOutcome;

/// Rolling maintenance for one node of a hyper-converged cluster.
#[derive(Debug, Parser)]
#[command(version)]
pub struct NodeMaintenanceApp {
    /// Where in the maintenance cycle to start.
    #[clap(long, value_enum, default_value_t = Phase::PreReboot)]
    phase: Phase,

    /// Path to the configuration file. Every setting has a default.
    #[clap(long, env = "NODE_MAINTENANCE_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Name of the local cluster node [default: `node_name` from the config
    /// file, then the COMPUTERNAME environment variable].
    #[clap(long)]
    node_name: Option<String>,
}

impl NodeMaintenanceApp {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn load_config(&self) -> Result<Config> {
        match &self.config {
            Some(path) => Ok(Config::from_file(path)?),
            None => Ok(Config::default()),
        }
    }

    /// Executes the app. Succeeds only if the run completed.
    pub async fn exec(self, log: &slog::Logger, config: &Config) -> Result<()> {
        let node = self.node_name(config)?;
        let target = self.continuation_target()?;

        let executor = HostExecutor::new(log.clone()).as_executor();
        let ps =
            PowerShell::new(executor.clone(), config.host.powershell.clone());
        let cluster = Arc::new(FailoverCluster::new(ps.clone()));
        let collaborators = Collaborators {
            cluster: cluster.clone(),
            control: cluster,
            scheduler: Arc::new(Schtasks::new(executor.clone())),
            updates: Arc::new(WindowsUpdate::new(ps)),
            reboot: Arc::new(RegistryRebootDetector::new(
                log,
                executor.clone(),
            )),
            restarter: Arc::new(Shutdown::new(executor)),
        };

        let orchestrator =
            Orchestrator::new(log, node, target, config, collaborators);
        let report = orchestrator.run(self.phase).await;
        info!(
            log, "run report";
            "run_id" => %report.run_id,
            "states" => ?report.states,
            "warnings" => ?report.warnings,
        );

        match &report.outcome {
            RunOutcome::Completed(_) => Ok(()),
            RunOutcome::Aborted { error, .. } => bail!(
                "{} run {} aborted: {}",
                report.phase,
                report.run_id,
                DisplayErrorChain::new(error),
            ),
            RunOutcome::Failed { error, .. } => bail!(
                "{} run {} failed and node {} needs an operator: {}",
                report.phase,
                report.run_id,
                report.node,
                DisplayErrorChain::new(error),
            ),
        }
    }

    /// `--node-name`, then the config file, then `COMPUTERNAME`.
    fn node_name(&self, config: &Config) -> Result<String> {
        if let Some(name) =
            self.node_name.as_ref().or(config.node_name.as_ref())
        {
            return Ok(name.clone());
        }
        std::env::var("COMPUTERNAME").context(
            "cannot determine the local node name: pass --node-name, \
             set node_name in the config file, or set COMPUTERNAME",
        )
    }

    /// The continuation runs from the system directory, so every path it
    /// carries is absolute.
    fn continuation_target(&self) -> Result<ContinuationTarget> {
        let program = std::env::current_exe()
            .context("failed to locate the running executable")?;
        let program = Utf8PathBuf::try_from(program)
            .context("executable path is not valid UTF-8")?;
        let config = self
            .config
            .as_deref()
            .map(|path| {
                path.canonicalize_utf8().with_context(|| {
                    format!("failed to resolve config path {path}")
                })
            })
            .transpose()?;
        Ok(ContinuationTarget { program, config })
    }

    /// Builds the event log: every event goes to the file at `config.path`,
    /// which is appended to and never truncated, and to stderr.
    ///
    /// The file holds one bunyan-format JSON object per line, so values that
    /// span lines (such as command output captured in an error) stay within
    /// their event.
    ///
    /// Events are written from a background thread. They are flushed when
    /// the returned guard is dropped, so hold it until the process exits.
    pub fn setup_log(
        config: &LogConfig,
    ) -> Result<(slog::Logger, slog_async::AsyncGuard)> {
        let path: &Utf8Path = &config.path;
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty())
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create log directory {parent}")
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {path}"))?;

        let level = slog::FilterLevel::from(config.level);
        let file_drain =
            slog_bunyan::with_name("node-maintenance", file).build().fuse();
        let file_drain = slog::Filter::new(file_drain, move |record| {
            level.accepts(record.level())
        })
        .fuse();

        let stderr_drain = stderr_env_drain("RUST_LOG", level);

        let drain = slog::Duplicate::new(file_drain, stderr_drain).fuse();
        let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
        let log = slog::Logger::root(
            drain.fuse(),
            slog::o!("component" => "node-maintenance"),
        );
        Ok((log, guard))
    }
}

pub(crate) fn stderr_env_drain(
    env_var: &str,
    default: slog::FilterLevel,
) -> impl Drain<Ok = (), Err = slog::Never> + use<> {
    let stderr_decorator = slog_term::TermDecorator::new().build();
    let stderr_drain =
        slog_term::FullFormat::new(stderr_decorator).build().fuse();
    let mut builder = slog_envlogger::LogBuilder::new(stderr_drain);
    if let Ok(s) = std::env::var(env_var) {
        builder = builder.parse(&s);
    } else {
        builder = builder.filter(None, default);
    }
    builder.build()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::LogLevel;
    use camino_tempfile::Utf8TempDir;
    use hci_utils::executor::OutputExt;
    use hci_utils::output_to_exec_error;
    use slog::warn;
    use std::process::Output;

    #[test]
    fn phase_defaults_to_pre_reboot() {
        let app = NodeMaintenanceApp::try_parse_from(["node-maintenance"])
            .unwrap();
        assert_eq!(app.phase(), Phase::PreReboot);

        let app = NodeMaintenanceApp::try_parse_from([
            "node-maintenance",
            "--phase",
            "post-reboot",
            "--node-name",
            "node1",
        ])
        .unwrap();
        assert_eq!(app.phase(), Phase::PostReboot);
        assert_eq!(app.node_name(&Config::default()).unwrap(), "node1");

        assert!(
            NodeMaintenanceApp::try_parse_from([
                "node-maintenance",
                "--phase",
                "reboot",
            ])
            .is_err()
        );
    }

    #[test]
    fn node_name_flag_wins_over_config() {
        let config = Config {
            node_name: Some("from-config".to_string()),
            ..Config::default()
        };
        let app = NodeMaintenanceApp::try_parse_from(["node-maintenance"])
            .unwrap();
        assert_eq!(app.node_name(&config).unwrap(), "from-config");

        let app = NodeMaintenanceApp::try_parse_from([
            "node-maintenance",
            "--node-name",
            "from-flag",
        ])
        .unwrap();
        assert_eq!(app.node_name(&config).unwrap(), "from-flag");
    }

    fn read_events(path: &Utf8Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| {
                serde_json::from_str(line).unwrap_or_else(|err| {
                    panic!("event log line is not JSON ({err}): {line}")
                })
            })
            .collect()
    }

    #[test]
    fn event_log_is_appended_to() {
        let dir = Utf8TempDir::new().unwrap();
        let config = LogConfig {
            path: dir.path().join("logs").join("node-maintenance.log"),
            level: LogLevel::Info,
        };

        for run in ["first", "second"] {
            let (log, guard) = NodeMaintenanceApp::setup_log(&config).unwrap();
            info!(log, "run finished"; "run" => run, "outcome" => "SUCCESS");
            slog::debug!(log, "filtered out"; "run" => run);
            warn!(log, "continuation left registered"; "run" => run);
            drop(log);
            drop(guard);
        }

        let events = read_events(&config.path);
        assert_eq!(events.len(), 4, "{events:?}");
        assert_eq!(events[0]["msg"], "run finished");
        assert_eq!(events[0]["run"], "first");
        assert_eq!(events[0]["outcome"], "SUCCESS");
        assert_eq!(events[3]["msg"], "continuation left registered");
        assert_eq!(events[3]["run"], "second");
        assert!(events.iter().all(|event| event["msg"] != "filtered out"));
    }

    #[test]
    fn multi_line_command_output_stays_on_one_line() {
        let dir = Utf8TempDir::new().unwrap();
        let config = LogConfig {
            path: dir.path().join("node-maintenance.log"),
            level: LogLevel::Info,
        };
        let err = output_to_exec_error(
            "powershell.exe -Command Resume-ClusterNode".to_string(),
            &Output::failure().with_stderr(
                "Resume-ClusterNode : The node is not joined.\r\n\
                 At line:1 char:1\r\n\
                 + CategoryInfo : NotSpecified\r\n",
            ),
        );

        let (log, guard) = NodeMaintenanceApp::setup_log(&config).unwrap();
        slog::error!(
            log, "failed to resume node";
            "outcome" => "FAILURE",
            "error" => %DisplayErrorChain::new(&err),
        );
        drop(log);
        drop(guard);

        let contents = std::fs::read_to_string(&config.path).unwrap();
        assert_eq!(contents.lines().count(), 1, "{contents}");
        let events = read_events(&config.path);
        assert_eq!(events[0]["outcome"], "FAILURE");
        let error = events[0]["error"].as_str().unwrap();
        assert!(error.contains("At line:1 char:1"), "{error}");
    }
}
