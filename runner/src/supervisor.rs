use crate::browser::Browser;
use crate::config::{setup_install_dir, Config, RuntimeConfig};
use crate::docker::{wait_for_daemon, ContainerRuntime, DaemonStatus};
use crate::error::RunnerError;
use crate::image::ImagePuller;
use crate::launcher::ContainerLauncher;
use crate::output::{classify, drain, ProcessOutcome, DAEMON_UNREACHABLE_MESSAGE};
use crate::relay::{start_background, Relay, RelayHandle, RelayParams, ShutdownSignal};
use crate::version::VersionSource;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Installing,
    VersionResolved,
    RelayStarted,
    ImagePulling,
    ImagePulled,
    ContainerLaunching,
    Running,
    Terminated,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub version: String,
    pub final_state: SupervisorState,
    pub states: Vec<SupervisorState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ProcessOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub started_at: String,
    pub ended_at: String,
}

impl RunReport {
    pub fn failed(&self) -> bool {
        self.final_state == SupervisorState::Failed
    }
}

/// The finished foreground sequence plus the relay, which may still be running.
#[derive(Debug)]
pub struct Supervision {
    pub report: RunReport,
    pub relay: Option<RelayHandle>,
}

struct Trail {
    states: Vec<SupervisorState>,
    started_at: DateTime<Utc>,
}

impl Trail {
    fn new() -> Self {
        Self {
            states: Vec::new(),
            started_at: Utc::now(),
        }
    }

    fn enter(&mut self, state: SupervisorState) {
        tracing::info!(?state, "supervisor state");
        self.states.push(state);
    }

    fn finish(
        mut self,
        version: &str,
        state: SupervisorState,
        outcome: Option<ProcessOutcome>,
        message: Option<String>,
    ) -> RunReport {
        self.enter(state);
        RunReport {
            version: version.to_string(),
            final_state: state,
            states: self.states,
            outcome,
            message,
            started_at: self.started_at.to_rfc3339(),
            ended_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Runs install, pull, launch and output relay once, in order, with the p2p
/// relay alongside. Nothing is retried.
pub struct Supervisor<'a, R: ContainerRuntime + ?Sized> {
    config: &'a RuntimeConfig,
    settings: &'a Config,
    runtime: &'a R,
    versions: &'a dyn VersionSource,
    browser: &'a dyn Browser,
    relay: Option<Arc<dyn Relay>>,
    relay_shutdown: ShutdownSignal,
    runner_path: PathBuf,
}

impl<'a, R: ContainerRuntime + ?Sized> Supervisor<'a, R> {
    pub fn new(
        config: &'a RuntimeConfig,
        settings: &'a Config,
        runtime: &'a R,
        versions: &'a dyn VersionSource,
        browser: &'a dyn Browser,
    ) -> Self {
        Self {
            config,
            settings,
            runtime,
            versions,
            browser,
            relay: None,
            relay_shutdown: ShutdownSignal::default(),
            runner_path: PathBuf::from("neuron-runner"),
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn Relay>, runner_path: PathBuf) -> Self {
        self.relay = Some(relay);
        self.runner_path = runner_path;
        self
    }

    /// The signal that stops the relay; shared with the process shutdown hook.
    pub fn relay_shutdown(&self) -> ShutdownSignal {
        self.relay_shutdown.clone()
    }

    pub fn run(&self, out: &mut dyn Write) -> Result<Supervision, RunnerError> {
        let mut trail = Trail::new();
        trail.enter(SupervisorState::Installing);
        setup_install_dir(self.config)?;
        let version = self.versions.resolve();
        trail.enter(SupervisorState::VersionResolved);

        let relay = self.start_relay(&version);
        trail.enter(SupervisorState::RelayStarted);

        match self.foreground(&version, trail, out) {
            Ok(report) => Ok(Supervision { report, relay }),
            Err(err) => {
                self.relay_shutdown.trigger();
                Err(err)
            }
        }
    }

    fn start_relay(&self, version: &str) -> Option<RelayHandle> {
        let relay = self.relay.as_ref()?;
        let params = RelayParams {
            port: self.config.port,
            version: version.to_string(),
            install_dir: self.config.install_dir.clone(),
            local_url: self.config.local_url(),
            runner_path: self.runner_path.clone(),
            log_path: self.config.relay_log_path(),
        };
        match start_background(Arc::clone(relay), params, self.relay_shutdown.clone()) {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, "could not start relay");
                None
            }
        }
    }

    fn foreground(
        &self,
        version: &str,
        mut trail: Trail,
        out: &mut dyn Write,
    ) -> Result<RunReport, RunnerError> {
        let docker = &self.settings.docker;
        let status = wait_for_daemon(
            self.runtime,
            Duration::from_secs(docker.ready_timeout_sec),
            Duration::from_millis(docker.ready_poll_interval_ms),
        )?;
        if let DaemonStatus::TimedOut { attempts } = status {
            tracing::warn!(attempts, "docker daemon never became ready");
            return Ok(trail.finish(
                version,
                SupervisorState::Failed,
                Some(ProcessOutcome::DaemonUnreachable),
                Some(format!(
                    "Docker did not respond within {}s. {DAEMON_UNREACHABLE_MESSAGE}",
                    docker.ready_timeout_sec
                )),
            ));
        }

        trail.enter(SupervisorState::ImagePulling);
        let puller = ImagePuller::new(self.runtime, &self.settings.image.repository);
        let pull = puller.pull(version)?;
        puller.prune_dangling();
        let pulled = drain(pull, out)?;
        match classify(&pulled) {
            ProcessOutcome::DaemonUnreachable => {
                return Ok(trail.finish(
                    version,
                    SupervisorState::Failed,
                    Some(ProcessOutcome::DaemonUnreachable),
                    Some(format!(
                        "Error encountered while pulling the image. {DAEMON_UNREACHABLE_MESSAGE}"
                    )),
                ));
            }
            ProcessOutcome::OtherFailure { exit_code, .. } => {
                // A cached image may still run; the launch surfaces anything real.
                tracing::warn!(?exit_code, %version, "image pull failed, trying the local image");
            }
            ProcessOutcome::Success => {}
        }
        trail.enter(SupervisorState::ImagePulled);

        self.browser.open(&self.config.local_url());

        trail.enter(SupervisorState::ContainerLaunching);
        let launcher = ContainerLauncher::new(self.runtime, &self.settings.image);
        let container = launcher.launch(version, self.config)?;
        trail.enter(SupervisorState::Running);
        let ran = drain(container, out)?;
        let outcome = classify(&ran);
        let report = match outcome {
            ProcessOutcome::Success => {
                trail.finish(version, SupervisorState::Terminated, Some(outcome), None)
            }
            ProcessOutcome::DaemonUnreachable => {
                let message = format!(
                    "Error occurred while starting or running the neuron. {DAEMON_UNREACHABLE_MESSAGE}"
                );
                trail.finish(
                    version,
                    SupervisorState::Failed,
                    Some(outcome),
                    Some(message),
                )
            }
            ProcessOutcome::OtherFailure { .. } => {
                let message = format!("The neuron container {}", outcome.describe());
                trail.finish(
                    version,
                    SupervisorState::Failed,
                    Some(outcome),
                    Some(message),
                )
            }
        };
        Ok(report)
    }
}
