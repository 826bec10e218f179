use crate::config::Relay as RelaySettings;
use crate::error::RunnerError;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What the relay needs to know about the neuron it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayParams {
    pub port: u16,
    pub version: String,
    pub install_dir: PathBuf,
    pub local_url: String,
    pub runner_path: PathBuf,
    pub log_path: PathBuf,
}

/// One-shot flag the foreground flips to ask the relay to stop.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn trigger(&self) {
        let (lock, condvar) = &*self.inner;
        if let Ok(mut stopped) = lock.lock() {
            *stopped = true;
            condvar.notify_all();
        }
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        lock.lock().map(|stopped| *stopped).unwrap_or(true)
    }

    /// Sleeps up to `timeout`; returns true as soon as shutdown is requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let Ok(guard) = lock.lock() else {
            return true;
        };
        match condvar.wait_timeout_while(guard, timeout, |stopped| !*stopped) {
            Ok((stopped, _)) => *stopped,
            Err(_) => true,
        }
    }
}

/// The p2p relay body. Runs on its own thread until it ends or `shutdown` fires.
pub trait Relay: Send + Sync {
    fn run(&self, params: &RelayParams, shutdown: &ShutdownSignal) -> Result<(), RunnerError>;
}

/// Runs the relay as an external program, output appended to `params.log_path`.
pub struct ProcessRelay {
    command: String,
    args: Vec<String>,
}

impl ProcessRelay {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            command: settings.command.clone(),
            args: settings.args.clone(),
        }
    }

    fn command_args(&self, params: &RelayParams) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            params.port.to_string(),
            "--version".to_string(),
            params.version.clone(),
            "--install-dir".to_string(),
            params.install_dir.to_string_lossy().to_string(),
            "--url".to_string(),
            params.local_url.clone(),
            "--runner".to_string(),
            params.runner_path.to_string_lossy().to_string(),
        ];
        args.extend(self.args.iter().cloned());
        args
    }
}

impl Relay for ProcessRelay {
    fn run(&self, params: &RelayParams, shutdown: &ShutdownSignal) -> Result<(), RunnerError> {
        let program = which::which(&self.command).map_err(|err| {
            RunnerError::Process(format!("relay program `{}` not found: {err}", self.command))
        })?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&params.log_path)?;
        let mut child = Command::new(&program)
            .args(self.command_args(params))
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .map_err(start_error)?;
        tracing::info!(program = %program.display(), pid = child.id(), "relay started");

        loop {
            if let Some(status) = child.try_wait()? {
                if status.success() {
                    tracing::info!(%status, "relay exited");
                    return Ok(());
                }
                let message = format!("relay exited with status {status}");
                return Err(RunnerError::Process(message));
            }
            if shutdown.wait_timeout(Duration::from_millis(250)) {
                let _ = child.kill();
                let _ = child.wait();
                tracing::info!("relay stopped");
                return Ok(());
            }
        }
    }
}

fn start_error(err: io::Error) -> RunnerError {
    RunnerError::Process(format!("failed to start relay: {err}"))
}

/// Handle to the background relay thread. Dropping it detaches the thread.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: ShutdownSignal,
    thread: Option<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Asks the relay to stop and waits up to `timeout` for the thread to end.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        self.shutdown.trigger();
        let Some(handle) = self.thread.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = handle.join();
        true
    }
}

/// Starts the relay on a detached thread and returns immediately.
///
/// Relay failures are logged on that thread and never reach the caller.
pub fn start_background(
    relay: Arc<dyn Relay>,
    params: RelayParams,
    shutdown: ShutdownSignal,
) -> Result<RelayHandle, RunnerError> {
    let thread_signal = shutdown.clone();
    let thread = thread::Builder::new()
        .name("relay".to_string())
        .spawn(move || {
            if let Err(err) = relay.run(&params, &thread_signal) {
                tracing::warn!(error = %err, "relay stopped with an error");
            }
        })?;
    Ok(RelayHandle {
        shutdown,
        thread: Some(thread),
    })
}
