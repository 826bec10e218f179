//! Stops the managed container when the runner itself is interrupted.
//!
//! `docker run` keeps the container alive when its client dies, so the runner
//! catches SIGINT, SIGTERM and SIGHUP, stops the container by name, and exits.
//! Windows has no equivalent hook; there the container outlives a killed runner
//! and has to be stopped with `neuron-runner stop`.

use crate::error::RunnerError;
use crate::relay::ShutdownSignal;

pub fn stop_args(container_name: &str) -> Vec<String> {
    vec!["stop".to_string(), container_name.to_string()]
}

#[cfg(unix)]
pub fn install_container_stop_hook(
    docker_binary: &str,
    container_name: &str,
    relay: ShutdownSignal,
) -> Result<(), RunnerError> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::process::{Command, Stdio};
    use std::thread;
    use std::time::Duration;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    let binary = docker_binary.to_string();
    let args = stop_args(container_name);
    thread::Builder::new()
        .name("shutdown".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                tracing::warn!(signal, "interrupted, stopping neuron container");
                relay.trigger();
                let stopped = Command::new(&binary)
                    .args(&args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
                if let Err(err) = stopped {
                    tracing::warn!(error = %err, "docker stop failed");
                }
                // give the relay thread one poll to kill its child
                thread::sleep(Duration::from_millis(300));
                std::process::exit(128 + signal);
            }
        })?;
    Ok(())
}

#[cfg(not(unix))]
pub fn install_container_stop_hook(
    _docker_binary: &str,
    container_name: &str,
    _relay: ShutdownSignal,
) -> Result<(), RunnerError> {
    tracing::debug!(container_name, "no shutdown hook on this platform");
    Ok(())
}
