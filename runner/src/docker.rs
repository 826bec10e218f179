use crate::error::{docker_spawn_error, RunnerError};
use std::io::{self, BufRead, BufReader};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

const STATUS_POLL: Duration = Duration::from_millis(50);

type ExitWaiter = Box<dyn FnOnce() -> io::Result<Option<i32>> + Send>;

/// A spawned external process: its combined stdout/stderr and its exit status.
///
/// Owned by whoever spawned it and consumed by [`crate::output::drain`].
pub struct ManagedProcess {
    command: String,
    output: Box<dyn BufRead + Send>,
    exit: ExitWaiter,
}

impl ManagedProcess {
    pub fn new(command: String, output: Box<dyn BufRead + Send>, exit: ExitWaiter) -> Self {
        Self {
            command,
            output,
            exit,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn output(&mut self) -> &mut dyn BufRead {
        &mut *self.output
    }

    /// Blocks until the process exits. `None` when it was killed by a signal.
    pub fn wait(self) -> io::Result<Option<i32>> {
        let ManagedProcess { output, exit, .. } = self;
        drop(output);
        exit()
    }

    #[cfg(test)]
    pub fn scripted(command: &str, text: &str, exit_code: Option<i32>) -> Self {
        Self::new(
            command.to_string(),
            Box::new(io::Cursor::new(text.as_bytes().to_vec())),
            Box::new(move || Ok(exit_code)),
        )
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

/// The container runtime CLI as seen by the supervisor.
pub trait ContainerRuntime {
    /// Starts a long-running command with stdout and stderr merged, output not yet drained.
    fn spawn(&self, args: &[String]) -> io::Result<ManagedProcess>;

    /// Runs a short command to completion and captures its output.
    fn run(&self, args: &[String]) -> io::Result<CommandOutput>;

    /// Runs a command for its exit status only. `None` when it did not finish within `timeout`.
    fn status_within(&self, args: &[String], _timeout: Duration) -> io::Result<Option<i32>> {
        self.run(args).map(|output| Some(output.status_code))
    }

    fn render(&self, args: &[String]) -> String {
        render_docker_command("docker", args)
    }
}

pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }
}

impl ContainerRuntime for DockerCli {
    fn spawn(&self, args: &[String]) -> io::Result<ManagedProcess> {
        let (reader, writer) = io::pipe()?;
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        let mut child = cmd.spawn()?;
        // The command still holds our copies of the write end; the reader only
        // sees EOF once they are gone.
        drop(cmd);
        Ok(ManagedProcess::new(
            self.render(args),
            Box::new(BufReader::new(reader)),
            Box::new(move || child.wait().map(|status| status.code())),
        ))
    }

    fn run(&self, args: &[String]) -> io::Result<CommandOutput> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        // no code when killed by a signal
        let status_code = output.status.code().unwrap_or(1);
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn status_within(&self, args: &[String], timeout: Duration) -> io::Result<Option<i32>> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status.code().unwrap_or(1)));
            }
            let now = Instant::now();
            if now >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            thread::sleep(STATUS_POLL.min(deadline - now));
        }
    }

    fn render(&self, args: &[String]) -> String {
        render_docker_command(&self.binary, args)
    }
}

pub fn render_docker_command(binary: &str, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(binary));
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
}

/// Polls `docker info` until the daemon answers or `timeout` elapses.
///
/// Each `docker info` call is cut off at the deadline. A missing docker binary
/// is an error, not a timeout.
pub fn wait_for_daemon<R: ContainerRuntime + ?Sized>(
    runtime: &R,
    timeout: Duration,
    interval: Duration,
) -> Result<DaemonStatus, RunnerError> {
    let args = vec!["info".to_string()];
    let deadline = Instant::now() + timeout;
    let mut attempts = 0;
    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let status = runtime
            .status_within(&args, remaining)
            .map_err(|err| docker_spawn_error(&err, &runtime.render(&args)))?;
        if status == Some(0) {
            tracing::debug!(attempts, "docker daemon is ready");
            return Ok(DaemonStatus::Ready { attempts });
        }
        let now = Instant::now();
        if status.is_none() || now >= deadline {
            return Ok(DaemonStatus::TimedOut { attempts });
        }
        tracing::info!(attempts, "waiting for docker daemon");
        thread::sleep(interval.min(deadline - now));
    }
}
