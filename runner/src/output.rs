use crate::docker::ManagedProcess;
use crate::error::{classify_docker_failure, RunnerError};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{BufRead, Write};

/// Docker prints this when it cannot reach its daemon. Matched case-sensitively
/// at the start of a line.
pub const DAEMON_UNREACHABLE_PREFIX: &str = "docker: error during connect";

pub const DAEMON_UNREACHABLE_MESSAGE: &str = "Neuron could not start, the Docker daemon may \
    not be running. You might have to start Docker Desktop, and try again.";

const TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Empty when no sentinel line was seen.
    pub error_signal: String,
    pub exit_code: Option<i32>,
    pub tail: Vec<String>,
    pub lines: usize,
}

impl DrainReport {
    pub fn has_error_signal(&self) -> bool {
        !self.error_signal.is_empty()
    }
}

/// Echoes every line of `process` to `out` as it arrives, watches for the
/// daemon sentinel, then waits for the process to exit.
pub fn drain(
    mut process: ManagedProcess,
    out: &mut dyn Write,
) -> Result<DrainReport, RunnerError> {
    let mut error_signal = String::new();
    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    let mut lines = 0;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = match process.output().read_until(b'\n', &mut buf) {
            Ok(read) => read,
            Err(err) => {
                // dropping the reader lets the child die on its next write
                let command = process.command().to_string();
                let exit_code = process.wait();
                tracing::warn!(%command, ?exit_code, error = %err, "lost process output");
                return Err(err.into());
            }
        };
        if read == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end();
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
        if is_sentinel(line) {
            error_signal = DAEMON_UNREACHABLE_MESSAGE.to_string();
        }
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
        lines += 1;
    }
    let command = process.command().to_string();
    let exit_code = process.wait()?;
    tracing::debug!(%command, ?exit_code, lines, "process finished");
    Ok(DrainReport {
        error_signal,
        exit_code,
        tail: tail.into_iter().collect(),
        lines,
    })
}

pub fn is_sentinel(line: &str) -> bool {
    line.starts_with(DAEMON_UNREACHABLE_PREFIX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Success,
    DaemonUnreachable,
    OtherFailure {
        exit_code: Option<i32>,
        tail: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
}

impl ProcessOutcome {
    pub fn describe(&self) -> String {
        match self {
            ProcessOutcome::Success => "exited normally".to_string(),
            ProcessOutcome::DaemonUnreachable => DAEMON_UNREACHABLE_MESSAGE.to_string(),
            ProcessOutcome::OtherFailure {
                exit_code,
                hint,
                ..
            } => {
                let mut message = match exit_code {
                    Some(code) => format!("exited with status {code}"),
                    None => "was terminated by a signal".to_string(),
                };
                if let Some(hint) = hint {
                    message = format!("{message}\nHint: {hint}");
                }
                message
            }
        }
    }
}

pub fn classify(report: &DrainReport) -> ProcessOutcome {
    if report.has_error_signal() {
        return ProcessOutcome::DaemonUnreachable;
    }
    if report.exit_code == Some(0) {
        return ProcessOutcome::Success;
    }
    let (_, hint) = classify_docker_failure(&report.tail.join("\n"));
    ProcessOutcome::OtherFailure {
        exit_code: report.exit_code,
        tail: report.tail.clone(),
        hint,
    }
}
