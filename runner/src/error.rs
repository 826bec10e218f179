use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RunnerError {
    pub fn details(&self) -> Option<ProcessErrorDetails> {
        match self {
            RunnerError::ProcessDetailed { details, .. } => Some(details.clone()),
            _ => None,
        }
    }
}

/// Machine-readable context attached to docker failures.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

pub fn docker_spawn_error(err: &io::Error, command: &str) -> RunnerError {
    let details = if err.kind() == io::ErrorKind::NotFound {
        ProcessErrorDetails {
            error_code: "docker_not_found".to_string(),
            hint: Some(
                "Install Docker and ensure `docker` is on your PATH.".to_string(),
            ),
            command: Some(command.to_string()),
            raw_stderr: None,
        }
    } else {
        ProcessErrorDetails {
            error_code: "process_command_failed".to_string(),
            hint: None,
            command: Some(command.to_string()),
            raw_stderr: None,
        }
    };
    RunnerError::ProcessDetailed {
        message: format!("failed to run command `{command}`: {err}"),
        details,
    }
}

/// Maps docker's free-form failure text to an error code and an operator hint.
pub fn classify_docker_failure(text: &str) -> (String, Option<String>) {
    let lower = text.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some(
                "Docker daemon is unreachable. Start Docker Desktop (or dockerd) and try again."
                    .to_string(),
            ),
        );
    }

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return (
            "docker_port_conflict".to_string(),
            Some(
                "The host port is already in use. Stop the other service or pass --port."
                    .to_string(),
            ),
        );
    }

    if lower.contains("is already in use by container") {
        return (
            "docker_name_conflict".to_string(),
            Some(
                "A container with this name already exists. Run `neuron-runner stop` or pass --container-name."
                    .to_string(),
            ),
        );
    }

    if lower.contains("denied")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
    {
        return (
            "docker_registry_auth".to_string(),
            Some(
                "Authenticate with `docker login` if the image is private.".to_string(),
            ),
        );
    }

    ("process_command_failed".to_string(), None)
}
