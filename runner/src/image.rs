use crate::docker::{ContainerRuntime, ManagedProcess};
use crate::error::{docker_spawn_error, RunnerError};

pub fn image_reference(repository: &str, version: &str) -> String {
    format!("{repository}:{version}")
}

pub fn pull_args(repository: &str, version: &str) -> Vec<String> {
    vec!["pull".to_string(), image_reference(repository, version)]
}

fn dangling_query_args(repository: &str) -> Vec<String> {
    vec![
        "images".to_string(),
        "-q".to_string(),
        "-f".to_string(),
        format!("reference={repository}"),
        "-f".to_string(),
        "dangling=true".to_string(),
    ]
}

pub struct ImagePuller<'a, R: ContainerRuntime + ?Sized> {
    runtime: &'a R,
    repository: &'a str,
}

impl<'a, R: ContainerRuntime + ?Sized> ImagePuller<'a, R> {
    pub fn new(runtime: &'a R, repository: &'a str) -> Self {
        Self {
            runtime,
            repository,
        }
    }

    /// Starts `docker pull <repository>:<version>`; the caller drains its output.
    pub fn pull(&self, version: &str) -> Result<ManagedProcess, RunnerError> {
        let args = pull_args(self.repository, version);
        tracing::info!(command = %self.runtime.render(&args), "pulling image");
        self.runtime
            .spawn(&args)
            .map_err(|err| docker_spawn_error(&err, &self.runtime.render(&args)))
    }

    /// Removes untagged images left behind by earlier pulls. Failures are only logged.
    pub fn prune_dangling(&self) {
        if let Err(err) = self.try_prune() {
            tracing::warn!(repository = self.repository, error = %err, "pruning dangling images failed");
        }
    }

    fn try_prune(&self) -> Result<usize, RunnerError> {
        let query = dangling_query_args(self.repository);
        let listed = self
            .runtime
            .run(&query)
            .map_err(|err| docker_spawn_error(&err, &self.runtime.render(&query)))?;
        if !listed.success() {
            return Err(RunnerError::Process(format!(
                "`{}` exited with status {}: {}",
                self.runtime.render(&query),
                listed.status_code,
                String::from_utf8_lossy(&listed.stderr).trim()
            )));
        }
        let mut ids: Vec<String> = String::from_utf8_lossy(&listed.stdout)
            .lines()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            tracing::debug!(repository = self.repository, "no dangling images");
            return Ok(0);
        }
        let count = ids.len();
        let mut rmi = vec!["rmi".to_string()];
        rmi.extend(ids);
        let removed = self
            .runtime
            .run(&rmi)
            .map_err(|err| docker_spawn_error(&err, &self.runtime.render(&rmi)))?;
        if !removed.success() {
            return Err(RunnerError::Process(format!(
                "docker rmi exited with status {}: {}",
                removed.status_code,
                String::from_utf8_lossy(&removed.stderr).trim()
            )));
        }
        tracing::info!(
            repository = self.repository,
            count,
            "removed dangling images"
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::mock::MockRuntime;
    use std::io;

    #[test]
    fn pull_spawns_repository_and_version() {
        let runtime = MockRuntime::default();
        let puller = ImagePuller::new(&runtime, "satorinet/satorineuron");
        let process = puller.pull("v42").unwrap();
        assert_eq!(process.command(), "docker pull satorinet/satorineuron:v42");
        let calls = runtime.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["pull", "satorinet/satorineuron:v42"]);
    }

    #[test]
    fn pull_reports_missing_docker() {
        let runtime = MockRuntime::default();
        *runtime.spawn_error.borrow_mut() = Some(io::ErrorKind::NotFound);
        let puller = ImagePuller::new(&runtime, "satorinet/satorineuron");
        let err = puller.pull("latest").expect_err("spawn fails");
        assert_eq!(err.details().unwrap().error_code, "docker_not_found");
    }

    #[test]
    fn prune_removes_listed_ids() {
        let runtime = MockRuntime::default();
        runtime.push_output(0, "abc123\ndef456\nabc123\n");
        ImagePuller::new(&runtime, "satorinet/satorineuron").prune_dangling();
        let calls = runtime.calls();
        assert_eq!(calls.len(), 2);
        let query = calls[0].join(" ");
        assert!(query.contains("reference=satorinet/satorineuron"));
        assert!(query.contains("dangling=true"));
        assert_eq!(calls[1], vec!["rmi", "abc123", "def456"]);
    }

    #[test]
    fn prune_skips_rmi_when_nothing_dangles() {
        let runtime = MockRuntime::default();
        runtime.push_output(0, "\n");
        ImagePuller::new(&runtime, "satorinet/satorineuron").prune_dangling();
        assert_eq!(runtime.calls().len(), 1);
    }

    #[test]
    fn prune_failure_is_swallowed() {
        let runtime = MockRuntime::default();
        runtime.push_output(1, "");
        ImagePuller::new(&runtime, "satorinet/satorineuron").prune_dangling();
        assert!(!runtime.called_with("rmi"));
    }
}
