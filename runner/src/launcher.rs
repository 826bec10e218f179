use crate::config::{read_env_mode, Image, RuntimeConfig, MOUNT_SUBDIRS};
use crate::docker::{ContainerRuntime, ManagedProcess};
use crate::error::{docker_spawn_error, RunnerError};
use crate::image::image_reference;

/// Arguments for `docker run`. Same inputs, same invocation.
pub fn run_args(
    version: &str,
    config: &RuntimeConfig,
    env_mode: &str,
    image: &Image,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-t".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        config.container_name.clone(),
        "-p".to_string(),
        format!("{port}:{port}", port = config.port),
    ];
    let mount_root = image.mount_root.trim_end_matches('/');
    for name in MOUNT_SUBDIRS {
        args.push("-v".to_string());
        args.push(format!(
            "{}:{mount_root}/{name}",
            config.mount_dir(name).to_string_lossy()
        ));
    }
    args.push("--env".to_string());
    args.push(format!("ENV={env_mode}"));
    args.push(image_reference(&image.repository, version));
    args.push(image.entrypoint.clone());
    args
}

pub struct ContainerLauncher<'a, R: ContainerRuntime + ?Sized> {
    runtime: &'a R,
    image: &'a Image,
}

impl<'a, R: ContainerRuntime + ?Sized> ContainerLauncher<'a, R> {
    pub fn new(runtime: &'a R, image: &'a Image) -> Self {
        Self { runtime, image }
    }

    pub fn launch(
        &self,
        version: &str,
        config: &RuntimeConfig,
    ) -> Result<ManagedProcess, RunnerError> {
        let env_mode = read_env_mode(&config.env_config_path());
        let args = run_args(version, config, &env_mode, self.image);
        let command = self.runtime.render(&args);
        tracing::info!(%command, env_mode = %env_mode, "launching container");
        self.runtime
            .spawn(&args)
            .map_err(|err| docker_spawn_error(&err, &command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::mock::MockRuntime;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn runtime_config(dir: &Path) -> RuntimeConfig {
        RuntimeConfig::new(24601, &dir.to_string_lossy(), "satorineuron").unwrap()
    }

    #[test]
    fn run_args_bind_port_mounts_and_env() {
        let cfg = RuntimeConfig::new(24601, "/home/op/.satori", "satorineuron").unwrap();
        let args = run_args("v42", &cfg, "prod", &Image::default());
        assert_eq!(
            args,
            vec![
                "run",
                "-t",
                "--rm",
                "--name",
                "satorineuron",
                "-p",
                "24601:24601",
                "-v",
                "/home/op/.satori/wallet:/Satori/Neuron/wallet",
                "-v",
                "/home/op/.satori/config:/Satori/Neuron/config",
                "-v",
                "/home/op/.satori/data:/Satori/Neuron/data",
                "-v",
                "/home/op/.satori/models:/Satori/Neuron/models",
                "--env",
                "ENV=prod",
                "satorinet/satorineuron:v42",
                "./start.sh",
            ]
        );
    }

    #[test]
    fn run_args_are_deterministic() {
        let cfg = RuntimeConfig::new(3000, "/srv/neuron", "neuron-b").unwrap();
        let image = Image::default();
        let first = run_args("latest", &cfg, "staging", &image);
        let second = run_args("latest", &cfg, "staging", &image);
        assert_eq!(first, second);
        assert!(first.contains(&"3000:3000".to_string()));
        assert!(first.contains(&"ENV=staging".to_string()));
    }

    #[test]
    fn launch_reads_env_mode_from_neuron_config() {
        let dir = tempdir().unwrap();
        let cfg = runtime_config(dir.path());
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(cfg.env_config_path(), "env:staging\n").unwrap();

        let runtime = MockRuntime::default();
        let image = Image::default();
        ContainerLauncher::new(&runtime, &image)
            .launch("v42", &cfg)
            .unwrap();
        let calls = runtime.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains(&"ENV=staging".to_string()));
        assert_eq!(calls[0], run_args("v42", &cfg, "staging", &image));
    }

    #[test]
    fn launch_defaults_env_mode_to_prod() {
        let dir = tempdir().unwrap();
        let cfg = runtime_config(dir.path());
        let runtime = MockRuntime::default();
        let image = Image::default();
        ContainerLauncher::new(&runtime, &image)
            .launch("latest", &cfg)
            .unwrap();
        assert!(runtime.calls()[0].contains(&"ENV=prod".to_string()));
    }
}
