use crate::error::RunnerError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const DEFAULT_ENV_MODE: &str = "prod";
pub const MOUNT_SUBDIRS: [&str; 4] = ["wallet", "config", "data", "models"];

/// Invocation parameters, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub port: u16,
    pub install_dir: PathBuf,
    pub container_name: String,
}

impl RuntimeConfig {
    pub fn new(port: u16, install_dir: &str, container_name: &str) -> Result<Self, RunnerError> {
        if port == 0 {
            return Err(RunnerError::Config(
            "port must be between 1 and 65535".to_string(),
        ));
        }
        let container_name = container_name.trim();
        if container_name.is_empty() {
            return Err(RunnerError::Config(
            "container name must not be empty".to_string(),
        ));
        }
        let expanded = PathBuf::from(expand_path(install_dir.trim()));
        let install_dir = if expanded.is_absolute() {
            expanded
        } else {
            env::current_dir()?.join(expanded)
        };
        Ok(Self {
            port,
            install_dir,
            container_name: container_name.to_string(),
        })
    }

    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn mount_dir(&self, name: &str) -> PathBuf {
        self.install_dir.join(name)
    }

    pub fn env_config_path(&self) -> PathBuf {
        self.install_dir.join("config").join("config.yaml")
    }

    pub fn relay_log_path(&self) -> PathBuf {
        self.install_dir.join("relay.log")
    }
}

/// Runner settings. `version` is required; every section falls back to its defaults.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    #[serde(default)]
    pub image: Image,
    #[serde(default)]
    pub version_endpoint: VersionEndpoint,
    #[serde(default)]
    pub docker: Docker,
    #[serde(default)]
    pub browser: Browser,
    #[serde(default)]
    pub relay: Relay,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Image {
    pub repository: String,
    pub default_tag: String,
    pub entrypoint: String,
    pub mount_root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VersionEndpoint {
    pub url: String,
    pub timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Docker {
    pub binary: String,
    pub ready_timeout_sec: u64,
    pub ready_poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Browser {
    pub enabled: bool,
    pub health_timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Relay {
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            image: Image::default(),
            version_endpoint: VersionEndpoint::default(),
            docker: Docker::default(),
            browser: Browser::default(),
            relay: Relay::default(),
        }
    }
}

impl Default for Image {
    fn default() -> Self {
        Self {
            repository: "satorinet/satorineuron".to_string(),
            default_tag: "latest".to_string(),
            entrypoint: "./start.sh".to_string(),
            mount_root: "/Satori/Neuron".to_string(),
        }
    }
}

impl Default for VersionEndpoint {
    fn default() -> Self {
        Self {
            url: "https://satorinet.io/version/docker".to_string(),
            timeout_sec: 10,
        }
    }
}

impl Default for Docker {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            ready_timeout_sec: 60,
            ready_poll_interval_ms: 2000,
        }
    }
}

impl Default for Browser {
    fn default() -> Self {
        Self {
            enabled: true,
            health_timeout_sec: 120,
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "satori-synapse".to_string(),
            args: Vec::new(),
        }
    }
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("NEURON_RUNNER_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("NEURON_RUNNER_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("neuron-runner");
    base
}

pub fn read_config_from_str(content: &str) -> Result<Config, RunnerError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, RunnerError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// Reads the settings file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<Config, RunnerError> {
    if path.exists() {
        read_config(path)
    } else {
        Ok(Config::default())
    }
}

fn validate_config(cfg: &Config) -> Result<(), RunnerError> {
    if cfg.version != 1 {
        return Err(RunnerError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    if cfg.image.repository.trim().is_empty() {
        return Err(RunnerError::Config(
            "image.repository must not be empty".to_string(),
        ));
    }
    if cfg.image.default_tag.trim().is_empty() {
        return Err(RunnerError::Config(
            "image.default_tag must not be empty".to_string(),
        ));
    }
    if cfg.docker.binary.trim().is_empty() {
        return Err(RunnerError::Config(
            "docker.binary must not be empty".to_string(),
        ));
    }
    if cfg.version_endpoint.timeout_sec == 0
        || cfg.docker.ready_timeout_sec == 0
        || cfg.browser.health_timeout_sec == 0
    {
        return Err(RunnerError::Config(
            "timeouts must be greater than zero".to_string(),
        ));
    }
    if cfg.docker.ready_poll_interval_ms == 0 {
        return Err(RunnerError::Config(
            "docker.ready_poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

pub fn ensure_parent(path: &Path) -> Result<(), RunnerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    if input == "~" {
        if let Some(home) = home_dir() {
            return home.to_string_lossy().to_string();
        }
    }
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

/// Creates the install directory and the four subdirectories mounted into the container.
pub fn setup_install_dir(config: &RuntimeConfig) -> Result<(), RunnerError> {
    for name in MOUNT_SUBDIRS {
        fs::create_dir_all(config.mount_dir(name))?;
    }
    Ok(())
}

/// Deployment mode handed to the container as `ENV`.
///
/// The first line starting with `env:` wins and its value is the text between
/// the first and second colon. Anything missing or blank means `prod`.
pub fn read_env_mode(path: &Path) -> String {
    match fs::File::open(path) {
        Ok(file) => env_mode_from_reader(BufReader::new(file)),
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "could not read neuron config");
            }
            DEFAULT_ENV_MODE.to_string()
        }
    }
}

fn env_mode_from_reader<R: BufRead>(reader: R) -> String {
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.starts_with("env:") {
            let value = line.split(':').nth(1).unwrap_or_default().trim();
            if value.is_empty() {
                break;
            }
            return value.to_string();
        }
    }
    DEFAULT_ENV_MODE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_unknown_field_errors() {
        let yaml = r#"
version: 1
unknown: true
"#;
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1").expect("config");
        assert_eq!(cfg.image.repository, "satorinet/satorineuron");
        assert_eq!(cfg.image.default_tag, "latest");
        assert_eq!(cfg.version_endpoint.timeout_sec, 10);
        assert_eq!(cfg.docker.ready_timeout_sec, 60);
        assert!(cfg.relay.enabled);
    }

    #[test]
    fn default_template_matches_defaults() {
        let cfg = read_config_from_str(DEFAULT_CONFIG_YAML).expect("template");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn config_rejects_zero_timeouts_and_other_versions() {
        let err = read_config_from_str("version: 1\ndocker:\n  ready_timeout_sec: 0\n")
            .expect_err("zero timeout");
        assert!(err.to_string().contains("greater than zero"));

        let err = read_config_from_str("version: 2").expect_err("version");
        assert!(err.to_string().contains("unsupported config version 2"));
    }

    #[test]
    fn config_without_version_is_rejected() {
        let err = read_config_from_str("image:\n  default_tag: v1\n").expect_err("no version");
        assert!(err.to_string().contains("missing field `version`"));
    }

    #[test]
    fn missing_settings_file_means_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load_config(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn expand_tilde_works() {
        let expanded = expand_path("~/.satori");
        assert!(!expanded.starts_with("~/"));
        assert!(expanded.ends_with(".satori"));
    }

    #[test]
    fn runtime_config_is_absolute_and_validated() {
        let cfg = RuntimeConfig::new(24601, "relative/install", "satorineuron").unwrap();
        assert!(cfg.install_dir.is_absolute());
        assert_eq!(cfg.local_url(), "http://127.0.0.1:24601");

        assert!(RuntimeConfig::new(0, "/tmp/x", "satorineuron").is_err());
        assert!(RuntimeConfig::new(80, "/tmp/x", "  ").is_err());
    }

    #[test]
    fn setup_creates_mount_directories() {
        let dir = tempdir().unwrap();
        let cfg =
            RuntimeConfig::new(24601, &dir.path().join("satori").to_string_lossy(), "n").unwrap();
        setup_install_dir(&cfg).unwrap();
        for name in MOUNT_SUBDIRS {
            assert!(cfg.mount_dir(name).is_dir(), "{name} missing");
        }
        // second call is a no-op
        setup_install_dir(&cfg).unwrap();
    }

    #[test]
    fn env_mode_defaults_to_prod_when_file_absent() {
        let dir = tempdir().unwrap();
        assert_eq!(read_env_mode(&dir.path().join("config.yaml")), "prod");
    }

    #[test]
    fn env_mode_reads_env_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "wallet: x\nenv:staging\nenv: dev\n").unwrap();
        assert_eq!(read_env_mode(&path), "staging");

        fs::write(&path, "env: dev \n").unwrap();
        assert_eq!(read_env_mode(&path), "dev");
    }

    #[test]
    fn env_mode_ignores_indented_and_blank_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "  env: nested\n").unwrap();
        assert_eq!(read_env_mode(&path), "prod");

        fs::write(&path, "env:\n").unwrap();
        assert_eq!(read_env_mode(&path), "prod");
    }
}
