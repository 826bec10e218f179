mod browser;
mod config;
mod docker;
mod error;
mod image;
mod launcher;
mod output;
mod relay;
mod shutdown;
mod supervisor;
mod version;

use crate::browser::{Browser, NoBrowser, SystemBrowser};
use crate::config::{
    ensure_parent, load_config, read_config, read_env_mode, resolve_config_path, RuntimeConfig,
    DEFAULT_CONFIG_YAML,
};
use crate::docker::{ContainerRuntime, DockerCli};
use crate::error::{classify_docker_failure, docker_spawn_error, ProcessErrorDetails, RunnerError};
use crate::relay::ProcessRelay;
use crate::shutdown::{install_container_stop_hook, stop_args};
use crate::supervisor::Supervisor;
use crate::version::{VersionResolver, VersionSource};
use clap::{ArgAction, Parser, Subcommand};
use dialoguer::console::style;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "neuron-runner",
    version,
    about = "Pulls, runs and watches the neuron container"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(
        long,
        global = true,
        default_value_t = 24601,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    port: u16,
    #[arg(long = "install-dir", global = true, default_value = "~/.satori")]
    install_dir: String,
    #[arg(long = "container-name", global = true, default_value = "satorineuron")]
    container_name: String,
    /// Raise log verbosity (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install, pull and run the neuron (default)
    Run {
        #[arg(long)]
        no_browser: bool,
        #[arg(long)]
        no_relay: bool,
    },
    /// Print the image version a run would use
    ResolveVersion,
    Doctor,
    /// Stop the neuron container
    Stop,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
    port: u16,
    install_dir: String,
    container_name: String,
}

impl Context {
    fn runtime_config(&self) -> Result<RuntimeConfig, RunnerError> {
        RuntimeConfig::new(self.port, &self.install_dir, &self.container_name)
    }
}

fn main() -> Result<(), RunnerError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let ctx = build_context(&cli);

    let command = cli.command.unwrap_or(Commands::Run {
        no_browser: false,
        no_relay: false,
    });
    let result = match command {
        Commands::Run {
            no_browser,
            no_relay,
        } => handle_run(&ctx, no_browser, no_relay),
        Commands::ResolveVersion => handle_resolve_version(&ctx),
        Commands::Doctor => handle_doctor(&ctx),
        Commands::Stop => handle_stop(&ctx),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.details(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
        port: cli.port,
        install_dir: cli.install_dir.clone(),
        container_name: cli.container_name.clone(),
    }
}

fn print_welcome(config: &RuntimeConfig) {
    let rule = "#".repeat(64);
    println!("{}", style(&rule).cyan());
    println!("{}", style("  Starting the neuron").bold());
    println!("  Keep this window open or the neuron will stop.");
    println!("  The UI opens in your browser once it is ready:");
    println!("  {}", style(config.local_url()).green());
    println!("{}", style(&rule).cyan());
    println!();
    println!("Please make sure that Docker is already running.");
    println!("Hold tight, this may take several minutes...");
    println!();
}

fn handle_run(ctx: &Context, no_browser: bool, no_relay: bool) -> Result<(), RunnerError> {
    let settings = load_config(&ctx.config_path)?;
    let config = ctx.runtime_config()?;
    if !ctx.json {
        print_welcome(&config);
    }

    let runtime = DockerCli::new(&settings.docker.binary);
    let versions = VersionResolver::from_config(&settings);
    let system_browser =
        SystemBrowser::new(Duration::from_secs(settings.browser.health_timeout_sec));
    let browser: &dyn Browser = if no_browser || !settings.browser.enabled {
        &NoBrowser
    } else {
        &system_browser
    };

    let mut supervisor = Supervisor::new(&config, &settings, &runtime, &versions, browser);
    if settings.relay.enabled && !no_relay {
        supervisor = supervisor.with_relay(
            Arc::new(ProcessRelay::from_settings(&settings.relay)),
            env::current_exe()?,
        );
    }
    if let Err(err) = install_container_stop_hook(
        &settings.docker.binary,
        &config.container_name,
        supervisor.relay_shutdown(),
    ) {
        tracing::warn!(error = %err, "could not install shutdown hook");
    }

    // keep stdout clean for the JSON report
    let supervision = if ctx.json {
        supervisor.run(&mut io::stderr())?
    } else {
        supervisor.run(&mut io::stdout())?
    };
    if let Some(relay) = supervision.relay {
        if relay.is_running() {
            tracing::info!("stopping relay");
        }
        if !relay.shutdown(Duration::from_secs(2)) {
            tracing::debug!("relay still running at exit");
        }
    }

    let report = supervision.report;
    if report.failed() {
        let message = report
            .message
            .clone()
            .unwrap_or_else(|| "the neuron stopped unexpectedly".to_string());
        if ctx.json {
            print_json(&JsonResult {
                ok: false,
                result: Some(&report),
                error: Some(message),
                error_details: None,
            })?;
        } else {
            eprintln!();
            eprintln!("{}", style(message).red().bold());
        }
        std::process::exit(1);
    }
    if ctx.json {
        return output(ctx, serde_json::to_value(&report)?);
    }
    println!("Neuron container stopped.");
    Ok(())
}

fn handle_resolve_version(ctx: &Context) -> Result<(), RunnerError> {
    let settings = load_config(&ctx.config_path)?;
    let version = VersionResolver::from_config(&settings).resolve();
    if ctx.json {
        let payload = json!({
            "version": version,
            "image": format!("{}:{}", settings.image.repository, version),
        });
        return output(ctx, payload);
    }
    println!("{version}");
    Ok(())
}

fn install_dir_writable(config: &RuntimeConfig) -> bool {
    let marker = config.install_dir.join(".neuron_runner_write_test");
    let written = fs::create_dir_all(&config.install_dir)
        .and_then(|_| fs::write(&marker, b"ok"))
        .and_then(|_| fs::remove_file(&marker));
    written.is_ok()
}

fn handle_doctor(ctx: &Context) -> Result<(), RunnerError> {
    let settings = load_config(&ctx.config_path)?;
    let config = ctx.runtime_config()?;
    let mut checks = BTreeMap::new();

    let docker_on_path = which::which(&settings.docker.binary).is_ok();
    checks.insert("docker_on_path".to_string(), docker_on_path);

    let ready_timeout = Duration::from_secs(settings.docker.ready_timeout_sec);
    let daemon_ok = docker_on_path
        && DockerCli::new(&settings.docker.binary)
            .status_within(&["info".to_string()], ready_timeout)
            .map(|status| status == Some(0))
            .unwrap_or(false);
    checks.insert("docker_daemon".to_string(), daemon_ok);

    let install_ok = install_dir_writable(&config);
    checks.insert("install_dir_writable".to_string(), install_ok);

    let env_mode = read_env_mode(&config.env_config_path());
    let ok = docker_on_path && daemon_ok && install_ok;
    let error = if ok {
        None
    } else if !docker_on_path {
        Some("docker is not available".to_string())
    } else if !daemon_ok {
        Some("docker daemon is not running".to_string())
    } else {
        Some("install dir is not writable".to_string())
    };

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({
                "checks": checks,
                "env_mode": env_mode,
                "install_dir": config.install_dir,
                "local_url": config.local_url(),
            })),
            error,
            error_details: None,
        };
        print_json(&payload)?;
        return Ok(());
    }

    let mark = |value: bool| {
        if value {
            style("ok").green()
        } else {
            style("failed").red()
        }
    };
    println!("Docker on PATH: {}", mark(docker_on_path));
    println!("Docker daemon: {}", mark(daemon_ok));
    println!(
        "Install dir writable: {} ({})",
        mark(install_ok),
        config.install_dir.display()
    );
    println!("Neuron env mode: {env_mode}");
    match error {
        Some(message) => Err(RunnerError::Process(message)),
        None => Ok(()),
    }
}

fn handle_stop(ctx: &Context) -> Result<(), RunnerError> {
    let settings = load_config(&ctx.config_path)?;
    let config = ctx.runtime_config()?;
    let runtime = DockerCli::new(&settings.docker.binary);
    let args = stop_args(&config.container_name);
    let command = runtime.render(&args);
    let cmd_output = runtime
        .run(&args)
        .map_err(|err| docker_spawn_error(&err, &command))?;
    if !cmd_output.success() {
        let stderr = String::from_utf8_lossy(&cmd_output.stderr)
            .trim()
            .to_string();
        let (error_code, hint) = classify_docker_failure(&stderr);
        let mut message = format!(
            "command failed with status {} while running `{}`",
            cmd_output.status_code, command
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        if let Some(ref hint_message) = hint {
            message = format!("{message}\nHint: {hint_message}");
        }
        return Err(RunnerError::ProcessDetailed {
            message,
            details: ProcessErrorDetails {
                error_code,
                hint,
                command: Some(command),
                raw_stderr: Some(stderr).filter(|text| !text.is_empty()),
            },
        });
    }
    let payload = json!({"action": "stop", "container": config.container_name});
    output(ctx, payload)
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), RunnerError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            if ctx.json {
                return output(ctx, serde_json::to_value(&cfg)?);
            }
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
    }
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), RunnerError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), RunnerError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
