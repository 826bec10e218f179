use std::env;
use std::ffi::OsString;
use std::io;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type EnvLookup = fn(&str) -> Option<OsString>;

/// Opens the neuron UI. Must never fail or block the caller.
pub trait Browser {
    fn open(&self, url: &str);
}

pub struct SystemBrowser {
    health_timeout: Duration,
    os: &'static str,
    env_lookup: EnvLookup,
}

impl SystemBrowser {
    pub fn new(health_timeout: Duration) -> Self {
        Self {
            health_timeout,
            os: env::consts::OS,
            env_lookup: |key| env::var_os(key),
        }
    }

    fn spawn_open(&self, url: &str) -> io::Result<JoinHandle<()>> {
        let url = url.to_string();
        let health_timeout = self.health_timeout;
        let os = self.os;
        let env_lookup = self.env_lookup;
        let open = move || open_when_ready(&url, health_timeout, os, env_lookup);
        thread::Builder::new()
            .name("browser".to_string())
            .spawn(open)
    }
}

impl Browser for SystemBrowser {
    fn open(&self, url: &str) {
        if let Err(err) = self.spawn_open(url) {
            tracing::warn!(error = %err, "could not start browser thread");
        }
    }
}

/// Browser disabled by settings.
pub struct NoBrowser;

impl Browser for NoBrowser {
    fn open(&self, url: &str) {
        tracing::info!(%url, "browser disabled; open the UI manually");
    }
}

fn open_when_ready(url: &str, health_timeout: Duration, os: &str, env_lookup: EnvLookup) {
    let Some(opener) = opener_for(os) else {
        tracing::warn!(os, %url, "no known way to open a browser here");
        return;
    };
    if os == "linux" {
        if let Some(notice) = headless_notice(os, url, env_lookup) {
            eprintln!("{notice}");
            return;
        }
        // xdg-open on a UI that is not up yet shows an error page.
        if !wait_until_reachable(url, health_timeout, Duration::from_secs(2)) {
            eprintln!("The neuron UI did not answer yet. Open {url} in a browser once it is up.");
            return;
        }
        if which::which(opener.program).is_err() {
            tracing::warn!(program = opener.program, %url, "browser opener not installed");
            return;
        }
    }
    let mut cmd = Command::new(opener.program);
    cmd.args(opener.args)
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match cmd.status() {
        Ok(status) if status.success() => tracing::info!(%url, "opened browser"),
        Ok(status) => tracing::warn!(%url, %status, "failed to open browser"),
        Err(err) => tracing::warn!(%url, error = %err, "failed to open browser"),
    }
}

/// The message shown instead of opening a browser on a Linux box without a display.
fn headless_notice(os: &str, url: &str, env_lookup: EnvLookup) -> Option<String> {
    if os != "linux" || has_display(env_lookup) {
        return None;
    }
    let notice = format!("GUI environment not detected. Open {url} in a browser.");
    Some(notice)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Opener {
    program: &'static str,
    args: &'static [&'static str],
}

fn opener_for(os: &str) -> Option<Opener> {
    match os {
        "macos" => Some(Opener {
            program: "open",
            args: &[],
        }),
        "windows" => Some(Opener {
            program: "cmd",
            args: &["/C", "start", ""],
        }),
        "linux" | "freebsd" | "openbsd" | "netbsd" => Some(Opener {
            program: "xdg-open",
            args: &[],
        }),
        _ => None,
    }
}

fn has_display(env_lookup: EnvLookup) -> bool {
    ["DISPLAY", "WAYLAND_DISPLAY"]
        .iter()
        .any(|key| env_lookup(key).is_some_and(|value| !value.is_empty()))
}

/// Polls `url` until anything answers over HTTP or `timeout` elapses.
pub fn wait_until_reachable(url: &str, timeout: Duration, interval: Duration) -> bool {
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(error = %err, "could not build http client");
            return false;
        }
    };
    let deadline = Instant::now() + timeout;
    loop {
        if client.get(url).send().is_ok() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(interval.min(deadline - now));
    }
}
